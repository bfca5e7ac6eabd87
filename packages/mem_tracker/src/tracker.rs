//! The tracking subsystem handle: lifecycle, recorder routing and queries.

use std::fmt;
use std::io;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, AtomicUsize};
use std::thread::ThreadId;
use std::time::Duration;

use parking_lot::Mutex;

use crate::baseline::Baseline;
use crate::callsite;
use crate::error::{Error, Result, ShutdownReason};
use crate::options::TrackingLevel;
use crate::record::EventRecord;
use crate::recorder::{DEFAULT_RECORDER_CAPACITY, Recorder, RecorderCounters};
use crate::report::{DiffReport, UsageReport};
use crate::sequence::SequenceGenerator;
use crate::snapshot::Snapshot;
use crate::stacks::RecorderStack;
use crate::thread::{self, RuntimeThread, ThreadRegistry};
use crate::worker::GenerationRing;

// The pool never holds more than this many recorders per known thread.
pub(crate) const POOL_SIZE_RATIO: usize = 2;

// Assumed thread count until the first safepoint walk reports a real one.
const INITIAL_THREAD_COUNT: usize = 255;

/// Lifecycle state of the tracking subsystem.
///
/// States advance monotonically; the only contended transition is
/// `Started → ShutdownPending`, which is claimed by compare-and-swap so that
/// exactly one shutdown initiator latches its reason.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[repr(u8)]
pub enum TrackerState {
    /// Not yet bootstrapped.
    Uninit = 0,
    /// Collecting events while the process is still single-threaded.
    BootstrappingSingleThread,
    /// Collecting events; the process may now spawn threads.
    BootstrappingMultiThread,
    /// Fully started: the merge worker is running.
    Started,
    /// Shutdown requested; components are winding down.
    ShutdownPending,
    /// The worker has finished; awaiting the final safepoint cleanup.
    FinalShutdown,
    /// Fully shut down.
    Shutdown,
}

impl TrackerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::BootstrappingSingleThread,
            2 => Self::BootstrappingMultiThread,
            3 => Self::Started,
            4 => Self::ShutdownPending,
            5 => Self::FinalShutdown,
            6 => Self::Shutdown,
            _ => Self::Uninit,
        }
    }
}

/// Construction-time knobs for a tracker instance.
#[derive(Clone)]
pub struct TrackerConfig {
    /// Records per recorder before it is handed to the pending queue.
    pub recorder_capacity: NonZeroUsize,

    /// Whether the tracker shuts itself down when the merge worker cannot
    /// keep up. When `false`, event-recording threads are slowed down
    /// instead.
    pub auto_shutdown: bool,

    /// The embedding runtime allocates everything through `malloc`; tracking
    /// the resulting event volume is not supported.
    pub malloc_only: bool,

    /// Asks the embedding runtime to force a safepoint. Used by
    /// [`MemTracker::wait_for_data_merge`] when the worker is idle but the
    /// generation has not advanced.
    pub safepoint_request: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            recorder_capacity: DEFAULT_RECORDER_CAPACITY,
            auto_shutdown: true,
            malloc_only: false,
            safepoint_request: None,
        }
    }
}

impl fmt::Debug for TrackerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackerConfig")
            .field("recorder_capacity", &self.recorder_capacity)
            .field("auto_shutdown", &self.auto_shutdown)
            .field("malloc_only", &self.malloc_only)
            .field(
                "safepoint_request",
                &self.safepoint_request.as_ref().map(|_| "<callback>"),
            )
            .finish()
    }
}

/// Diagnostic counters describing the tracker's own footprint and activity.
#[derive(Clone, Copy, Debug, Default)]
pub struct TrackerStats {
    /// Live recorder instances, wherever they currently sit.
    pub instance_count: usize,
    /// Recorders waiting in the reuse pool.
    pub pooled_count: usize,
    /// Recorders queued for the merge worker.
    pub pending_count: usize,
    /// Thread count observed at the latest safepoint walk.
    pub thread_count: usize,
    /// Safepoint drains performed so far.
    pub sync_point_count: u64,
    /// Recorders merged into the snapshot so far.
    pub merge_count: u64,
    /// Generation ring slots currently occupied.
    pub generations_in_use: usize,
    /// Sequence numbers handed out so far in the current generation.
    pub sequences_in_use: u32,
    /// The generation currently accumulating events.
    pub generation: u64,
}

// State shared under the process-wide critical section: the global recorder
// used by threads that cannot have a per-thread slot, and the generation ring
// the drain hands batches through.
#[derive(Debug)]
pub(crate) struct CriticalState {
    pub(crate) global_recorder: Option<Box<Recorder>>,
    pub(crate) generations: GenerationRing,
}

#[derive(Debug, Default)]
struct QueryState {
    baseline: Baseline,
}

static NEXT_TRACKER_ID: AtomicU64 = AtomicU64::new(1);

/// The native memory tracking subsystem.
///
/// One instance serves one embedding runtime; construct it during startup,
/// share it via [`Arc`], and drive it through the lifecycle:
/// [`bootstrap_single_thread`](Self::bootstrap_single_thread) →
/// [`bootstrap_multi_thread`](Self::bootstrap_multi_thread) →
/// [`start`](Self::start). The runtime then reports memory events through
/// [`tracker`](Self::tracker) handles (or the `record_*` convenience
/// methods) and calls [`sync`](Self::sync) at every safepoint.
#[derive(Debug)]
pub struct MemTracker {
    id: u64,
    level: AtomicU8,
    track_callsite: AtomicBool,
    state: AtomicU8,
    reason: AtomicU8,
    config: TrackerConfig,
    main_thread: Mutex<Option<ThreadId>>,

    pub(crate) counters: Arc<RecorderCounters>,
    pub(crate) seqgen: SequenceGenerator,
    pub(crate) registry: ThreadRegistry,
    pub(crate) critical: Mutex<CriticalState>,
    pub(crate) pending: RecorderStack,
    pool: RecorderStack,

    pub(crate) thread_count: AtomicUsize,
    pub(crate) sync_skip_count: AtomicU32,
    slowdown: AtomicBool,
    pending_ops: AtomicU32,
    auto_shutdown: AtomicBool,
    class_count: AtomicUsize,

    pub(crate) processing_generation: AtomicU64,
    pub(crate) worker_idle: AtomicBool,
    pub(crate) generations_in_use: AtomicUsize,
    pub(crate) sync_point_count: AtomicU64,
    pub(crate) merge_count: AtomicU64,

    snapshot_slot: Mutex<Option<Arc<Snapshot>>>,
    query: Mutex<QueryState>,
    pub(crate) worker_handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl MemTracker {
    /// Creates a tracker from the runtime's option string
    /// (`=off`, `=summary` or `=detail`) with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`](crate::Error::Configuration) for any
    /// other option string.
    pub fn init_options(option_line: &str) -> Result<Arc<Self>> {
        let level = TrackingLevel::parse_option_line(option_line)?;
        Ok(Self::with_config(level, TrackerConfig::default()))
    }

    /// Creates a tracker at the given level with default configuration.
    #[must_use]
    pub fn new(level: TrackingLevel) -> Arc<Self> {
        Self::with_config(level, TrackerConfig::default())
    }

    /// Creates a tracker with explicit configuration.
    #[must_use]
    pub fn with_config(level: TrackingLevel, config: TrackerConfig) -> Arc<Self> {
        let auto_shutdown = config.auto_shutdown;
        Arc::new(Self {
            id: NEXT_TRACKER_ID.fetch_add(1, atomic::Ordering::Relaxed),
            level: AtomicU8::new(level as u8),
            track_callsite: AtomicBool::new(false),
            state: AtomicU8::new(TrackerState::Uninit as u8),
            reason: AtomicU8::new(ShutdownReason::None as u8),
            config,
            main_thread: Mutex::new(None),
            counters: Arc::new(RecorderCounters::default()),
            seqgen: SequenceGenerator::new(),
            registry: ThreadRegistry::new(),
            critical: Mutex::new(CriticalState {
                global_recorder: None,
                generations: GenerationRing::new(),
            }),
            pending: RecorderStack::new(),
            pool: RecorderStack::new(),
            thread_count: AtomicUsize::new(INITIAL_THREAD_COUNT),
            sync_skip_count: AtomicU32::new(0),
            slowdown: AtomicBool::new(false),
            pending_ops: AtomicU32::new(0),
            auto_shutdown: AtomicBool::new(auto_shutdown),
            class_count: AtomicUsize::new(0),
            processing_generation: AtomicU64::new(0),
            worker_idle: AtomicBool::new(false),
            generations_in_use: AtomicUsize::new(1),
            sync_point_count: AtomicU64::new(0),
            merge_count: AtomicU64::new(0),
            snapshot_slot: Mutex::new(None),
            query: Mutex::new(QueryState::default()),
            worker_handle: Mutex::new(None),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// The configured tracking level. Becomes [`TrackingLevel::Off`] once
    /// shutdown completes.
    #[must_use]
    pub fn tracking_level(&self) -> TrackingLevel {
        TrackingLevel::from_u8(self.level.load(atomic::Ordering::Relaxed))
    }

    /// The current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TrackerState {
        TrackerState::from_u8(self.state.load(atomic::Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: TrackerState) {
        self.state.store(state as u8, atomic::Ordering::Release);
    }

    /// Whether events are currently being recorded.
    #[must_use]
    pub fn is_on(&self) -> bool {
        self.tracking_level() >= TrackingLevel::Summary
            && self.state() >= TrackerState::BootstrappingSingleThread
    }

    /// Whether a shutdown has been requested or completed.
    #[must_use]
    pub fn shutdown_in_progress(&self) -> bool {
        self.state() >= TrackerState::ShutdownPending
    }

    /// The latched shutdown reason. Its `Display` form is the user-visible
    /// explanation.
    #[must_use]
    pub fn reason(&self) -> ShutdownReason {
        ShutdownReason::from_u8(self.reason.load(atomic::Ordering::Relaxed))
    }

    /// Whether records carry call-site information.
    #[must_use]
    pub fn track_callsite(&self) -> bool {
        self.track_callsite.load(atomic::Ordering::Relaxed)
    }

    pub(crate) fn is_single_threaded_bootstrap(&self) -> bool {
        self.state() == TrackerState::BootstrappingSingleThread
    }

    pub(crate) fn disable_tracking(&self) {
        self.level
            .store(TrackingLevel::Off as u8, atomic::Ordering::Relaxed);
        self.track_callsite.store(false, atomic::Ordering::Relaxed);
    }

    fn refresh_track_callsite(&self) {
        let enabled =
            self.tracking_level() == TrackingLevel::Detail && callsite::can_walk_stack();
        self.track_callsite.store(enabled, atomic::Ordering::Relaxed);
    }

    // ----- lifecycle ------------------------------------------------------

    /// First bootstrap phase, while the process is still single-threaded.
    pub fn bootstrap_single_thread(&self) {
        if self.tracking_level() == TrackingLevel::Off {
            return;
        }
        debug_assert_eq!(self.state(), TrackerState::Uninit, "wrong state");

        // The event volume of a malloc-only runtime cannot be absorbed
        // without significantly slowing it down.
        if self.config.malloc_only {
            self.shutdown(ShutdownReason::UseMallocOnly);
            return;
        }

        *self.main_thread.lock() = Some(std::thread::current().id());
        self.set_state(TrackerState::BootstrappingSingleThread);
        self.refresh_track_callsite();
        tracing::debug!("memory tracking bootstrapped (single thread)");
    }

    /// Second bootstrap phase, as the process is about to go multi-threaded.
    pub fn bootstrap_multi_thread(&self) {
        if self.tracking_level() > TrackingLevel::Off
            && self.state() == TrackerState::BootstrappingSingleThread
        {
            debug_assert_eq!(
                *self.main_thread.lock(),
                Some(std::thread::current().id()),
                "wrong thread"
            );
            self.set_state(TrackerState::BootstrappingMultiThread);
            self.refresh_track_callsite();
        }
    }

    /// Constructs the snapshot and launches the merge worker.
    ///
    /// A tracker that is configured off (or already shutting down) starts
    /// nothing and returns `Ok`. On failure the subsystem shuts itself down
    /// with reason `Initialization` and the underlying error is returned.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.tracking_level() == TrackingLevel::Off || self.shutdown_in_progress() {
            return Ok(());
        }
        debug_assert_eq!(
            self.state(),
            TrackerState::BootstrappingMultiThread,
            "wrong state"
        );

        let snapshot = Arc::new(Snapshot::new());
        if snapshot.out_of_memory() {
            self.shutdown(ShutdownReason::Initialization);
            return Err(Error::WorkerStart {
                source: io::Error::new(io::ErrorKind::OutOfMemory, "snapshot allocation failed"),
            });
        }

        match crate::worker::spawn_worker(Arc::clone(self), Arc::clone(&snapshot)) {
            Ok(handle) => {
                *self.snapshot_slot.lock() = Some(snapshot);
                *self.worker_handle.lock() = Some(handle);
                self.set_state(TrackerState::Started);
                self.refresh_track_callsite();
                tracing::debug!("memory tracking started");
                Ok(())
            }
            Err(source) => {
                self.shutdown(ShutdownReason::Initialization);
                Err(Error::WorkerStart { source })
            }
        }
    }

    /// Requests shutdown. The first caller to transition the state latches
    /// its reason; the actual teardown is performed cooperatively by the
    /// worker and the following safepoints.
    pub fn shutdown(&self, reason: ShutdownReason) {
        if self.tracking_level() == TrackingLevel::Off {
            return;
        }

        // Exactly one initiator wins the transition into ShutdownPending and
        // latches its reason; later requests are ignored.
        let initiated = loop {
            let current = self.state.load(atomic::Ordering::Acquire);
            if current >= TrackerState::ShutdownPending as u8 {
                break false;
            }
            if self
                .state
                .compare_exchange(
                    current,
                    TrackerState::ShutdownPending as u8,
                    atomic::Ordering::AcqRel,
                    atomic::Ordering::Acquire,
                )
                .is_ok()
            {
                break true;
            }
        };

        if initiated {
            self.reason.store(reason as u8, atomic::Ordering::Relaxed);
            tracing::warn!("{reason}");
        }

        // Wake the worker so it notices the state change promptly.
        if let Some(snapshot) = self.snapshot_slot.lock().as_ref() {
            snapshot.notify();
        }
    }

    /// Final teardown, run on the worker thread after its loop exits.
    pub(crate) fn final_shutdown(&self) {
        drop(self.pending.drain());
        drop(self.pool.drain());

        {
            // The baseline and snapshot are the only state queries read;
            // clear both under the query lock.
            let mut query = self.query.lock();
            query.baseline.clear();
            if let Some(snapshot) = self.snapshot_slot.lock().take() {
                snapshot.clear();
            }
        }

        callsite::shutdown_decoder();
        self.set_state(TrackerState::FinalShutdown);
        tracing::debug!("memory tracking entered final shutdown");
    }

    // ----- load management ------------------------------------------------

    /// Lets the tracker slow the calling thread down when the merge worker
    /// is lagging behind.
    pub(crate) fn check_load(&self) {
        if self.slowdown.load(atomic::Ordering::Relaxed) {
            std::thread::yield_now();
        }
    }

    pub(crate) fn set_slowdown(&self, value: bool) {
        self.slowdown.store(value, atomic::Ordering::Relaxed);
    }

    /// Controls automatic shutdown under memory pressure. With auto-shutdown
    /// off, the tracker slows event-recording threads instead of giving up.
    pub fn set_auto_shutdown(&self, value: bool) {
        self.auto_shutdown.store(value, atomic::Ordering::Relaxed);
        if value {
            self.set_slowdown(false);
        }
    }

    pub(crate) fn auto_shutdown(&self) -> bool {
        self.auto_shutdown.load(atomic::Ordering::Relaxed)
    }

    /// Publishes the number of loaded classes; captured with each generation
    /// for report context.
    pub fn set_class_count(&self, count: usize) {
        self.class_count.store(count, atomic::Ordering::Relaxed);
    }

    pub(crate) fn class_count(&self) -> usize {
        self.class_count.load(atomic::Ordering::Relaxed)
    }

    pub(crate) fn inc_pending_ops(&self) {
        self.pending_ops.fetch_add(1, atomic::Ordering::Relaxed);
    }

    pub(crate) fn dec_pending_ops(&self) {
        let previous = self.pending_ops.fetch_sub(1, atomic::Ordering::Relaxed);
        debug_assert!(previous > 0, "pending operation count underflow");
    }

    /// Number of release-class operations holding a pre-reserved sequence
    /// number right now.
    #[must_use]
    pub fn pending_op_count(&self) -> usize {
        self.pending_ops.load(atomic::Ordering::Relaxed) as usize
    }

    // ----- threads --------------------------------------------------------

    /// Registers the calling OS thread as a cooperative runtime thread and
    /// makes it the thread-local default for subsequent events.
    pub fn attach_thread(&self) -> Arc<RuntimeThread> {
        let registered = self.registry.register(self.id);
        thread::set_current(Arc::clone(&registered));
        registered
    }

    /// Surrenders the exiting thread's recorder to the pending queue and
    /// removes the thread from the registry.
    pub fn thread_exiting(&self, exiting: &Arc<RuntimeThread>) {
        if self.is_on()
            && let Some(recorder) = exiting.slot.take()
        {
            self.enqueue_pending(recorder);
        }
        self.registry.unregister(exiting);
        thread::clear_current(self.id);
    }

    // ----- recorder management --------------------------------------------

    fn new_or_pooled_recorder(&self) -> Box<Recorder> {
        let generation = self.seqgen.current_generation();
        if let Some(mut pooled) = self.pool.pop() {
            pooled.set_generation(generation);
            pooled
        } else {
            Recorder::new(
                self.config.recorder_capacity,
                generation,
                Arc::clone(&self.counters),
            )
        }
    }

    /// Returns a recorder to the pool, or drops it if the pool is at its
    /// bound or the subsystem is winding down.
    pub(crate) fn release_recorder(&self, mut recorder: Box<Recorder>) {
        let pool_max = self
            .thread_count
            .load(atomic::Ordering::Relaxed)
            .saturating_mul(POOL_SIZE_RATIO);
        if self.shutdown_in_progress() || self.pool.len() >= pool_max {
            return;
        }
        recorder.clear();
        self.pool.push(recorder);
    }

    /// Queues a recorder for the merge worker. During shutdown the recorder
    /// is dropped instead; its events are lost by design.
    pub(crate) fn enqueue_pending(&self, recorder: Box<Recorder>) {
        if self.shutdown_in_progress() {
            return;
        }
        self.pending.push(recorder);
    }

    /// Writes one record into the proper recorder.
    ///
    /// Events from registered threads go to the per-thread recorder; all
    /// others go to the global recorder, which lives under the critical
    /// section. Callers that already hold the critical section pass it in;
    /// otherwise it is acquired here only if the global route needs it.
    pub(crate) fn write_record(
        &self,
        critical: Option<&mut CriticalState>,
        target: Option<&RuntimeThread>,
        record: EventRecord,
    ) {
        if let Some(target) = target {
            let recorder = match target.slot.take() {
                Some(existing) => Some(existing),
                None if self.shutdown_in_progress() => None,
                None => Some(self.new_or_pooled_recorder()),
            };
            let Some(mut recorder) = recorder else {
                return;
            };

            let appended = recorder.record(record);
            debug_assert!(appended, "per-thread recorder was already full");
            if recorder.is_full() {
                self.enqueue_pending(recorder);
            } else {
                target.slot.install(recorder);
            }
            return;
        }

        match critical {
            Some(state) => self.write_global_record(state, record),
            None => {
                let mut state = self.critical.lock();
                self.write_global_record(&mut state, record);
            }
        }
    }

    fn write_global_record(&self, state: &mut CriticalState, record: EventRecord) {
        let recorder = match state.global_recorder.take() {
            Some(existing) => Some(existing),
            None if self.shutdown_in_progress() => None,
            None => Some(self.new_or_pooled_recorder()),
        };
        let Some(mut recorder) = recorder else {
            return;
        };

        let appended = recorder.record(record);
        debug_assert!(appended, "global recorder was already full");
        if recorder.is_full() {
            self.enqueue_pending(recorder);
        } else {
            state.global_recorder = Some(recorder);
        }
    }

    // ----- worker liaison -------------------------------------------------

    pub(crate) fn set_processing_generation(&self, generation: u64) {
        self.worker_idle.store(false, atomic::Ordering::Relaxed);
        self.processing_generation
            .store(generation, atomic::Ordering::Release);
    }

    pub(crate) fn report_worker_idle(&self) {
        self.worker_idle.store(true, atomic::Ordering::Relaxed);
    }

    pub(crate) fn get_snapshot(&self) -> Option<Arc<Snapshot>> {
        if self.shutdown_in_progress() {
            return None;
        }
        self.snapshot_slot.lock().clone()
    }

    // ----- queries --------------------------------------------------------

    /// Latches the current snapshot as the baseline for later comparison.
    pub fn baseline(&self) -> bool {
        let mut query = self.query.lock();
        match self.get_snapshot() {
            Some(snapshot) => query.baseline.capture(&snapshot, false),
            None => false,
        }
    }

    /// Whether a baseline has been latched.
    #[must_use]
    pub fn has_baseline(&self) -> bool {
        self.query.lock().baseline.baselined()
    }

    /// Builds a usage report from the current snapshot. `unit` is the number
    /// of bytes per printed unit (e.g. 1024 for KB); `summary_only` skips
    /// the per-call-site breakdown.
    #[must_use]
    pub fn to_usage_report(&self, unit: usize, summary_only: bool) -> Option<UsageReport> {
        let _query = self.query.lock();
        let snapshot = self.get_snapshot()?;
        let mut usage = Baseline::default();
        if !usage.capture(&snapshot, summary_only) {
            return None;
        }
        Some(UsageReport::new(usage, unit, summary_only))
    }

    /// Builds a diff report of the current snapshot against the latched
    /// baseline. Returns `None` when no baseline exists.
    #[must_use]
    pub fn to_diff_report(&self, unit: usize) -> Option<DiffReport> {
        let query = self.query.lock();
        if !query.baseline.baselined() {
            return None;
        }
        let snapshot = self.get_snapshot()?;
        let mut current = Baseline::default();
        if !current.capture(&snapshot, true) {
            return None;
        }
        Some(DiffReport::new(&current, &query.baseline, unit))
    }

    /// Writes the current usage report to `out`. Returns `false` when no
    /// data is available or the write failed.
    pub fn print_memory_usage(
        &self,
        out: &mut dyn io::Write,
        unit: usize,
        summary_only: bool,
    ) -> bool {
        match self.to_usage_report(unit, summary_only) {
            Some(report) => write!(out, "{report}").is_ok(),
            None => false,
        }
    }

    /// Writes the diff against the latched baseline to `out`. Returns
    /// `false` when no baseline exists, no data is available, or the write
    /// failed.
    pub fn compare_memory_usage(
        &self,
        out: &mut dyn io::Write,
        unit: usize,
        _summary_only: bool,
    ) -> bool {
        match self.to_diff_report(unit) {
            Some(report) => write!(out, "{report}").is_ok(),
            None => false,
        }
    }

    /// Blocks until every event recorded before this call has been merged
    /// into the snapshot, forcing a safepoint through the configured
    /// callback when the worker is idle. Returns `false` if the subsystem
    /// shuts down first.
    pub fn wait_for_data_merge(&self) -> bool {
        let _query = self.query.lock();
        if self.worker_handle.lock().is_none() {
            return false;
        }

        let captured = self.seqgen.current_generation();
        while !self.shutdown_in_progress() {
            let processing = self.processing_generation.load(atomic::Ordering::Acquire);
            if generation_has_passed(processing, captured) {
                return true;
            }

            // An idle worker means no safepoint is coming to advance the
            // generation on its own; ask the runtime for one.
            if self.worker_idle.load(atomic::Ordering::Relaxed)
                && let Some(request) = &self.config.safepoint_request
            {
                request();
            }

            let Some(snapshot) = self.get_snapshot() else {
                return false;
            };
            snapshot.wait(Duration::from_millis(100));
        }
        false
    }

    /// Current diagnostic counters.
    #[must_use]
    pub fn stats(&self) -> TrackerStats {
        TrackerStats {
            instance_count: self.counters.instance_count(),
            pooled_count: self.pool.len(),
            pending_count: self.pending.len(),
            thread_count: self.thread_count.load(atomic::Ordering::Relaxed),
            sync_point_count: self.sync_point_count.load(atomic::Ordering::Relaxed),
            merge_count: self.merge_count.load(atomic::Ordering::Relaxed),
            generations_in_use: self.generations_in_use.load(atomic::Ordering::Relaxed),
            sequences_in_use: self.seqgen.peek() - 1,
            generation: self.seqgen.current_generation(),
        }
    }
}

/// Whether `processing` has advanced strictly past `captured`, with the
/// comparison remaining correct across counter wraparound: the distance is
/// computed with wrapping subtraction and anything within the lower half of
/// the range counts as "ahead".
pub(crate) fn generation_has_passed(processing: u64, captured: u64) -> bool {
    let distance = processing.wrapping_sub(captured);
    distance != 0 && distance < u64::MAX / 2
}
