//! Cooperative-thread registration and per-thread recorder slots.

use std::cell::RefCell;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, AtomicU64};

use parking_lot::RwLock;

use crate::recorder::Recorder;

/// What a cooperative thread is currently doing, from the safepoint
/// machinery's point of view.
///
/// Threads in a safepoint-safe state keep running through safepoints, so
/// events they emit while the drain is in progress must synchronize through
/// the process-wide critical section. Threads executing inside the runtime
/// stop at safepoints and need no lock.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ExecutionState {
    /// Executing runtime code; the thread will stop at the next safepoint.
    InRuntime = 0,
    /// Executing native code outside the runtime.
    InNative,
    /// Blocked on a runtime lock or condition.
    Blocked,
}

impl ExecutionState {
    /// Whether a thread in this state runs through safepoints instead of
    /// stopping at them.
    #[must_use]
    pub fn is_safepoint_safe(self) -> bool {
        matches!(self, Self::InNative | Self::Blocked)
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::InNative,
            2 => Self::Blocked,
            _ => Self::InRuntime,
        }
    }
}

/// The single mutable recorder reference owned by a cooperative thread.
///
/// The slot is an atomic pointer so that ownership of the boxed recorder can
/// move between the owning thread (during recording) and the sync
/// coordinator (during the safepoint drain) without locking: whichever side
/// swaps the pointer out becomes the unique owner; the other side observes an
/// empty slot.
#[derive(Debug)]
pub(crate) struct RecorderSlot {
    recorder: AtomicPtr<Recorder>,
}

impl RecorderSlot {
    pub(crate) fn new() -> Self {
        Self {
            recorder: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Removes and returns the recorder, leaving the slot empty.
    pub(crate) fn take(&self) -> Option<Box<Recorder>> {
        let raw = self.recorder.swap(ptr::null_mut(), atomic::Ordering::AcqRel);
        if raw.is_null() {
            None
        } else {
            // SAFETY: The swap made us the unique owner of the pointer, which
            // was produced by `Box::into_raw` in `install`.
            Some(unsafe { Box::from_raw(raw) })
        }
    }

    /// Puts a recorder into the slot.
    pub(crate) fn install(&self, recorder: Box<Recorder>) {
        let raw = Box::into_raw(recorder);
        let previous = self.recorder.swap(raw, atomic::Ordering::AcqRel);
        debug_assert!(
            previous.is_null(),
            "installing into an occupied recorder slot"
        );
        if !previous.is_null() {
            // SAFETY: The swap transferred the displaced pointer to us; it
            // originated from `Box::into_raw`.
            drop(unsafe { Box::from_raw(previous) });
        }
    }
}

impl Drop for RecorderSlot {
    fn drop(&mut self) {
        drop(self.take());
    }
}

/// A cooperative thread registered with the tracker.
///
/// The embedding runtime creates one of these per thread it manages (via
/// [`MemTracker::attach_thread`](crate::MemTracker::attach_thread)) and keeps
/// the execution state and safepoint visibility current as the thread moves
/// between runtime and native code.
#[derive(Debug)]
pub struct RuntimeThread {
    id: u64,
    tracker_id: u64,
    pub(crate) slot: RecorderSlot,
    safepoint_visible: AtomicBool,
    state: AtomicU8,
}

impl RuntimeThread {
    fn new(id: u64, tracker_id: u64) -> Self {
        Self {
            id,
            tracker_id,
            slot: RecorderSlot::new(),
            safepoint_visible: AtomicBool::new(true),
            state: AtomicU8::new(ExecutionState::InRuntime as u8),
        }
    }

    /// Registry-assigned thread identifier.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn tracker_id(&self) -> u64 {
        self.tracker_id
    }

    /// The thread's current execution state.
    #[must_use]
    pub fn execution_state(&self) -> ExecutionState {
        ExecutionState::from_u8(self.state.load(atomic::Ordering::Relaxed))
    }

    /// Updates the execution state. Called by the embedding runtime at state
    /// transitions (entering native code, blocking, returning to the
    /// runtime).
    pub fn set_execution_state(&self, state: ExecutionState) {
        self.state.store(state as u8, atomic::Ordering::Relaxed);
    }

    /// Whether the safepoint scan will visit this thread.
    #[must_use]
    pub fn is_safepoint_visible(&self) -> bool {
        self.safepoint_visible.load(atomic::Ordering::Relaxed)
    }

    /// Marks the thread as visible (or not) to the safepoint scan. Threads
    /// that are not visible route their events through the global recorder.
    pub fn set_safepoint_visible(&self, visible: bool) {
        self.safepoint_visible
            .store(visible, atomic::Ordering::Relaxed);
    }
}

/// The table of registered cooperative threads, walked by the sync
/// coordinator at every safepoint drain.
#[derive(Debug)]
pub(crate) struct ThreadRegistry {
    threads: RwLock<Vec<Arc<RuntimeThread>>>,
    next_id: AtomicU64,
}

impl ThreadRegistry {
    pub(crate) fn new() -> Self {
        Self {
            threads: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn register(&self, tracker_id: u64) -> Arc<RuntimeThread> {
        let id = self.next_id.fetch_add(1, atomic::Ordering::Relaxed);
        let thread = Arc::new(RuntimeThread::new(id, tracker_id));
        self.threads.write().push(Arc::clone(&thread));
        thread
    }

    pub(crate) fn unregister(&self, thread: &Arc<RuntimeThread>) {
        self.threads
            .write()
            .retain(|registered| !Arc::ptr_eq(registered, thread));
    }

    /// Visits every registered thread, returning how many were visited.
    pub(crate) fn for_each(&self, mut visit: impl FnMut(&Arc<RuntimeThread>)) -> usize {
        let threads = self.threads.read();
        for thread in threads.iter() {
            visit(thread);
        }
        threads.len()
    }

    pub(crate) fn count(&self) -> usize {
        self.threads.read().len()
    }
}

thread_local! {
    // The runtime thread the current OS thread is attached to, if any. Kept
    // per tracker instance check so independent trackers in tests do not see
    // each other's attachments.
    static CURRENT_THREAD: RefCell<Option<Arc<RuntimeThread>>> = const { RefCell::new(None) };
}

pub(crate) fn set_current(thread: Arc<RuntimeThread>) {
    CURRENT_THREAD.with(|current| {
        *current.borrow_mut() = Some(thread);
    });
}

pub(crate) fn clear_current(tracker_id: u64) {
    CURRENT_THREAD.with(|current| {
        let mut current = current.borrow_mut();
        if current
            .as_ref()
            .is_some_and(|thread| thread.tracker_id() == tracker_id)
        {
            *current = None;
        }
    });
}

/// The current OS thread's registration with the given tracker, if any.
pub(crate) fn current_for(tracker_id: u64) -> Option<Arc<RuntimeThread>> {
    CURRENT_THREAD.with(|current| {
        current
            .borrow()
            .as_ref()
            .filter(|thread| thread.tracker_id() == tracker_id)
            .map(Arc::clone)
    })
}
