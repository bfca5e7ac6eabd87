#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! In-process native memory accounting for language runtimes.
//!
//! The tracker observes every native memory event of an embedding runtime
//! (malloc/free/realloc, virtual memory reserve/commit/uncommit/release,
//! arena growth, thread stacks) and maintains a live per-category snapshot
//! of how much native memory each runtime subsystem is charged with. A
//! snapshot can be latched as a *baseline* and later *diffed* to attribute
//! growth.
//!
//! Events are captured with minimal synchronization: cooperative threads
//! append to a private fixed-capacity recorder, other threads share a global
//! recorder under a process-wide critical section, and full recorders move
//! through a lock-free pending queue. At every safepoint the sync
//! coordinator drains all recorders into a generation batch that a dedicated
//! worker thread merges into the authoritative snapshot.
//!
//! # Usage
//!
//! ```
//! use mem_tracker::{MemTracker, MemoryCategory, ShutdownReason};
//!
//! let tracker = MemTracker::init_options("=summary").unwrap();
//!
//! // Driven by the embedding runtime during startup:
//! tracker.bootstrap_single_thread();
//! tracker.bootstrap_multi_thread();
//! tracker.start().unwrap();
//!
//! // Memory events are reported as they happen...
//! tracker.record_malloc(0x1000, 64, MemoryCategory::Gc, None, None);
//!
//! // ...and folded into the snapshot at each safepoint.
//! tracker.sync();
//!
//! if let Some(report) = tracker.to_usage_report(1024, true) {
//!     print!("{report}");
//! }
//!
//! tracker.shutdown(ShutdownReason::Normal);
//! ```
//!
//! # Failure policy
//!
//! The event fast path never returns errors and never panics in release
//! builds: when the tracker cannot keep up or runs out of memory it shuts
//! itself down, logs a single line naming the reason, and subsequent queries
//! return empty results. Only configuration parsing and startup are
//! fallible.

mod baseline;
mod callsite;
mod error;
mod handle;
mod options;
mod record;
mod recorder;
mod report;
mod sequence;
mod snapshot;
mod stacks;
mod sync;
mod thread;
mod tracker;
mod worker;

pub use baseline::{CallSiteUsage, CategoryDelta, CategoryUsage};
pub use callsite::CallSite;
pub use error::{Error, ShutdownReason};
pub use handle::{MemoryOperation, Tracker};
pub use options::TrackingLevel;
pub use record::{EventRecord, MemoryCategory, Tags};
pub use report::{DiffReport, UsageReport};
pub use thread::{ExecutionState, RuntimeThread};
pub use tracker::{MemTracker, TrackerConfig, TrackerState, TrackerStats};
