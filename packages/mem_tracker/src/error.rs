use derive_more::Display;
use thiserror::Error;

/// Errors that can occur while configuring or starting the tracker.
///
/// The event fast path never returns errors; see the crate documentation for
/// how runtime failures degrade into self-shutdown instead.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The tracking option string did not match the accepted grammar.
    #[error("invalid tracking option: '{invalid_value}', expected =off, =summary or =detail")]
    Configuration {
        /// The option string that was rejected.
        invalid_value: String,
    },

    /// The merge worker could not be started. The tracker has already shut
    /// itself down with reason `Initialization` when this is returned.
    #[error("failed to start merge worker: {source}")]
    WorkerStart {
        /// The underlying failure, usually from spawning the worker thread.
        #[source]
        source: std::io::Error,
    },
}

/// A specialized `Result` type for tracker configuration and startup,
/// returning the crate's [`Error`] type as the error value.
pub(crate) type Result<T> = std::result::Result<T, Error>;

/// Why the tracker shut itself down (or was shut down).
///
/// The reason is latched by the first shutdown request and reported by
/// [`MemTracker::reason`](crate::MemTracker::reason) afterwards.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
#[repr(u8)]
pub enum ShutdownReason {
    /// No shutdown has been requested.
    #[display("native memory tracking is not enabled")]
    None = 0,

    /// The user asked for tracking to stop.
    #[display("native memory tracking has been shut down by user request")]
    User,

    /// Normal shutdown as part of process exit.
    #[display("native memory tracking has been shut down because the process is exiting")]
    Normal,

    /// The tracker could not keep up and ran out of native memory.
    #[display("native memory tracking has been shut down due to running out of native memory")]
    OutOfMemory,

    /// The tracker failed to initialize its worker or snapshot.
    #[display("native memory tracking failed to initialize")]
    Initialization,

    /// Tracking cannot be combined with a malloc-only allocation mode.
    #[display("native memory tracking is not supported in malloc-only mode")]
    UseMallocOnly,

    /// Shut down as part of fatal error reporting.
    #[display("native memory tracking has been shut down due to error reporting")]
    ErrorReporting,

    /// The generation ring buffer filled up before the worker could drain it.
    #[display("native memory tracking has been shut down due to running out of generation buffer")]
    OutOfGenerationBuffer,

    /// The sequence number range was exhausted within one generation.
    #[display("native memory tracking has been shut down due to sequence number overflow")]
    SequenceOverflow,
}

impl ShutdownReason {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::User,
            2 => Self::Normal,
            3 => Self::OutOfMemory,
            4 => Self::Initialization,
            5 => Self::UseMallocOnly,
            6 => Self::ErrorReporting,
            7 => Self::OutOfGenerationBuffer,
            8 => Self::SequenceOverflow,
            _ => Self::None,
        }
    }
}
