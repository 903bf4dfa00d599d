//! Coordinator errors.

use smol_str::SmolStr;
use thiserror::Error;

/// Errors surfaced by the bridge and the analyzer pools.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnalysisError {
    /// A newer request for the same uri replaced this queued one.
    #[error("request for '{0}' superseded by a newer request")]
    Superseded(SmolStr),

    /// The coordinator is shutting down.
    #[error("analysis coordinator is shutting down")]
    ShuttingDown,

    /// A per-request or queue-wait timeout fired.
    #[error("analysis of '{uri}' timed out after {after_ms}ms")]
    Timeout { uri: SmolStr, after_ms: u64 },

    /// The worker handling the request exited before responding.
    #[error("analyzer worker (pid {pid}) exited mid-request")]
    WorkerExited { pid: u32 },

    /// The analyzer returned an error response or unusable output.
    #[error("analyzer failed: {0}")]
    AnalyzerFailed(SmolStr),

    /// An analyzer child process could not be spawned.
    #[error("failed to spawn analyzer '{binary}': {message}")]
    Spawn { binary: SmolStr, message: SmolStr },

    /// A wire-protocol violation (malformed response stream).
    #[error("protocol error: {0}")]
    Protocol(SmolStr),

    /// Writing to or reading from a child process failed.
    #[error("analyzer i/o error: {0}")]
    Io(SmolStr),

    /// A completion channel closed without a value.
    #[error("internal completion channel closed")]
    ChannelClosed,

    /// Invalid configuration value.
    #[error("invalid config '{0}'")]
    InvalidConfig(SmolStr),
}

impl From<std::io::Error> for AnalysisError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(SmolStr::new(value.to_string()))
    }
}
