//! Fatal run errors.
//!
//! Everything here ends the run. Recoverable failures (webhook delivery,
//! line-log writes, stream reads) are logged where they happen and never
//! surface as a [`RunError`].

use std::process::ExitStatus;

use crate::config::ConfigError;
use crate::ports::PortError;

/// Errors that abort a supervised run.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// Run or child configuration is unreadable or malformed.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Port probing or rewriting the child configuration failed.
    #[error(transparent)]
    PortNegotiation(#[from] PortError),

    /// The pre-spawn build step failed.
    #[error("build of '{target}' failed: {detail}")]
    Build {
        /// `make` target.
        target: String,
        /// Spawn error or exit status.
        detail: String,
    },

    /// The child process could not be started.
    #[error("failed to start {program}: {source}")]
    Spawn {
        /// Executable that failed to start.
        program: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Waiting for the child failed.
    #[error("failed to wait for child: {0}")]
    Wait(#[source] std::io::Error),

    /// The child exited with a non-zero status.
    #[error("child finished with error: {status}")]
    ChildExit {
        /// Exit status reported by the OS.
        status: ExitStatus,
    },
}
