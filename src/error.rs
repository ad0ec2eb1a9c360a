//! Error types for tickrun
//!
//! Supervisor-level failures (spawn, watchdog, host crash) surface through
//! this enum. Test-level failures never do: they are recorded on the test
//! tree and reported through the event stream.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === Host process ===
    #[error("Failed to start host '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("No output received from the host for {seconds} seconds. {}", log_hint(.log_path))]
    OutputTimeout {
        seconds: u64,
        log_path: Option<PathBuf>,
    },

    #[error("Host exited before reporting a result (exit code {})", exit_code(.code))]
    HostExited { code: Option<i32> },

    #[error("Run cancelled")]
    Cancelled,

    #[error("Host command is empty")]
    EmptyCommand,

    // === Checkpoints ===
    #[error("Checkpoint encoding failed: {0}")]
    Checkpoint(#[from] bincode::Error),

    // === Configuration ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid pattern '{pattern}': {reason}")]
    Pattern { pattern: String, reason: String },

    // === Watch mode ===
    #[error("File watcher error: {0}")]
    Watch(#[from] notify::Error),

    // === IO / serialization ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn pattern(pattern: &str, reason: impl ToString) -> Self {
        Self::Pattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        }
    }
}

fn log_hint(path: &Option<PathBuf>) -> String {
    match path {
        Some(path) => format!("Check the host log at {}", path.display()),
        None => "The host log location is unknown".to_string(),
    }
}

fn exit_code(code: &Option<i32>) -> String {
    code.map_or_else(|| "none, killed by signal".to_string(), |c| c.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_timeout_names_seconds_and_log() {
        let err = Error::OutputTimeout {
            seconds: 15,
            log_path: Some(PathBuf::from("/var/log/host.log")),
        };
        let msg = err.to_string();
        assert!(msg.contains("15 seconds"));
        assert!(msg.contains("/var/log/host.log"));
    }

    #[test]
    fn test_host_exited_without_code() {
        let err = Error::HostExited { code: None };
        assert!(err.to_string().contains("killed by signal"));
    }
}
