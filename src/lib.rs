//! tickrun library
//!
//! Host side: build a test tree from definition sources, drive it one tick
//! at a time with [`scheduler::TestRunner`], survive host restarts through
//! [`checkpoint`]. Supervisor side: spawn the host, decode its output
//! stream, persist results and optionally re-run on file changes.
//! The `tickrun` binary entry point is in main.rs.

pub mod builder;
pub mod checkpoint;
pub mod collector;
pub mod config;
pub mod context;
pub mod error;
pub mod host;
pub mod junit;
pub mod lifecycle;
pub mod listener;
pub mod logging;
pub mod protocol;
pub mod reorder;
pub mod reporter;
pub mod results;
pub mod scheduler;
pub mod signals;
pub mod supervisor;
pub mod tree;
pub mod watch;

pub use error::{Error, Result};
