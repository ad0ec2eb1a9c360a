//! Logging and tracing configuration
//!
//! Both sides log to stderr. The supervisor keeps stdout for
//! `--format json`; the host's stdout carries the wire protocol.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing for the `tickrun` CLI
///
/// Controlled by `RUST_LOG`. Default is INFO for this crate (DEBUG when
/// verbose), WARN for dependencies.
pub fn init_cli(verbose: bool) {
    let default = if verbose { "tickrun=debug,warn" } else { "tickrun=info,warn" };
    init(default);
}

/// Initialize tracing inside a host process
///
/// Anything the host writes to stderr reaches the supervisor as a plain
/// log line and is attributed to the running test, so the default is quiet.
pub fn init_host() {
    init("tickrun=warn");
}

fn init(default: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    // A second init (tests, embedding hosts) keeps the first subscriber
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .compact(),
        )
        .try_init();
}
