//! Log setup
//!
//! stdout carries the CNI result, so logs always go to stderr.

use std::io;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable holding the log filter
pub const LOG_ENV: &str = "GENIE_LOG";

/// Filter used when `GENIE_LOG` is unset or invalid
pub const DEFAULT_FILTER: &str = "info,kube=warn,hyper=warn,tower=warn";

/// Install the global subscriber
///
/// Returns false when a subscriber was already installed.
pub fn init() -> bool {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let fmt_layer = fmt::layer()
        .with_writer(io::stderr)
        .with_ansi(false)
        .with_target(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .is_ok()
}
