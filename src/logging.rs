//! Logging initialisation.
//!
//! Everything goes to stderr so `qvmm args` and `qvmm show` keep a clean
//! stdout. `RUST_LOG` wins when set; otherwise the level is `warn`, or
//! `debug` with `--verbose`.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialise the global tracing subscriber. Safe to call more than once;
/// later calls are ignored.
pub fn init(verbose: bool) {
    let fallback = if verbose { "debug" } else { "warn" };
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)))
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init();
}
