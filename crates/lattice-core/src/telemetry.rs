//! Tracing bootstrap. Filter comes from `LATTICE_LOG` (falls back to
//! `info`). Safe to call more than once.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Install the global tracing subscriber.
pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env("LATTICE_LOG")
            .unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init();
    });
}
