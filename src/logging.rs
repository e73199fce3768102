//! Logging setup for applications embedding the cache

use crate::config::GeneralConfig;
use tracing_subscriber::EnvFilter;

/// Install a global `tracing` subscriber configured from `[general]`.
///
/// `RUST_LOG` takes precedence over the configured verbosity. Returns false
/// if a subscriber was already installed, in which case nothing changes.
pub fn init(general: &GeneralConfig) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(general));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let installed = if wants_json(general) {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.is_ok()
}

fn wants_json(general: &GeneralConfig) -> bool {
    general.log_format.trim().eq_ignore_ascii_case("json")
}

fn default_filter(general: &GeneralConfig) -> EnvFilter {
    if general.verbose {
        EnvFilter::new("wharf=info")
    } else {
        EnvFilter::new("wharf=warn")
    }
}
