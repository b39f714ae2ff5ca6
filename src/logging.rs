//! Log sink for the application and the core's `log` records.

use std::sync::Once;
use tracing_subscriber::EnvFilter;

static LOGGING_INIT: Once = Once::new();

/// Environment variable holding a filter directive, e.g. `debug` or
/// `hypertool_hyperv=trace`. `RUST_LOG` is read when it is unset.
pub const LOG_ENV: &str = "HYPERTOOL_LOG";

const DEFAULT_FILTER: &str = "info";

pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber once. Output goes to stderr so stdout
/// carries only command results.
pub fn init_logging(json: bool) {
    LOGGING_INIT.call_once(|| {
        let builder = tracing_subscriber::fmt()
            .with_env_filter(env_filter())
            .with_target(false)
            .with_writer(std::io::stderr);

        let _ = if json {
            builder.json().try_init()
        } else {
            builder.try_init()
        };
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init_logging(false);
        init_logging(true);
        log::info!("bridged record");
        tracing::info!("native record");
    }
}
