use std::sync::Once;

use tracing_subscriber::{EnvFilter, prelude::*};

use crate::settings::LogFormat;

static INIT: Once = Once::new();

fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize tracing once for the process.
///
/// The `log_format` parameter controls whether logs are output as
/// human-readable text (default) or structured JSON; the filter comes from
/// `RUST_LOG` with an `info` fallback.
pub fn init(log_format: LogFormat) {
    INIT.call_once(|| {
        let env_filter = build_env_filter();
        match log_format {
            LogFormat::Text => {
                let fmt_layer = tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .compact()
                    .with_filter(env_filter);
                tracing_subscriber::registry().with(fmt_layer).init();
            }
            LogFormat::Json => {
                let fmt_layer = tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .json()
                    .with_filter(env_filter);
                tracing_subscriber::registry().with(fmt_layer).init();
            }
        }
    });
}

/// Run an async test body with process-wide tracing installed.
pub async fn with_test_tracing<F, Fut, T>(_test_name: &str, f: F) -> T
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = T>,
{
    init(LogFormat::Text);
    f().await
}

/// Run a sync test body with process-wide tracing installed.
/// This is the synchronous equivalent of `with_test_tracing`.
pub fn with_test_tracing_sync<F, T>(_test_name: &str, f: F) -> T
where
    F: FnOnce() -> T,
{
    init(LogFormat::Text);
    f()
}
