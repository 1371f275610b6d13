//! Bootstrap utilities for HRIS messaging binaries.

use std::future::Future;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{LOG_ENV_VAR, LOG_FORMAT_ENV_VAR};

/// Attempts made by [`connect_with_retry`] before giving up.
pub const MAX_CONNECT_ATTEMPTS: usize = 30;

/// Initialize tracing from the `HRIS_LOG` environment variable.
///
/// Defaults to "info" level if `HRIS_LOG` is not set. Set `HRIS_LOG_FORMAT`
/// to `json` for structured output.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if json_logs(std::env::var(LOG_FORMAT_ENV_VAR).ok().as_deref()) {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn json_logs(format: Option<&str>) -> bool {
    format.is_some_and(|format| format.eq_ignore_ascii_case("json"))
}

/// Run `connect` until it succeeds, backing off exponentially between
/// attempts.
///
/// # Arguments
/// * `what` - Human-readable name for logging (e.g. "broker")
/// * `target` - Where it connects to, already redacted
/// * `connect` - Async function that attempts to establish a connection
///
/// # Returns
/// The connected value on success, or the last error after
/// [`MAX_CONNECT_ATTEMPTS`] attempts.
pub async fn connect_with_retry<T, E, F, Fut>(what: &str, target: &str, connect: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    connect_with_backoff(
        what,
        target,
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(5))
            .with_max_times(MAX_CONNECT_ATTEMPTS - 1)
            .with_jitter(),
        connect,
    )
    .await
}

async fn connect_with_backoff<T, E, F, Fut>(
    what: &str,
    target: &str,
    backoff: impl BackoffBuilder,
    connect: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut delays = backoff.build();
    let mut attempt = 0;

    loop {
        attempt += 1;
        match connect().await {
            Ok(connected) => {
                info!(what = %what, target = %target, attempt, "Connected");
                return Ok(connected);
            }
            Err(e) => match delays.next() {
                Some(delay) => {
                    warn!(
                        what = %what,
                        target = %target,
                        attempt,
                        error = %e,
                        retry_in_ms = %delay.as_millis(),
                        "Connection failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    error!(
                        what = %what,
                        target = %target,
                        attempts = attempt,
                        error = %e,
                        "Connection failed, giving up"
                    );
                    return Err(e);
                }
            },
        }
    }
}
