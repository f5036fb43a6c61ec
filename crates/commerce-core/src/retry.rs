//! Exponential backoff retry helper for the Purchase Executor (§4.8 phase 4).

use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Backoff schedule: starts at 2s, doubles, capped at 10s, with up to 25%
/// jitter. The exact starting point and cap come from §4.8 phase 4.
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 2_000,
            max_delay_ms: 10_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl BackoffConfig {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let raw = self.initial_delay_ms as f64 * self.multiplier.powi(attempt as i32);
        let capped = raw.min(self.max_delay_ms as f64) as u64;
        let delay_ms = if self.jitter {
            let jitter_amount = (capped as f64 * 0.25 * rand::random::<f64>()) as u64;
            capped + jitter_amount
        } else {
            capped
        };
        Duration::from_millis(delay_ms)
    }
}

/// Outcome of one attempt, as judged by the caller's classifier.
pub enum Attempt<T, E> {
    Done(T),
    Retryable(E),
    Fatal(E),
}

/// Retries `f` up to `max_retries` additional times (so `max_retries + 1`
/// total attempts), honouring `should_cancel` between attempts so a
/// cancelled run does not sleep through its grace window.
pub async fn retry_with_backoff<F, Fut, T, E>(
    backoff: BackoffConfig,
    max_retries: u32,
    operation_name: &str,
    mut should_cancel: impl FnMut() -> bool,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Attempt<T, E>>,
{
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            info!(operation = operation_name, attempt, max_retries, "retrying");
        }

        match f(attempt).await {
            Attempt::Done(value) => {
                if attempt > 0 {
                    info!(operation = operation_name, attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Attempt::Fatal(err) => {
                debug!(operation = operation_name, attempt, "fatal error, aborting retries");
                return Err(err);
            }
            Attempt::Retryable(err) => {
                last_err = Some(err);

                if should_cancel() {
                    warn!(operation = operation_name, attempt, "cancelled during retry loop");
                    break;
                }

                if attempt < max_retries {
                    let delay = backoff.delay_for(attempt);
                    warn!(
                        operation = operation_name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    Err(last_err.expect("at least one attempt runs"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let cfg = BackoffConfig {
            jitter: false,
            ..BackoffConfig::default()
        };
        assert_eq!(cfg.delay_for(0).as_millis(), 2_000);
        assert_eq!(cfg.delay_for(1).as_millis(), 4_000);
        assert_eq!(cfg.delay_for(2).as_millis(), 8_000);
        assert_eq!(cfg.delay_for(3).as_millis(), 10_000);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let mut calls = 0u32;
        let result: Result<u32, &'static str> = retry_with_backoff(
            BackoffConfig {
                initial_delay_ms: 1,
                max_delay_ms: 2,
                jitter: false,
                ..BackoffConfig::default()
            },
            3,
            "test",
            || false,
            |attempt| {
                calls += 1;
                async move {
                    if attempt < 2 {
                        Attempt::Retryable("transient")
                    } else {
                        Attempt::Done(42)
                    }
                }
            },
        )
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn fatal_error_stops_immediately() {
        let mut calls = 0u32;
        let result: Result<u32, &'static str> = retry_with_backoff(
            BackoffConfig::default(),
            3,
            "test",
            || false,
            |_| {
                calls += 1;
                async move { Attempt::Fatal("permanent") }
            },
        )
        .await;

        assert_eq!(result, Err("permanent"));
        assert_eq!(calls, 1);
    }
}
