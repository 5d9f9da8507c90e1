//! Fixed-delay retry helper.
//!
//! Used by the WinRM command path (per-command retry settings), by both
//! connect paths (transient dial/shell failures) and by the agent
//! orchestrator (connector deregistration).

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;

/// Returned when an operation is asked to run with zero attempts.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Retries exhausted: operation was configured with zero attempts")]
pub struct RetriesExhausted;

/// Run `op` up to `attempts` times, sleeping `delay` between tries.
///
/// An error is retried only while its message contains one of `retry_on`;
/// an empty allow-list retries every error.
pub async fn retry<T, E, F, Fut>(
    op: F,
    attempts: u32,
    delay: Duration,
    retry_on: &[String],
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display + From<RetriesExhausted>,
{
    retry_if(op, attempts, delay, |err: &E| {
        if retry_on.is_empty() {
            return true;
        }
        let msg = err.to_string();
        retry_on.iter().any(|needle| msg.contains(needle.as_str()))
    })
    .await
}

/// Like [`retry`] but the decision is made by a predicate over the error.
pub async fn retry_if<T, E, F, Fut, P>(
    mut op: F,
    attempts: u32,
    delay: Duration,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display + From<RetriesExhausted>,
    P: Fn(&E) -> bool,
{
    if attempts == 0 {
        return Err(RetriesExhausted.into());
    }

    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts && should_retry(&e) => {
                log::debug!(
                    "Attempt {}/{} failed, retrying in {:?}: {}",
                    attempt,
                    attempts,
                    delay,
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
