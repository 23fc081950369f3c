//! Shared retry helper with exponential backoff.
//!
//! Every transient-failure path in the engine (host persistence calls,
//! session creation, sync dispatch) funnels through [`retry`] instead of
//! carrying its own ad-hoc loop. The delay grows linearly with the attempt
//! number: `base * 1`, `base * 2`, ...

use std::future::Future;
use std::time::Duration;

use log::warn;

/// Default attempt ceiling for host persistence and session creation.
pub const DEFAULT_ATTEMPTS: u32 = 3;

/// Default backoff base: 100ms * attempt.
pub const DEFAULT_BASE: Duration = Duration::from_millis(100);

/// Run `op` up to `attempts` times, sleeping `base * attempt` between
/// failures. The closure receives the 1-based attempt number.
///
/// Returns the first success, or the last error once attempts are exhausted.
pub async fn retry<T, E, F, Fut>(attempts: u32, base: Duration, mut op: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < attempts => {
                warn!("attempt {attempt}/{attempts} failed: {err}");
                tokio::time::sleep(base * attempt).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn succeeds_first_try_without_sleeping() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = retry(3, DEFAULT_BASE, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(42) }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = retry(3, DEFAULT_BASE, |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("transient".to_string())
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_after_attempt_ceiling() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = retry(3, DEFAULT_BASE, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("permanent".to_string()) }
        })
        .await;
        assert_eq!(result.unwrap_err(), "permanent");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_grows_with_attempt() {
        let start = tokio::time::Instant::now();
        let _: Result<(), String> = retry(3, Duration::from_millis(100), |_| async {
            Err("always".to_string())
        })
        .await;
        // 100ms after attempt 1 + 200ms after attempt 2.
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }
}
