//! Timed retry helper for startup binds.

use std::time::Duration;

use crate::error::Result;

/// Run `f` up to `times` attempts, sleeping `delay_ms` between failures.
/// Returns the first success, or the last error once attempts run out.
pub async fn retry_timed<T, F, Fut>(times: usize, delay_ms: u64, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut last_err = None;
    for attempt in 0..times {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                last_err = Some(err);
                if attempt + 1 < times {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
            }
        }
    }
    Err(last_err.expect("retry_timed called with zero attempts"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_failures() {
        let calls = AtomicUsize::new(0);
        let result = retry_timed(5, 10, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::Transport("not yet".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_attempts() {
        let result: Result<()> =
            retry_timed(3, 10, || async { Err(Error::Transport("down".into())) }).await;
        assert!(result.is_err());
    }
}
