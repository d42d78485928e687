//! Caller-driven cancellation of cache operations.

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::error::{CacheError, Result};

/// Runs `fut` until it completes or `token` is cancelled.
///
/// A cancelled operation is dropped at its current await point and
/// [`CacheError::Cancelled`] is returned. Cache operations are written so that
/// being dropped mid-flight never leaves the local tier ahead of the
/// distributed tier.
pub async fn with_cancellation<T, F>(token: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if token.is_cancelled() {
        return Err(CacheError::Cancelled);
    }

    tokio::select! {
        biased;
        _ = token.cancelled() => Err(CacheError::Cancelled),
        result = fut => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_completes_when_not_cancelled() {
        let token = CancellationToken::new();
        let value = with_cancellation(&token, async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_already_cancelled_token_short_circuits() {
        let token = CancellationToken::new();
        token.cancel();

        let polled = std::sync::atomic::AtomicBool::new(false);
        let result: Result<()> = with_cancellation(&token, async {
            polled.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        })
        .await;
        assert!(result.unwrap_err().is_cancelled());
        assert!(!polled.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancel_while_pending() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let result: Result<()> = with_cancellation(&token, async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        })
        .await;
        assert!(result.unwrap_err().is_cancelled());
    }
}
