//! 指数バックオフ

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// リトライ回数と待機間隔
///
/// `attempt` 回目（0 始まり）の失敗後は `factor_ms * 2^attempt` ミリ秒待つ。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    /// 初回の後に許すリトライ回数
    pub times: u32,
    pub factor_ms: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            times: 3,
            factor_ms: 1000,
        }
    }
}

impl Backoff {
    pub fn new(times: u32, factor_ms: u64) -> Self {
        Self { times, factor_ms }
    }

    /// リトライしない設定
    pub fn none() -> Self {
        Self {
            times: 0,
            factor_ms: 0,
        }
    }

    /// 試行回数の上限（初回を含む）
    pub fn max_attempts(&self) -> u32 {
        self.times.saturating_add(1)
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(self.factor_ms.saturating_mul(multiplier))
    }

    /// 非同期処理を指数バックオフ付きで再試行
    ///
    /// `retryable` が false を返すエラーは即座に返す。待機は `tokio::time::sleep` なので、
    /// 呼び出し側の future を drop すればリトライごと中断できる。
    pub async fn retry<T, E, F, Fut, R>(&self, what: &str, retryable: R, mut call: F) -> Result<T, RetryFailure<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut attempt: u32 = 0;
        loop {
            let error = match call().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            if !retryable(&error) {
                return Err(RetryFailure {
                    error,
                    attempts: attempt + 1,
                    exhausted: false,
                });
            }
            if attempt >= self.times {
                return Err(RetryFailure {
                    error,
                    attempts: attempt + 1,
                    exhausted: true,
                });
            }

            let delay = self.delay_for_attempt(attempt);
            tracing::warn!(
                "{} failed (attempt {}/{}), retrying in {:?}: {}",
                what,
                attempt + 1,
                self.max_attempts(),
                delay,
                error
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

/// [`Backoff::retry`] の最後の失敗
#[derive(Debug)]
pub struct RetryFailure<E> {
    pub error: E,
    /// 実行した試行回数（初回を含む）
    pub attempts: u32,
    /// リトライ対象のエラーのまま回数を使い切った
    pub exhausted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[test]
    fn test_delay_doubles() {
        let backoff = Backoff::new(3, 100);
        assert_eq!(backoff.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(backoff.max_attempts(), 4);
    }

    #[test]
    fn test_delay_saturates() {
        let backoff = Backoff::new(3, u64::MAX / 2);
        assert_eq!(backoff.delay_for_attempt(80), Duration::from_millis(u64::MAX));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_after_times() {
        let backoff = Backoff::new(2, 100);
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let start = Instant::now();
        let failure = backoff
            .retry(
                "clone",
                |_: &String| true,
                move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("network down".to_string())
                },
            )
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(failure.attempts, 3);
        assert!(failure.exhausted);
        assert_eq!(failure.error, "network down");
        // 100 + 200 ms
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_on_permanent_error() {
        let backoff = Backoff::new(5, 100);
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let failure = backoff
            .retry(
                "clone",
                |e: &String| !e.contains("permanent"),
                move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("permanent".to_string())
                },
            )
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!failure.exhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers() {
        let backoff = Backoff::new(3, 10);
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = backoff
            .retry(
                "clone",
                |_: &String| true,
                move || async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 { Err("flaky".to_string()) } else { Ok(n) }
                },
            )
            .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_retry_cancels_backoff() {
        let backoff = Backoff::new(3, 60_000);
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let start = Instant::now();
        let retry = backoff.retry(
            "clone",
            |_: &String| true,
            move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("network down".to_string())
            },
        );
        tokio::select! {
            _ = retry => panic!("retry should still be backing off"),
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }
}
