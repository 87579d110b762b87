//! エンジン呼び出しのリトライ
//!
//! 全てのリトライ対象メソッドはこの [`RetryPolicy::run`] だけを通して再試行します。
//! 待機の間隔と回数は [`Backoff::retry`] に任せます。

use crate::error::{EngineError, Result};
use buildflow_core::Backoff;
use std::future::Future;
use std::time::Duration;

/// 既定でリトライ対象とするクライアントエラーのステータス
pub const DEFAULT_RETRY_STATUSES: [u16; 3] = [408, 409, 429];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub backoff: Backoff,
    /// 5xx 以外でリトライするステータス
    pub statuses: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: Backoff::default(),
            statuses: DEFAULT_RETRY_STATUSES.to_vec(),
        }
    }
}

impl RetryPolicy {
    pub fn new(times: u32, backoff_factor: Duration, statuses: Vec<u16>) -> Self {
        Self {
            backoff: Backoff::new(times, backoff_factor.as_millis() as u64),
            statuses,
        }
    }

    pub fn none() -> Self {
        Self {
            backoff: Backoff::none(),
            statuses: Vec::new(),
        }
    }

    /// 一時的なエラーか（5xx、許可リストのステータス、接続エラー）
    pub fn is_retryable(&self, err: &EngineError) -> bool {
        match err {
            EngineError::Api { status, .. } => *status >= 500 || self.statuses.contains(status),
            EngineError::Connection(_) => true,
            _ => false,
        }
    }

    /// 1つの論理操作をリトライ付きで実行
    ///
    /// 全試行が失敗した場合は最後のエラーを `RetryExhausted` に包んで返す。
    /// リトライ対象外のエラーは1回目でそのまま返す。
    pub async fn run<T, F, Fut>(&self, operation: &str, args: &str, call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let what = format!("{}({})", operation, args);
        match self.backoff.retry(&what, |err| self.is_retryable(err), call).await {
            Ok(value) => Ok(value),
            Err(failure) if !failure.exhausted => Err(failure.error),
            Err(failure) => {
                tracing::error!("{} failed after {} attempt(s): {}", what, failure.attempts, failure.error);
                Err(EngineError::RetryExhausted {
                    operation: operation.to_string(),
                    args: args.to_string(),
                    attempts: failure.attempts,
                    source: Box::new(failure.error),
                })
            }
        }
    }
}
