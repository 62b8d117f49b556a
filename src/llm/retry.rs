//! 重试与退避
//!
//! 第 k 次（0 起）可重试失败后等待 min(initial_delay * 2^k, max_delay)；服务端给出 retry_after 时取较大者（仍受上限约束）。
//! 总尝试次数为 max_retries，最后一次失败后不再等待；不可重试错误立即返回。

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::llm::LlmError;

/// 重试策略
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// 总尝试次数（含第一次）
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

/// 对一次失败给出的处理建议
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// 等待后重试
    Retry(Duration),
    /// 可重试但次数已用尽
    Exhausted,
    /// 不可重试
    Fatal,
}

impl RetryConfig {
    /// 第 attempt 次失败后的退避时长
    pub fn delay_for(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.initial_delay.checked_mul(factor))
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    pub fn decide(&self, err: &LlmError, attempt: u32) -> RetryDecision {
        if !err.is_retryable() {
            return RetryDecision::Fatal;
        }
        if attempt + 1 >= self.max_retries {
            return RetryDecision::Exhausted;
        }
        let backoff = self.delay_for(attempt);
        let delay = err
            .retry_after_ms()
            .map(Duration::from_millis)
            .map_or(backoff, |server| server.max(backoff))
            .min(self.max_delay);
        RetryDecision::Retry(delay)
    }

    /// 按策略执行 op（参数为 0 起的尝试序号）；等待期间可被 cancel 打断
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> Result<T, AgentError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, LlmError>>,
    {
        let mut attempt = 0u32;
        loop {
            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            match self.decide(&err, attempt) {
                RetryDecision::Retry(delay) => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "model call failed, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                RetryDecision::Exhausted | RetryDecision::Fatal => {
                    tracing::error!(attempts = attempt + 1, error = %err, "model call failed");
                    return Err(AgentError::FatalApi {
                        attempts: attempt + 1,
                        source: err,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn policy() -> RetryConfig {
        RetryConfig {
            max_retries: 4,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.delay_for(0), Duration::from_millis(100));
        assert_eq!(p.delay_for(1), Duration::from_millis(200));
        assert_eq!(p.delay_for(2), Duration::from_millis(300));
        assert_eq!(p.delay_for(40), Duration::from_millis(300));
    }

    #[test]
    fn test_decide_respects_server_hint_under_cap() {
        let p = policy();
        let err = LlmError::RateLimited { retry_after_ms: Some(250) };
        assert_eq!(p.decide(&err, 0), RetryDecision::Retry(Duration::from_millis(250)));
        let err = LlmError::RateLimited { retry_after_ms: Some(10_000) };
        assert_eq!(p.decide(&err, 0), RetryDecision::Retry(Duration::from_millis(300)));
        assert_eq!(p.decide(&LlmError::Auth("x".into()), 0), RetryDecision::Fatal);
        assert_eq!(
            p.decide(&LlmError::TransientNetwork("x".into()), 3),
            RetryDecision::Exhausted
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_exhausts_after_max_retries() {
        let p = RetryConfig {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
        };
        let calls = AtomicU32::new(0);
        let start = tokio::time::Instant::now();
        let result: Result<(), AgentError> = p
            .run(&CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(LlmError::RateLimited { retry_after_ms: None }) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 100ms + 200ms，最后一次失败后不再等待
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(300), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(400), "{elapsed:?}");
        match result {
            Err(AgentError::FatalApi { attempts, source }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(source, LlmError::RateLimited { .. }));
            }
            other => panic!("expected FatalApi, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_returns_without_delay() {
        let calls = AtomicU32::new(0);
        let start = tokio::time::Instant::now();
        let result: Result<(), AgentError> = policy()
            .run(&CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(LlmError::InvalidRequest("bad".into())) }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(matches!(result, Err(AgentError::FatalApi { attempts: 1, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failure() {
        let result = policy()
            .run(&CancellationToken::new(), |attempt| async move {
                if attempt < 2 {
                    Err(LlmError::TransientNetwork("reset".into()))
                } else {
                    Ok(attempt)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_backoff() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), AgentError> = policy()
            .run(&cancel, |_| async { Err(LlmError::TransientNetwork("x".into())) })
            .await;
        assert!(matches!(result, Err(AgentError::Cancelled)));
    }
}
