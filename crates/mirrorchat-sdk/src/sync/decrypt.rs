//! 解密重试 - 外部解密能力 + 有界的退避重试
//!
//! 解密失败（密钥未到）按指数退避加随机抖动重试，直到超时；
//! 超时后事件标记为 undecryptable，用占位内容渲染，不会中断同步管线。

use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{MirrorchatSDKError, Result};
use crate::storage::entities::{event_types, Event};

#[async_trait]
pub trait EventDecryptor: Send + Sync {
    /// 解密一个 m.room.encrypted 事件。
    /// 密钥暂不可用时返回 `MirrorchatSDKError::DecryptionPending`，其他错误视为不可恢复。
    async fn decrypt(&self, event: &Event) -> Result<Event>;
}

/// 解密重试策略
#[derive(Debug, Clone)]
pub struct DecryptRetryPolicy {
    /// 总等待上限
    pub timeout: Duration,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// 指数退避因子
    pub backoff_factor: f64,
    /// 随机抖动因子 (0.0-1.0)
    pub jitter_factor: f64,
}

impl Default for DecryptRetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl DecryptRetryPolicy {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Default::default()
        }
    }

    /// 第 attempt 次重试前的等待时间
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_secs_f64() * self.backoff_factor.powf(attempt as f64);
        let capped = base.min(self.max_delay.as_secs_f64());
        let jitter = capped * self.jitter_factor * (rand::random::<f64>() - 0.5);
        Duration::from_secs_f64((capped + jitter).max(0.0))
    }
}

/// 解密超时后的占位
pub fn mark_undecryptable(mut event: Event) -> Event {
    event.undecryptable = true;
    event.content = json!({
        "msgtype": "m.bad.encrypted",
        "body": "** Unable to decrypt **",
    });
    event
}

/// 非加密事件原样返回；加密事件在策略超时内重试解密
pub async fn decrypt_with_timeout(
    decryptor: &dyn EventDecryptor,
    event: Event,
    policy: &DecryptRetryPolicy,
) -> Event {
    if event.event_type != event_types::ENCRYPTED {
        return event;
    }

    let deadline = Instant::now() + policy.timeout;
    let mut attempt = 0u32;
    loop {
        match decryptor.decrypt(&event).await {
            Ok(mut decrypted) => {
                decrypted.id = event.id.clone();
                decrypted.conversation_id = event.conversation_id.clone();
                decrypted.undecryptable = false;
                debug!("解密成功: event_id={}, attempts={}", event.id, attempt + 1);
                return decrypted;
            }
            Err(MirrorchatSDKError::DecryptionPending { .. }) => {
                let delay = policy.delay_for(attempt);
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                tokio::time::sleep(delay.min(deadline - now)).await;
                attempt += 1;
            }
            Err(e) => {
                warn!("解密失败（不可恢复）: event_id={}, error={}", event.id, e);
                return mark_undecryptable(event);
            }
        }
    }

    warn!(
        "解密超时，标记为无法解密: event_id={}, timeout={:?}",
        event.id, policy.timeout
    );
    mark_undecryptable(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// 前 n 次返回 pending，之后成功
    struct FlakyDecryptor {
        pending_times: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl EventDecryptor for FlakyDecryptor {
        async fn decrypt(&self, event: &Event) -> Result<Event> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.pending_times {
                return Err(MirrorchatSDKError::DecryptionPending {
                    event_id: event.id.clone(),
                });
            }
            let mut clear = event.clone();
            clear.event_type = event_types::MESSAGE.to_string();
            clear.content = json!({"msgtype": "m.text", "body": "plain"});
            clear.original_content = clear.content.clone();
            Ok(clear)
        }
    }

    fn fast_policy(timeout_ms: u64) -> DecryptRetryPolicy {
        DecryptRetryPolicy {
            timeout: Duration::from_millis(timeout_ms),
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            backoff_factor: 2.0,
            jitter_factor: 0.1,
        }
    }

    fn encrypted() -> Event {
        Event::new("$enc", event_types::ENCRYPTED, "@bob:hs", "!room", json!({"ciphertext": "..."}), 1)
    }

    #[tokio::test]
    async fn retries_until_keys_arrive() {
        let decryptor = FlakyDecryptor {
            pending_times: 2,
            calls: AtomicU32::new(0),
        };
        let event = decrypt_with_timeout(&decryptor, encrypted(), &fast_policy(2_000)).await;
        assert_eq!(event.body(), Some("plain"));
        assert!(!event.undecryptable);
        assert_eq!(decryptor.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_timeout() {
        let decryptor = FlakyDecryptor {
            pending_times: u32::MAX,
            calls: AtomicU32::new(0),
        };
        let event = decrypt_with_timeout(&decryptor, encrypted(), &fast_policy(60)).await;
        assert!(event.undecryptable);
        assert_eq!(event.event_type, event_types::ENCRYPTED);
        assert_eq!(event.content["msgtype"], "m.bad.encrypted");
    }

    #[test]
    fn delay_grows_and_caps() {
        let policy = DecryptRetryPolicy {
            jitter_factor: 0.0,
            ..fast_policy(100)
        };
        let close = |d: Duration, ms: f64| (d.as_secs_f64() * 1000.0 - ms).abs() < 0.01;
        assert!(close(policy.delay_for(0), 5.0));
        assert!(close(policy.delay_for(1), 10.0));
        assert!(close(policy.delay_for(5), 20.0));
    }
}
