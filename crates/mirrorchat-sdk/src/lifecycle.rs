//! SDK 生命周期管理
//!
//! 管理 App 前后台切换，统一触发各模块的状态切换（同步协调器在后台时暂停翻页）。

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::Result;

/// 生命周期回调 Hook
#[async_trait]
pub trait LifecycleHook: Send + Sync {
    async fn on_background(&self) -> Result<()>;

    async fn on_foreground(&self) -> Result<()>;
}

#[derive(Clone, Copy)]
enum Transition {
    Background,
    Foreground,
}

/// 生命周期管理器
#[derive(Default)]
pub struct LifecycleManager {
    hooks: Vec<Arc<dyn LifecycleHook>>,
}

impl LifecycleManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hook_count(&self) -> usize {
        self.hooks.len()
    }

    pub fn register_hook(&mut self, hook: Arc<dyn LifecycleHook>) {
        self.hooks.push(hook);
        info!("✅ 生命周期 Hook 已注册: 当前共 {} 个", self.hooks.len());
    }

    /// 按注册顺序执行；某个 Hook 失败时记录错误并继续，最后返回第一个错误
    async fn notify(&self, transition: Transition) -> Result<()> {
        let label = match transition {
            Transition::Background => "后台",
            Transition::Foreground => "前台",
        };
        info!("🔄 通知所有模块：App 切换到{}", label);

        let mut first_error = None;
        let mut failed = 0;
        for (index, hook) in self.hooks.iter().enumerate() {
            let result = match transition {
                Transition::Background => hook.on_background().await,
                Transition::Foreground => hook.on_foreground().await,
            };
            if let Err(e) = result {
                warn!("⚠️ Hook #{} {}切换失败: {}", index, label, e);
                failed += 1;
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => {
                warn!("⚠️ {} 个模块{}切换失败，但所有模块都已尝试执行", failed, label);
                Err(e)
            }
            None => Ok(()),
        }
    }

    pub async fn notify_background(&self) -> Result<()> {
        self.notify(Transition::Background).await
    }

    pub async fn notify_foreground(&self) -> Result<()> {
        self.notify(Transition::Foreground).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MirrorchatSDKError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHook {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl LifecycleHook for CountingHook {
        async fn on_background(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(MirrorchatSDKError::InvalidArgument("boom".into()));
            }
            Ok(())
        }

        async fn on_foreground(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn failing_hook_does_not_stop_others() {
        let failing = Arc::new(CountingHook {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let healthy = Arc::new(CountingHook {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let mut manager = LifecycleManager::new();
        manager.register_hook(failing.clone());
        manager.register_hook(healthy.clone());

        assert!(manager.notify_background().await.is_err());
        assert_eq!(healthy.calls.load(Ordering::SeqCst), 1);
        manager.notify_foreground().await.unwrap();
        assert_eq!(failing.calls.load(Ordering::SeqCst), 2);
    }
}
