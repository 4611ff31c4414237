use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// 事件去重管理器
///
/// 基于 event_id 去重，防止同一个事件在重放/重试中被重复提交。
/// 写库失败时调用 `unmark`，让该事件下次还能被处理。
#[derive(Clone)]
pub struct DeduplicationManager {
    /// 已处理的事件集合 (event_id -> 标记时间)
    processed: Arc<Mutex<HashMap<String, Instant>>>,
    retention: Duration,
    max_cache_size: usize,
    /// 超过此值时触发清理
    cleanup_threshold: usize,
}

impl DeduplicationManager {
    pub fn new() -> Self {
        Self::with_config(Duration::from_secs(3600), 50_000)
    }

    pub fn with_config(retention: Duration, max_cache_size: usize) -> Self {
        Self {
            processed: Arc::new(Mutex::new(HashMap::new())),
            retention,
            max_cache_size,
            cleanup_threshold: max_cache_size * 4 / 5, // 80% 阈值
        }
    }

    /// 已处理过返回 true
    pub fn is_duplicate(&self, event_id: &str) -> bool {
        let duplicate = self.processed.lock().contains_key(event_id);
        if duplicate {
            debug!("🔄 检测到重复事件: event_id={}", event_id);
        }
        duplicate
    }

    pub fn mark_as_processed(&self, event_id: &str) {
        let mut processed = self.processed.lock();
        processed.insert(event_id.to_string(), Instant::now());
        if processed.len() > self.cleanup_threshold {
            self.cleanup_expired_internal(&mut processed);
        }
    }

    /// 原子地检查并标记：首次出现返回 true
    pub fn check_and_mark(&self, event_id: &str) -> bool {
        let mut processed = self.processed.lock();
        if processed.contains_key(event_id) {
            return false;
        }
        processed.insert(event_id.to_string(), Instant::now());
        if processed.len() > self.cleanup_threshold {
            self.cleanup_expired_internal(&mut processed);
        }
        true
    }

    /// 回滚标记（提交失败）
    pub fn unmark(&self, event_id: &str) {
        if self.processed.lock().remove(event_id).is_some() {
            debug!("↩️ 撤销去重标记: event_id={}", event_id);
        }
    }

    /// 需要已持有锁；过期清理后仍超上限则丢弃最旧的记录
    fn cleanup_expired_internal(&self, processed: &mut HashMap<String, Instant>) {
        let now = Instant::now();
        let initial_count = processed.len();
        processed.retain(|_, marked_at| now.duration_since(*marked_at) <= self.retention);

        if processed.len() > self.max_cache_size {
            let mut by_age: Vec<(String, Instant)> =
                processed.iter().map(|(k, v)| (k.clone(), *v)).collect();
            by_age.sort_by_key(|(_, marked_at)| *marked_at);
            let excess = processed.len() - self.cleanup_threshold;
            for (key, _) in by_age.into_iter().take(excess) {
                processed.remove(&key);
            }
        }

        let removed_count = initial_count - processed.len();
        if removed_count > 0 {
            info!(
                "🧹 清理去重记录: 移除了 {} 条记录，剩余 {} 条",
                removed_count,
                processed.len()
            );
        }
    }

    pub fn cleanup_expired(&self) {
        let mut processed = self.processed.lock();
        self.cleanup_expired_internal(&mut processed);
    }

    /// (当前条数, 上限)
    pub fn get_stats(&self) -> (usize, usize) {
        (self.processed.lock().len(), self.max_cache_size)
    }

    pub fn clear(&self) {
        self.processed.lock().clear();
        info!("事件去重缓存已清空");
    }
}

impl Default for DeduplicationManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_event_dedup() {
        let manager = DeduplicationManager::new();
        assert!(!manager.is_duplicate("$e1"));
        assert!(manager.check_and_mark("$e1"));
        assert!(manager.is_duplicate("$e1"));
        assert!(!manager.check_and_mark("$e1"));
        assert!(!manager.is_duplicate("$e2"));
    }

    #[test]
    fn test_unmark_after_failed_commit() {
        let manager = DeduplicationManager::new();
        manager.mark_as_processed("$e1");
        manager.unmark("$e1");
        assert!(manager.check_and_mark("$e1"));
    }

    #[test]
    fn test_cleanup_expired() {
        let manager = DeduplicationManager::with_config(Duration::from_millis(50), 100);
        manager.mark_as_processed("$e1");
        manager.mark_as_processed("$e2");
        assert_eq!(manager.get_stats().0, 2);

        thread::sleep(Duration::from_millis(120));
        manager.cleanup_expired();
        assert_eq!(manager.get_stats().0, 0);
    }
}
