//! 事件系统模块 - 变更通知的类型化广播
//!
//! 每种通知一个独立的 broadcast channel（UI 层按需订阅）：
//! - EventAdded：事件落库
//! - EventRedacted：事件被撤回
//! - NotificationChanged：未读/高亮计数桶变化
//! - SyncStatusChanged：某个 scope 的同步状态变化
//!
//! 内部管线（时间线缓存、通知计数）需要跨类型的严格顺序，
//! 通过 `subscribe_ordered` 拿到按发出顺序排列的无界队列。

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::storage::entities::{Event, ScopeKey};
use crate::sync::SyncMode;

/// 事件是怎么进入存储的
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitOrigin {
    /// 同步分页提交（page_index 从 0 开始，0 为首页）
    Sync { page_index: u32 },
    /// 本地乐观写入
    LocalEcho,
    /// 单条实时推送
    Live,
}

impl CommitOrigin {
    pub fn is_initial_page(&self) -> bool {
        matches!(self, CommitOrigin::Sync { page_index: 0 })
    }
}

#[derive(Debug, Clone)]
pub struct EventAdded {
    pub scope: ScopeKey,
    pub event: Event,
    pub origin: CommitOrigin,
    pub is_thread_root: bool,
    /// 本次确认替换掉的本地事务 ID
    pub replaced_local_echo: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EventRedacted {
    pub scope: ScopeKey,
    /// 被撤回的事件（内容已清空）
    pub event: Event,
    pub redaction_event_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationChanged {
    /// 计数桶的键（会话、线程或分组）
    pub key: String,
    pub total: u64,
    pub highlight: u64,
    /// 桶已被删除（不是归零）
    pub removed: bool,
}

/// 同步状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStatus {
    Started { mode: SyncMode },
    PageCommitted { page_index: u32, committed: usize },
    /// 追赶模式越过了检查点
    CaughtUp,
    /// 远端已无更多分页，历史完整
    Complete,
    Failed { error: String },
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct SyncStatusChanged {
    pub scope: ScopeKey,
    pub status: SyncStatus,
}

/// 按发出顺序汇总的变更通知（内部管线用）
#[derive(Debug, Clone)]
pub enum ChangeNotification {
    EventAdded(EventAdded),
    EventRedacted(EventRedacted),
    NotificationChanged(NotificationChanged),
    SyncStatusChanged(SyncStatusChanged),
}

impl ChangeNotification {
    pub fn kind(&self) -> &'static str {
        match self {
            ChangeNotification::EventAdded(_) => "event_added",
            ChangeNotification::EventRedacted(_) => "event_redacted",
            ChangeNotification::NotificationChanged(_) => "notification_changed",
            ChangeNotification::SyncStatusChanged(_) => "sync_status_changed",
        }
    }
}

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    pub total_events: u64,
    pub events_by_type: HashMap<&'static str, u64>,
    /// 毫秒时间戳
    pub last_event_time: Option<i64>,
}

/// 事件管理器
#[derive(Clone)]
pub struct EventManager {
    event_added: broadcast::Sender<EventAdded>,
    event_redacted: broadcast::Sender<EventRedacted>,
    notification_changed: broadcast::Sender<NotificationChanged>,
    sync_status: broadcast::Sender<SyncStatusChanged>,
    ordered: Arc<Mutex<Vec<mpsc::UnboundedSender<ChangeNotification>>>>,
    stats: Arc<Mutex<EventStats>>,
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            event_added: broadcast::channel(capacity).0,
            event_redacted: broadcast::channel(capacity).0,
            notification_changed: broadcast::channel(capacity).0,
            sync_status: broadcast::channel(capacity).0,
            ordered: Arc::new(Mutex::new(Vec::new())),
            stats: Arc::new(Mutex::new(EventStats::default())),
        }
    }

    /// 发布通知（无订阅者时 send 失败属正常场景，只打 debug）
    pub fn emit(&self, notification: ChangeNotification) {
        let kind = notification.kind();
        {
            let mut stats = self.stats.lock();
            stats.total_events += 1;
            *stats.events_by_type.entry(kind).or_insert(0) += 1;
            stats.last_event_time = Some(chrono::Utc::now().timestamp_millis());
        }

        self.ordered
            .lock()
            .retain(|tx| tx.send(notification.clone()).is_ok());

        let delivered = match notification {
            ChangeNotification::EventAdded(e) => self.event_added.send(e).is_ok(),
            ChangeNotification::EventRedacted(e) => self.event_redacted.send(e).is_ok(),
            ChangeNotification::NotificationChanged(e) => self.notification_changed.send(e).is_ok(),
            ChangeNotification::SyncStatusChanged(e) => self.sync_status.send(e).is_ok(),
        };
        if !delivered {
            debug!("通知无活跃订阅者: kind={}", kind);
        }
    }

    pub fn emit_event_added(&self, event: EventAdded) {
        self.emit(ChangeNotification::EventAdded(event));
    }

    pub fn emit_event_redacted(&self, event: EventRedacted) {
        self.emit(ChangeNotification::EventRedacted(event));
    }

    pub fn emit_notification_changed(&self, event: NotificationChanged) {
        self.emit(ChangeNotification::NotificationChanged(event));
    }

    pub fn emit_sync_status(&self, scope: &ScopeKey, status: SyncStatus) {
        self.emit(ChangeNotification::SyncStatusChanged(SyncStatusChanged {
            scope: scope.clone(),
            status,
        }));
    }

    pub fn subscribe_event_added(&self) -> broadcast::Receiver<EventAdded> {
        self.event_added.subscribe()
    }

    pub fn subscribe_event_redacted(&self) -> broadcast::Receiver<EventRedacted> {
        self.event_redacted.subscribe()
    }

    pub fn subscribe_notification_changed(&self) -> broadcast::Receiver<NotificationChanged> {
        self.notification_changed.subscribe()
    }

    pub fn subscribe_sync_status(&self) -> broadcast::Receiver<SyncStatusChanged> {
        self.sync_status.subscribe()
    }

    /// 订阅全部通知，保持发出顺序，不丢弃
    pub fn subscribe_ordered(&self) -> mpsc::UnboundedReceiver<ChangeNotification> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.ordered.lock().push(tx);
        rx
    }

    pub fn get_stats(&self) -> EventStats {
        self.stats.lock().clone()
    }

    /// 所有类型化 channel 上的活跃订阅者总数
    pub fn subscriber_count(&self) -> usize {
        self.event_added.receiver_count()
            + self.event_redacted.receiver_count()
            + self.notification_changed.receiver_count()
            + self.sync_status.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::entities::event_types;
    use serde_json::json;

    fn added(id: &str) -> EventAdded {
        let event = Event::new(id, event_types::MESSAGE, "@bob:hs", "!room", json!({"body": id}), 1);
        EventAdded {
            scope: event.scope(),
            event,
            origin: CommitOrigin::Live,
            is_thread_root: false,
            replaced_local_echo: None,
        }
    }

    #[tokio::test]
    async fn typed_channels_only_see_their_kind() {
        let manager = EventManager::new(16);
        let mut added_rx = manager.subscribe_event_added();
        let mut status_rx = manager.subscribe_sync_status();

        manager.emit_sync_status(&ScopeKey::conversation("!room"), SyncStatus::Complete);
        manager.emit_event_added(added("$a"));

        assert_eq!(added_rx.recv().await.unwrap().event.id, "$a");
        let status = status_rx.recv().await.unwrap();
        assert_eq!(status.status, SyncStatus::Complete);
        assert!(added_rx.try_recv().is_err());

        let stats = manager.get_stats();
        assert_eq!(stats.total_events, 2);
        assert_eq!(stats.events_by_type.get("event_added"), Some(&1));
    }

    #[tokio::test]
    async fn ordered_feed_preserves_emission_order() {
        let manager = EventManager::new(1);
        let mut feed = manager.subscribe_ordered();
        manager.emit_event_added(added("$a"));
        manager.emit_sync_status(&ScopeKey::conversation("!room"), SyncStatus::CaughtUp);
        manager.emit_event_added(added("$b"));

        let kinds: Vec<&str> = (0..3).map(|_| feed.try_recv().unwrap().kind()).collect();
        assert_eq!(kinds, vec!["event_added", "sync_status_changed", "event_added"]);
    }

    #[test]
    fn dropped_ordered_subscribers_are_pruned() {
        let manager = EventManager::new(4);
        drop(manager.subscribe_ordered());
        manager.emit_event_added(added("$a"));
        assert!(manager.ordered.lock().is_empty());
    }
}
