//! 同步游标存储
//!
//! Key 格式：sync_cursor:{conversation_id} 或 sync_cursor:{conversation_id}:{thread_id}
//! 时间线锚点：timeline_anchor:{同上}

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::storage::entities::ScopeKey;
use crate::storage::kv::KvStore;

const PREFIX: &str = "sync_cursor";
const ANCHOR_PREFIX: &str = "timeline_anchor";

/// 每个 scope 的同步进度
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    /// 向更早历史翻页的令牌（只由全量回填推进）
    pub pagination_token: Option<String>,
    /// 见过的时间戳最大的事件，同时是下次追赶的检查点
    pub last_event_id: Option<String>,
    pub last_event_ts: i64,
    /// 置位后为终态，只能通过 reset 清除
    pub is_complete: bool,
}

impl SyncCursor {
    /// 记录一个已提交事件，保留时间戳最大者
    pub fn observe(&mut self, event_id: &str, ts: i64) {
        if self.last_event_id.is_none() || ts > self.last_event_ts {
            self.last_event_id = Some(event_id.to_string());
            self.last_event_ts = ts;
        }
    }
}

/// 时间线窗口被淘汰后的最后可用锚点
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineAnchor {
    pub event_id: String,
    pub timestamp: i64,
}

#[derive(Clone)]
pub struct SyncCursorStore {
    kv: KvStore,
}

impl SyncCursorStore {
    pub fn new(kv: KvStore) -> Self {
        Self { kv }
    }

    fn scoped(prefix: &str, scope: &ScopeKey) -> String {
        match &scope.thread_id {
            None => format!("{}:{}", prefix, scope.conversation_id),
            Some(thread_id) => format!("{}:{}:{}", prefix, scope.conversation_id, thread_id),
        }
    }

    pub fn key(scope: &ScopeKey) -> String {
        Self::scoped(PREFIX, scope)
    }

    pub async fn get(&self, scope: &ScopeKey) -> Result<Option<SyncCursor>> {
        self.kv.get(Self::key(scope)).await
    }

    pub async fn set(&self, scope: &ScopeKey, cursor: &SyncCursor) -> Result<()> {
        self.kv.set(Self::key(scope), cursor).await
    }

    /// 删除游标（历史清空后重新开始）
    pub async fn reset(&self, scope: &ScopeKey) -> Result<bool> {
        let removed = self.kv.delete(Self::key(scope)).await?;
        self.kv.delete(Self::scoped(ANCHOR_PREFIX, scope)).await?;
        Ok(removed)
    }

    /// 清除某会话下所有 scope（含线程）的游标
    pub async fn reset_conversation(&self, conversation_id: &str) -> Result<usize> {
        let mut removed = 0;
        for prefix in [PREFIX, ANCHOR_PREFIX] {
            let exact = format!("{}:{}", prefix, conversation_id);
            if self.kv.delete(&exact).await? {
                removed += 1;
            }
            removed += self.kv.delete_prefix(&format!("{}:", exact)).await?;
        }
        Ok(removed)
    }

    pub async fn get_anchor(&self, scope: &ScopeKey) -> Result<Option<TimelineAnchor>> {
        self.kv.get(Self::scoped(ANCHOR_PREFIX, scope)).await
    }

    pub async fn set_anchor(&self, scope: &ScopeKey, anchor: &TimelineAnchor) -> Result<()> {
        self.kv.set(Self::scoped(ANCHOR_PREFIX, scope), anchor).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn cursor_key_format() {
        assert_eq!(SyncCursorStore::key(&ScopeKey::conversation("!r")), "sync_cursor:!r");
        assert_eq!(
            SyncCursorStore::key(&ScopeKey::thread("!r", "$t")),
            "sync_cursor:!r:$t"
        );
    }

    #[test]
    fn observe_keeps_newest() {
        let mut cursor = SyncCursor::default();
        cursor.observe("$b", 20);
        cursor.observe("$a", 10);
        assert_eq!(cursor.last_event_id.as_deref(), Some("$b"));
        assert_eq!(cursor.last_event_ts, 20);
    }

    #[tokio::test]
    async fn reset_conversation_clears_threads_too() {
        let dir = TempDir::new().unwrap();
        let kv = KvStore::open(&dir.path().join("kv"), "@me:hs").await.unwrap();
        let store = SyncCursorStore::new(kv);
        let main = ScopeKey::conversation("!r");
        let thread = ScopeKey::thread("!r", "$t");
        let other = ScopeKey::conversation("!r2");
        for scope in [&main, &thread, &other] {
            store.set(scope, &SyncCursor::default()).await.unwrap();
        }

        assert_eq!(store.reset_conversation("!r").await.unwrap(), 2);
        assert!(store.get(&main).await.unwrap().is_none());
        assert!(store.get(&thread).await.unwrap().is_none());
        assert!(store.get(&other).await.unwrap().is_some());
    }
}
