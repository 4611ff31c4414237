//! 存储模块 - 事件镜像的持久化层
//!
//! 分层：
//! - StorageManager: 统一的存储管理器，写入后发出变更通知
//! - DbActor: 独占 SQLite 连接的专用线程
//! - DAO Layer: 每张表一个专门的操作模块
//! - KvStore: sled 键值存储（游标、计数快照、锚点）

use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::Result;
use crate::events::{CommitOrigin, EventAdded, EventManager, EventRedacted};

pub mod dao;
pub mod db_actor;
pub mod deduplication;
pub mod entities;
pub mod kv;
pub mod migrate;
pub mod mirror;

pub use dao::{DaoFactory, TransactionManager};
pub use db_actor::DbActorHandle;
pub use entities::*;
pub use kv::KvStore;
pub use mirror::{RedactOutcome, UpsertOutcome, UpsertStatus};

/// 路径里不安全的字符替换为 `_`
fn path_segment(user_id: &str) -> String {
    user_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect()
}

/// 存储管理器
#[derive(Clone)]
pub struct StorageManager {
    user_dir: PathBuf,
    db: DbActorHandle,
    kv: KvStore,
    events: EventManager,
}

impl std::fmt::Debug for StorageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageManager")
            .field("user_dir", &self.user_dir)
            .field("db", &self.db)
            .finish()
    }
}

impl StorageManager {
    /// 打开 `{data_dir}/users/{user_id}/` 下的 events.db 与 kv
    pub async fn open(data_dir: &Path, user_id: &str, events: EventManager) -> Result<Self> {
        let user_dir = data_dir.join("users").join(path_segment(user_id));
        let db = DbActorHandle::spawn()?;
        db.open(user_id.to_string(), user_dir.join("events.db")).await?;
        let kv = KvStore::open(&user_dir.join("kv"), user_id).await?;
        info!("存储已初始化: user_id={}, dir={}", user_id, user_dir.display());
        Ok(Self {
            user_dir,
            db,
            kv,
            events,
        })
    }

    pub fn user_dir(&self) -> &Path {
        &self.user_dir
    }

    pub fn db(&self) -> &DbActorHandle {
        &self.db
    }

    pub fn kv(&self) -> &KvStore {
        &self.kv
    }

    /// 幂等写入；有实际变化时发出 EventAdded
    pub async fn upsert(&self, event: Event, origin: CommitOrigin) -> Result<UpsertOutcome> {
        let outcome = self.db.upsert(event).await?;
        if outcome.changed() {
            self.events.emit_event_added(EventAdded {
                scope: outcome.event.scope(),
                event: outcome.event.clone(),
                origin,
                is_thread_root: outcome.is_thread_root,
                replaced_local_echo: outcome.replaced_local_echo.clone(),
            });
        } else {
            debug!("写入无变化: event_id={}, status={:?}", outcome.event.id, outcome.status);
        }
        Ok(outcome)
    }

    /// 撤回扇出；每个新撤回的行发出 EventRedacted
    pub async fn redact(&self, ids: Vec<String>, redaction: Option<Event>) -> Result<RedactOutcome> {
        let redaction_event_id = redaction.as_ref().map(|r| r.id.clone());
        let outcome = self.db.redact(ids, redaction).await?;
        for event in &outcome.redacted {
            self.events.emit_event_redacted(EventRedacted {
                scope: event.scope(),
                event: event.clone(),
                redaction_event_id: redaction_event_id.clone(),
            });
        }
        Ok(outcome)
    }

    pub async fn query(&self, query: EventQuery, page: u32, limit: u32) -> Result<PageResult<Event>> {
        self.db.query(query, page, limit).await
    }

    pub async fn count(&self, query: EventQuery) -> Result<u64> {
        self.db.count(query).await
    }

    pub async fn get_event(&self, event_id: &str) -> Result<Option<Event>> {
        self.db.get_event(event_id.to_string()).await
    }

    pub async fn get_thread(&self, root_id: &str) -> Result<Option<ThreadMarker>> {
        self.db.get_thread(root_id.to_string()).await
    }

    pub async fn get_reactions(&self, target_id: &str) -> Result<Vec<ReactionRow>> {
        self.db.get_reactions(target_id.to_string()).await
    }

    pub async fn get_receipt(&self, conversation_id: &str, user_id: &str) -> Result<Option<ReceiptRow>> {
        self.db
            .get_receipt(conversation_id.to_string(), user_id.to_string())
            .await
    }

    pub async fn get_member(&self, conversation_id: &str, user_id: &str) -> Result<Option<MemberRow>> {
        self.db
            .get_member(conversation_id.to_string(), user_id.to_string())
            .await
    }

    pub async fn cancel_local_echo(&self, transaction_id: &str) -> Result<Option<Event>> {
        self.db.cancel_local_echo(transaction_id.to_string()).await
    }

    pub async fn purge_conversation(&self, conversation_id: &str) -> Result<usize> {
        self.db.purge_conversation(conversation_id.to_string()).await
    }

    pub async fn table_rows_for(&self, id: &str) -> Result<Vec<TableRowState>> {
        self.db.table_rows_for(id.to_string()).await
    }

    pub async fn schema_version(&self) -> Result<Option<i64>> {
        self.db.schema_version().await
    }

    pub async fn wait_for_drain(&self, threshold: usize) {
        self.db.wait_for_drain(threshold).await
    }

    /// 刷盘 KV 并停止 DbActor
    pub async fn shutdown(&self) -> Result<()> {
        let flushed = self.kv.flush().await;
        self.db.shutdown();
        self.db.wait_for_drain(1).await;
        info!("存储已关闭: dir={}", self.user_dir.display());
        flushed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn upsert_emits_only_on_change() {
        let dir = TempDir::new().unwrap();
        let events = EventManager::new(16);
        let mut added = events.subscribe_event_added();
        let mut redacted = events.subscribe_event_redacted();
        let storage = StorageManager::open(dir.path(), "@me:hs", events.clone()).await.unwrap();
        assert!(storage.user_dir().ends_with("users/_me_hs"));

        let event = Event::new("$a", event_types::MESSAGE, "@bob:hs", "!room", json!({"body": "hi"}), 1);
        storage.upsert(event.clone(), CommitOrigin::Live).await.unwrap();
        storage.upsert(event, CommitOrigin::Live).await.unwrap();
        assert_eq!(added.recv().await.unwrap().event.id, "$a");
        assert!(added.try_recv().is_err());

        storage.redact(vec!["$a".into()], None).await.unwrap();
        let notice = redacted.recv().await.unwrap();
        assert_eq!(notice.event.id, "$a");
        assert!(notice.event.redacted);

        storage.shutdown().await.unwrap();
    }
}
