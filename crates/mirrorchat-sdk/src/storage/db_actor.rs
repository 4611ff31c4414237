//! 数据库 Actor - 单线程数据库访问模型
//!
//! 核心设计：
//! - SQLite Connection 永远只在一个专用线程中
//! - 所有数据库操作通过 channel 发送命令，结果经 oneshot 返回
//! - 句柄维护"已入队未完成"的命令计数，同步协调器据此做写队列背压

use crossbeam_channel::{unbounded, Receiver, Sender};
use rusqlite::Connection;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, error, info};

use crate::error::{MirrorchatSDKError, Result};
use crate::storage::dao::DaoFactory;
use crate::storage::entities::{
    Event, EventQuery, MemberRow, PageResult, ReactionRow, ReceiptRow, TableRowState, ThreadMarker,
};
use crate::storage::migrate;
use crate::storage::mirror::{self, RedactOutcome, UpsertOutcome};

type Reply<T> = oneshot::Sender<Result<T>>;

/// 数据库命令
pub enum DbCommand {
    /// 打开（必要时创建并迁移）用户数据库
    Open {
        user_id: String,
        db_path: PathBuf,
        respond_to: Reply<()>,
    },
    Upsert {
        event: Event,
        respond_to: Reply<UpsertOutcome>,
    },
    /// 按事件 ID 或事务 ID 撤回
    Redact {
        ids: Vec<String>,
        redaction: Option<Event>,
        respond_to: Reply<RedactOutcome>,
    },
    Query {
        query: EventQuery,
        page: u32,
        limit: u32,
        respond_to: Reply<PageResult<Event>>,
    },
    Count {
        query: EventQuery,
        respond_to: Reply<u64>,
    },
    GetEvent {
        event_id: String,
        respond_to: Reply<Option<Event>>,
    },
    GetThread {
        root_id: String,
        respond_to: Reply<Option<ThreadMarker>>,
    },
    GetReactions {
        target_id: String,
        respond_to: Reply<Vec<ReactionRow>>,
    },
    GetReceipt {
        conversation_id: String,
        user_id: String,
        respond_to: Reply<Option<ReceiptRow>>,
    },
    GetMember {
        conversation_id: String,
        user_id: String,
        respond_to: Reply<Option<MemberRow>>,
    },
    CancelLocalEcho {
        transaction_id: String,
        respond_to: Reply<Option<Event>>,
    },
    PurgeConversation {
        conversation_id: String,
        respond_to: Reply<usize>,
    },
    TableRowsFor {
        id: String,
        respond_to: Reply<Vec<TableRowState>>,
    },
    SchemaVersion {
        respond_to: Reply<Option<i64>>,
    },
    /// 停止 Actor
    Shutdown,
}

/// 数据库 Actor（运行在独立线程）
pub struct DbActor {
    connection: Option<Connection>,
    user_id: String,
    receiver: Receiver<DbCommand>,
    pending: Arc<AtomicUsize>,
    drained: Arc<Notify>,
    thread_id: thread::ThreadId,
}

impl DbActor {
    fn new(receiver: Receiver<DbCommand>, pending: Arc<AtomicUsize>, drained: Arc<Notify>) -> Self {
        let thread_id = thread::current().id();
        info!("🚀 [Thread {:?}] DbActor 已启动", thread_id);
        Self {
            connection: None,
            user_id: String::new(),
            receiver,
            pending,
            drained,
            thread_id,
        }
    }

    fn conn(&self) -> Result<&Connection> {
        self.connection
            .as_ref()
            .ok_or_else(|| MirrorchatSDKError::NotInitialized("数据库尚未打开".to_string()))
    }

    fn handle_open(&mut self, user_id: String, db_path: PathBuf) -> Result<()> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut conn = Connection::open(&db_path)
            .map_err(|e| MirrorchatSDKError::Database(format!("打开数据库失败: {}", e)))?;
        migrate::init_db(&mut conn)?;
        info!(
            "✅ [Thread {:?}] 数据库已打开: user_id={}, path={}",
            self.thread_id,
            user_id,
            db_path.display()
        );
        self.connection = Some(conn);
        self.user_id = user_id;
        Ok(())
    }

    /// 写库错误统一归类为 StoreWrite，调用方可重试
    fn write_error(&self, e: MirrorchatSDKError) -> MirrorchatSDKError {
        match e {
            MirrorchatSDKError::StoreWrite(_) | MirrorchatSDKError::NotInitialized(_) => e,
            other => MirrorchatSDKError::StoreWrite(other.to_string()),
        }
    }

    fn handle_upsert(&self, event: &Event) -> Result<UpsertOutcome> {
        mirror::upsert_event(self.conn()?, &self.user_id, event).map_err(|e| {
            error!(
                "❌ [Thread {:?}] 写入事件失败: event_id={}, error={}",
                self.thread_id, event.id, e
            );
            self.write_error(e)
        })
    }

    fn handle_redact(&self, ids: &[String], redaction: Option<&Event>) -> Result<RedactOutcome> {
        mirror::redact_events(self.conn()?, ids, redaction).map_err(|e| self.write_error(e))
    }

    fn handle_query(&self, query: &EventQuery, page: u32, limit: u32) -> Result<PageResult<Event>> {
        let dao = DaoFactory::timeline_dao(self.conn()?);
        let items = dao.query(query, page, limit)?;
        let total = dao.count(query)?;
        Ok(PageResult::new(items, total, page, limit))
    }

    fn run(mut self) {
        debug!("🔄 [Thread {:?}] DbActor 开始处理命令", self.thread_id);

        while let Ok(command) = self.receiver.recv() {
            let stop = matches!(command, DbCommand::Shutdown);
            self.dispatch(command);
            self.pending.fetch_sub(1, Ordering::AcqRel);
            self.drained.notify_waiters();
            if stop {
                info!("🛑 [Thread {:?}] DbActor 收到停止信号", self.thread_id);
                break;
            }
        }
        self.connection = None;
    }

    fn dispatch(&mut self, command: DbCommand) {
        match command {
            DbCommand::Shutdown => {}
            DbCommand::Open {
                user_id,
                db_path,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_open(user_id, db_path));
            }
            DbCommand::Upsert { event, respond_to } => {
                let _ = respond_to.send(self.handle_upsert(&event));
            }
            DbCommand::Redact {
                ids,
                redaction,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_redact(&ids, redaction.as_ref()));
            }
            DbCommand::Query {
                query,
                page,
                limit,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_query(&query, page, limit));
            }
            DbCommand::Count { query, respond_to } => {
                let result = self
                    .conn()
                    .and_then(|conn| DaoFactory::timeline_dao(conn).count(&query));
                let _ = respond_to.send(result);
            }
            DbCommand::GetEvent {
                event_id,
                respond_to,
            } => {
                let result = self
                    .conn()
                    .and_then(|conn| DaoFactory::timeline_dao(conn).get(&event_id));
                let _ = respond_to.send(result);
            }
            DbCommand::GetThread {
                root_id,
                respond_to,
            } => {
                let result = self
                    .conn()
                    .and_then(|conn| DaoFactory::thread_dao(conn).get(&root_id));
                let _ = respond_to.send(result);
            }
            DbCommand::GetReactions {
                target_id,
                respond_to,
            } => {
                let result = self
                    .conn()
                    .and_then(|conn| DaoFactory::reaction_dao(conn).list_for_target(&target_id));
                let _ = respond_to.send(result);
            }
            DbCommand::GetReceipt {
                conversation_id,
                user_id,
                respond_to,
            } => {
                let result = self
                    .conn()
                    .and_then(|conn| DaoFactory::receipt_dao(conn).get(&conversation_id, &user_id));
                let _ = respond_to.send(result);
            }
            DbCommand::GetMember {
                conversation_id,
                user_id,
                respond_to,
            } => {
                let result = self
                    .conn()
                    .and_then(|conn| DaoFactory::member_dao(conn).get(&conversation_id, &user_id));
                let _ = respond_to.send(result);
            }
            DbCommand::CancelLocalEcho {
                transaction_id,
                respond_to,
            } => {
                let result = self
                    .conn()
                    .and_then(|conn| mirror::cancel_local_echo(conn, &transaction_id))
                    .map_err(|e| self.write_error(e));
                let _ = respond_to.send(result);
            }
            DbCommand::PurgeConversation {
                conversation_id,
                respond_to,
            } => {
                let result = self
                    .conn()
                    .and_then(|conn| mirror::purge_conversation(conn, &conversation_id))
                    .map_err(|e| self.write_error(e));
                let _ = respond_to.send(result);
            }
            DbCommand::TableRowsFor { id, respond_to } => {
                let result = self.conn().and_then(|conn| mirror::table_rows_for(conn, &id));
                let _ = respond_to.send(result);
            }
            DbCommand::SchemaVersion { respond_to } => {
                let result = self.conn().and_then(migrate::schema_version);
                let _ = respond_to.send(result);
            }
        }
    }
}

/// 数据库 Actor 句柄（用于异步调用）
#[derive(Clone)]
pub struct DbActorHandle {
    sender: Sender<DbCommand>,
    pending: Arc<AtomicUsize>,
    drained: Arc<Notify>,
}

impl std::fmt::Debug for DbActorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbActorHandle")
            .field("sender", &"<channel>")
            .field("pending", &self.pending.load(Ordering::Acquire))
            .finish()
    }
}

impl DbActorHandle {
    /// 启动 DB Actor 专用线程
    pub fn spawn() -> Result<Self> {
        let (sender, receiver) = unbounded();
        let pending = Arc::new(AtomicUsize::new(0));
        let drained = Arc::new(Notify::new());

        let actor_pending = pending.clone();
        let actor_drained = drained.clone();
        thread::Builder::new()
            .name("db-actor".to_string())
            .spawn(move || {
                let actor = DbActor::new(receiver, actor_pending, actor_drained);
                actor.run();
            })
            .map_err(|e| MirrorchatSDKError::IO(format!("无法启动 DB Actor 线程: {}", e)))?;

        Ok(Self {
            sender,
            pending,
            drained,
        })
    }

    /// 已入队但尚未处理完的命令数
    pub fn pending_depth(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// 等待写队列深度降到阈值以下
    pub async fn wait_for_drain(&self, threshold: usize) {
        let threshold = threshold.max(1);
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending_depth() < threshold {
                return;
            }
            notified.await;
        }
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> DbCommand) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.pending.fetch_add(1, Ordering::AcqRel);
        if self.sender.send(build(tx)).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return Err(MirrorchatSDKError::ShuttingDown("DB Actor 已停止".to_string()));
        }
        rx.await
            .map_err(|_| MirrorchatSDKError::ShuttingDown("DB Actor 响应失败".to_string()))?
    }

    pub async fn open(&self, user_id: String, db_path: PathBuf) -> Result<()> {
        self.request(|respond_to| DbCommand::Open {
            user_id,
            db_path,
            respond_to,
        })
        .await
    }

    pub async fn upsert(&self, event: Event) -> Result<UpsertOutcome> {
        self.request(|respond_to| DbCommand::Upsert { event, respond_to })
            .await
    }

    pub async fn redact(&self, ids: Vec<String>, redaction: Option<Event>) -> Result<RedactOutcome> {
        self.request(|respond_to| DbCommand::Redact {
            ids,
            redaction,
            respond_to,
        })
        .await
    }

    pub async fn query(&self, query: EventQuery, page: u32, limit: u32) -> Result<PageResult<Event>> {
        self.request(|respond_to| DbCommand::Query {
            query,
            page,
            limit,
            respond_to,
        })
        .await
    }

    pub async fn count(&self, query: EventQuery) -> Result<u64> {
        self.request(|respond_to| DbCommand::Count { query, respond_to })
            .await
    }

    pub async fn get_event(&self, event_id: String) -> Result<Option<Event>> {
        self.request(|respond_to| DbCommand::GetEvent {
            event_id,
            respond_to,
        })
        .await
    }

    pub async fn get_thread(&self, root_id: String) -> Result<Option<ThreadMarker>> {
        self.request(|respond_to| DbCommand::GetThread {
            root_id,
            respond_to,
        })
        .await
    }

    pub async fn get_reactions(&self, target_id: String) -> Result<Vec<ReactionRow>> {
        self.request(|respond_to| DbCommand::GetReactions {
            target_id,
            respond_to,
        })
        .await
    }

    pub async fn get_receipt(&self, conversation_id: String, user_id: String) -> Result<Option<ReceiptRow>> {
        self.request(|respond_to| DbCommand::GetReceipt {
            conversation_id,
            user_id,
            respond_to,
        })
        .await
    }

    pub async fn get_member(&self, conversation_id: String, user_id: String) -> Result<Option<MemberRow>> {
        self.request(|respond_to| DbCommand::GetMember {
            conversation_id,
            user_id,
            respond_to,
        })
        .await
    }

    pub async fn cancel_local_echo(&self, transaction_id: String) -> Result<Option<Event>> {
        self.request(|respond_to| DbCommand::CancelLocalEcho {
            transaction_id,
            respond_to,
        })
        .await
    }

    pub async fn purge_conversation(&self, conversation_id: String) -> Result<usize> {
        self.request(|respond_to| DbCommand::PurgeConversation {
            conversation_id,
            respond_to,
        })
        .await
    }

    pub async fn table_rows_for(&self, id: String) -> Result<Vec<TableRowState>> {
        self.request(|respond_to| DbCommand::TableRowsFor { id, respond_to })
            .await
    }

    pub async fn schema_version(&self) -> Result<Option<i64>> {
        self.request(|respond_to| DbCommand::SchemaVersion { respond_to })
            .await
    }

    /// 停止 DB Actor（已入队的命令会先处理完）
    pub fn shutdown(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        if self.sender.send(DbCommand::Shutdown).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::entities::event_types;
    use crate::version::SDK_DB_VERSION;
    use serde_json::json;
    use tempfile::TempDir;

    async fn open_handle(dir: &TempDir) -> DbActorHandle {
        let handle = DbActorHandle::spawn().unwrap();
        handle
            .open("@me:hs".into(), dir.path().join("u").join("events.db"))
            .await
            .unwrap();
        handle
    }

    #[tokio::test]
    async fn commands_round_trip_through_actor() {
        let dir = TempDir::new().unwrap();
        let handle = open_handle(&dir).await;
        assert_eq!(handle.schema_version().await.unwrap(), Some(SDK_DB_VERSION));

        let event = Event::new("$a", event_types::MESSAGE, "@bob:hs", "!room", json!({"body": "hi"}), 1);
        handle.upsert(event.clone()).await.unwrap();
        let page = handle.query(EventQuery::conversation("!room"), 0, 10).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.page_count, 1);
        assert_eq!(handle.get_event("$a".into()).await.unwrap().unwrap().body(), Some("hi"));

        handle.shutdown();
        handle.wait_for_drain(1).await;
        assert!(handle.get_event("$a".into()).await.is_err());
    }

    #[tokio::test]
    async fn commands_before_open_fail() {
        let handle = DbActorHandle::spawn().unwrap();
        let err = handle.count(EventQuery::default()).await.unwrap_err();
        assert!(matches!(err, MirrorchatSDKError::NotInitialized(_)));
        handle.shutdown();
    }

    #[tokio::test]
    async fn drain_waits_for_queued_writes() {
        let dir = TempDir::new().unwrap();
        let handle = open_handle(&dir).await;
        let mut writes = Vec::new();
        for i in 0..50 {
            let h = handle.clone();
            writes.push(tokio::spawn(async move {
                let event = Event::new(format!("$m{}", i), event_types::MESSAGE, "@bob:hs", "!room", json!({"body": "x"}), i);
                h.upsert(event).await
            }));
        }
        handle.wait_for_drain(1).await;
        assert_eq!(handle.pending_depth(), 0);
        for write in writes {
            write.await.unwrap().unwrap();
        }
        assert_eq!(handle.count(EventQuery::default()).await.unwrap(), 50);
    }
}
