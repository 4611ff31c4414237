//! 数据访问层 (DAO) - 每张表一个专门的操作模块
//!
//! 一个逻辑事件会按类型镜像到多张表，跨表写入统一走 `TransactionManager`。

pub mod member;
pub mod message;
pub mod message_edit;
pub mod message_search;
pub mod reaction;
pub mod receipt;
pub mod redaction;
pub mod thread;
pub mod timeline;

pub use member::MemberDao;
pub use message::MessageDao;
pub use message_edit::MessageEditDao;
pub use message_search::MessageSearchDao;
pub use reaction::ReactionDao;
pub use receipt::ReceiptDao;
pub use redaction::RedactionDao;
pub use thread::ThreadDao;
pub use timeline::TimelineDao;

use rusqlite::types::Type;
use rusqlite::{Connection, Row};

use crate::error::{MirrorchatSDKError, Result};

/// 读取 TEXT 列中的 JSON
pub(crate) fn json_column(row: &Row, idx: usize) -> rusqlite::Result<serde_json::Value> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// DAO 工厂 - 统一创建各种 DAO 实例
pub struct DaoFactory;

impl DaoFactory {
    pub fn timeline_dao(conn: &Connection) -> TimelineDao<'_> {
        TimelineDao::new(conn)
    }

    pub fn message_dao(conn: &Connection) -> MessageDao<'_> {
        MessageDao::new(conn)
    }

    pub fn message_edit_dao(conn: &Connection) -> MessageEditDao<'_> {
        MessageEditDao::new(conn)
    }

    pub fn message_search_dao(conn: &Connection) -> MessageSearchDao<'_> {
        MessageSearchDao::new(conn)
    }

    pub fn reaction_dao(conn: &Connection) -> ReactionDao<'_> {
        ReactionDao::new(conn)
    }

    pub fn thread_dao(conn: &Connection) -> ThreadDao<'_> {
        ThreadDao::new(conn)
    }

    pub fn member_dao(conn: &Connection) -> MemberDao<'_> {
        MemberDao::new(conn)
    }

    pub fn receipt_dao(conn: &Connection) -> ReceiptDao<'_> {
        ReceiptDao::new(conn)
    }

    pub fn redaction_dao(conn: &Connection) -> RedactionDao<'_> {
        RedactionDao::new(conn)
    }
}

/// 事务管理器 - 统一管理跨表操作的事务
///
/// 闭包返回错误时事务随 drop 回滚，其他行不受影响。
pub struct TransactionManager<'a> {
    conn: &'a Connection,
}

impl<'a> TransactionManager<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn execute<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R>,
    {
        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(|e| MirrorchatSDKError::StoreWrite(format!("开始事务失败: {}", e)))?;

        let result = f(self.conn)?;

        tx.commit()
            .map_err(|e| MirrorchatSDKError::StoreWrite(format!("提交事务失败: {}", e)))?;

        Ok(result)
    }
}
