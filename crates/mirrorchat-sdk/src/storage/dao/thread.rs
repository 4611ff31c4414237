//! threads 表 DAO - 线程标记
//!
//! 线程回复到达时累加 reply_count 并刷新最新回复；
//! 线程根事件携带的摘要只会把计数往大的方向合并。

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::storage::entities::{ThreadMarker, ThreadSummary};

pub struct ThreadDao<'a> {
    conn: &'a Connection,
}

impl<'a> ThreadDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn get(&self, root_id: &str) -> Result<Option<ThreadMarker>> {
        Ok(self
            .conn
            .query_row(
                "SELECT root_id, conversation_id, reply_count, latest_event_id, latest_ts, participated, redacted
                 FROM threads WHERE root_id = ?1",
                params![root_id],
                |row| {
                    Ok(ThreadMarker {
                        root_id: row.get(0)?,
                        conversation_id: row.get(1)?,
                        reply_count: row.get(2)?,
                        latest_event_id: row.get(3)?,
                        latest_ts: row.get(4)?,
                        participated: row.get(5)?,
                        redacted: row.get(6)?,
                    })
                },
            )
            .optional()?)
    }

    /// 新回复：reply_count + 1，时间更新则替换 latest
    pub fn record_reply(
        &self,
        root_id: &str,
        conversation_id: &str,
        reply_id: &str,
        reply_ts: i64,
        by_local_user: bool,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO threads (root_id, conversation_id, reply_count, latest_event_id, latest_ts, participated, redacted)
             VALUES (?1, ?2, 1, ?3, ?4, ?5, 0)
             ON CONFLICT(root_id) DO UPDATE SET
                reply_count = reply_count + 1,
                latest_event_id = CASE WHEN excluded.latest_ts >= latest_ts THEN excluded.latest_event_id ELSE latest_event_id END,
                latest_ts = MAX(latest_ts, excluded.latest_ts),
                participated = participated OR excluded.participated",
            params![root_id, conversation_id, reply_id, reply_ts, by_local_user],
        )?;
        Ok(())
    }

    /// 合并根事件上的远端摘要
    pub fn merge_summary(&self, root_id: &str, conversation_id: &str, summary: &ThreadSummary) -> Result<()> {
        self.conn.execute(
            "INSERT INTO threads (root_id, conversation_id, reply_count, latest_event_id, latest_ts, participated, redacted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)
             ON CONFLICT(root_id) DO UPDATE SET
                reply_count = MAX(reply_count, excluded.reply_count),
                latest_event_id = CASE WHEN excluded.latest_ts > latest_ts THEN excluded.latest_event_id ELSE latest_event_id END,
                latest_ts = MAX(latest_ts, excluded.latest_ts),
                participated = participated OR excluded.participated",
            params![
                root_id,
                conversation_id,
                summary.reply_count,
                summary.latest_event_id,
                summary.latest_ts,
                summary.participated
            ],
        )?;
        Ok(())
    }

    /// 回复被撤回：计数减一（不低于 0）
    pub fn retract_reply(&self, root_id: &str) -> Result<usize> {
        Ok(self.conn.execute(
            "UPDATE threads SET reply_count = MAX(reply_count - 1, 0) WHERE root_id = ?1",
            params![root_id],
        )?)
    }

    pub fn mark_redacted(&self, root_id: &str) -> Result<usize> {
        Ok(self.conn.execute(
            "UPDATE threads SET redacted = 1 WHERE root_id = ?1",
            params![root_id],
        )?)
    }

    pub fn delete_conversation(&self, conversation_id: &str) -> Result<usize> {
        Ok(self.conn.execute(
            "DELETE FROM threads WHERE conversation_id = ?1",
            params![conversation_id],
        )?)
    }
}
