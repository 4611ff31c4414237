//! 消息数据访问层 - messages 表（消息类事件的镜像）

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::storage::entities::{Event, SendStatus};

/// 消息数据访问对象
pub struct MessageDao<'a> {
    conn: &'a Connection,
}

impl<'a> MessageDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn upsert(&self, event: &Event) -> Result<()> {
        let msgtype = event
            .content
            .get("msgtype")
            .and_then(|v| v.as_str())
            .map(String::from);
        self.conn.execute(
            "INSERT OR REPLACE INTO messages (
                event_id, conversation_id, thread_id, sender, msgtype, body, content,
                ts, redacted, send_status, transaction_id
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                event.id,
                event.conversation_id,
                event.thread_id,
                event.sender,
                msgtype,
                event.body(),
                serde_json::to_string(&event.content)?,
                event.timestamp,
                event.redacted,
                event.send_status.as_str(),
                event.transaction_id,
            ],
        )?;
        Ok(())
    }

    /// 编辑生效后替换内容
    pub fn update_content(&self, event_id: &str, content: &serde_json::Value) -> Result<usize> {
        let body = content.get("body").and_then(|v| v.as_str());
        let changed = self.conn.execute(
            "UPDATE messages SET content = ?2, body = ?3 WHERE event_id = ?1 AND redacted = 0",
            params![event_id, serde_json::to_string(content)?, body],
        )?;
        Ok(changed)
    }

    pub fn mark_redacted(&self, event_id: &str) -> Result<usize> {
        Ok(self.conn.execute(
            "UPDATE messages SET redacted = 1, content = '{}', body = NULL WHERE event_id = ?1",
            params![event_id],
        )?)
    }

    pub fn set_send_status(&self, event_id: &str, status: SendStatus) -> Result<usize> {
        Ok(self.conn.execute(
            "UPDATE messages SET send_status = ?2 WHERE event_id = ?1",
            params![event_id, status.as_str()],
        )?)
    }

    pub fn is_redacted(&self, event_id: &str) -> Result<Option<bool>> {
        Ok(self
            .conn
            .query_row(
                "SELECT redacted FROM messages WHERE event_id = ?1",
                params![event_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn delete(&self, event_id: &str) -> Result<usize> {
        Ok(self
            .conn
            .execute("DELETE FROM messages WHERE event_id = ?1", params![event_id])?)
    }

    pub fn delete_conversation(&self, conversation_id: &str) -> Result<usize> {
        Ok(self.conn.execute(
            "DELETE FROM messages WHERE conversation_id = ?1",
            params![conversation_id],
        )?)
    }
}
