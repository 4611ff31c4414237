//! 编辑相关 DAO - messages_edit（所有编辑）与 messages_primary_edit（当前生效的编辑）
//!
//! 生效规则：时间戳大者胜，时间戳相同则后到者胜（按 rowid 的写入顺序）。

use rusqlite::{params, Connection, OptionalExtension};

use super::json_column;
use crate::error::Result;
use crate::storage::entities::Event;

/// messages_edit 行
#[derive(Debug, Clone, PartialEq)]
pub struct EditRow {
    pub event_id: String,
    pub target_id: String,
    pub content: serde_json::Value,
    pub timestamp: i64,
}

/// messages_primary_edit 行
#[derive(Debug, Clone, PartialEq)]
pub struct PrimaryEdit {
    pub target_id: String,
    pub edit_event_id: String,
    pub content: serde_json::Value,
    pub timestamp: i64,
    pub redacted: bool,
}

pub struct MessageEditDao<'a> {
    conn: &'a Connection,
}

impl<'a> MessageEditDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn insert(&self, edit: &Event, target_id: &str, new_content: &serde_json::Value) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO messages_edit (event_id, target_id, conversation_id, sender, content, ts, redacted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                edit.id,
                target_id,
                edit.conversation_id,
                edit.sender,
                serde_json::to_string(new_content)?,
                edit.timestamp,
                edit.redacted,
            ],
        )?;
        Ok(())
    }

    /// 标记编辑已撤回，返回它的目标事件 ID
    pub fn mark_redacted(&self, edit_event_id: &str) -> Result<Option<String>> {
        let target: Option<String> = self
            .conn
            .query_row(
                "SELECT target_id FROM messages_edit WHERE event_id = ?1",
                params![edit_event_id],
                |row| row.get(0),
            )
            .optional()?;
        if target.is_some() {
            self.conn.execute(
                "UPDATE messages_edit SET redacted = 1, content = '{}' WHERE event_id = ?1",
                params![edit_event_id],
            )?;
        }
        Ok(target)
    }

    /// 目标事件当前应生效的编辑（未撤回中时间戳最大、同戳最后写入者）
    pub fn latest_for(&self, target_id: &str) -> Result<Option<EditRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT event_id, target_id, content, ts FROM messages_edit
                 WHERE target_id = ?1 AND redacted = 0
                 ORDER BY ts DESC, rowid DESC LIMIT 1",
                params![target_id],
                |row| {
                    Ok(EditRow {
                        event_id: row.get(0)?,
                        target_id: row.get(1)?,
                        content: json_column(row, 2)?,
                        timestamp: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn primary(&self, target_id: &str) -> Result<Option<PrimaryEdit>> {
        let row = self
            .conn
            .query_row(
                "SELECT target_id, edit_event_id, content, ts, redacted
                 FROM messages_primary_edit WHERE target_id = ?1",
                params![target_id],
                |row| {
                    Ok(PrimaryEdit {
                        target_id: row.get(0)?,
                        edit_event_id: row.get(1)?,
                        content: json_column(row, 2)?,
                        timestamp: row.get(3)?,
                        redacted: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn set_primary(&self, edit: &EditRow) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO messages_primary_edit (target_id, edit_event_id, content, ts, redacted)
             VALUES (?1, ?2, ?3, ?4, 0)",
            params![
                edit.target_id,
                edit.event_id,
                serde_json::to_string(&edit.content)?,
                edit.timestamp
            ],
        )?;
        Ok(())
    }

    pub fn clear_primary(&self, target_id: &str) -> Result<usize> {
        Ok(self.conn.execute(
            "DELETE FROM messages_primary_edit WHERE target_id = ?1",
            params![target_id],
        )?)
    }

    /// 目标被撤回：主编辑行随之标记
    pub fn mark_primary_redacted(&self, target_id: &str) -> Result<usize> {
        Ok(self.conn.execute(
            "UPDATE messages_primary_edit SET redacted = 1, content = '{}' WHERE target_id = ?1",
            params![target_id],
        )?)
    }

    /// 本地回显确认后，把指向事务 ID 的编辑改指向正式 ID
    pub fn retarget(&self, old_target: &str, new_target: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE messages_edit SET target_id = ?2 WHERE target_id = ?1",
            params![old_target, new_target],
        )?;
        self.conn.execute(
            "UPDATE OR REPLACE messages_primary_edit SET target_id = ?2 WHERE target_id = ?1",
            params![old_target, new_target],
        )?;
        Ok(())
    }

    pub fn delete_conversation(&self, conversation_id: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM messages_primary_edit WHERE target_id IN
                (SELECT target_id FROM messages_edit WHERE conversation_id = ?1)",
            params![conversation_id],
        )?;
        self.conn.execute(
            "DELETE FROM messages_edit WHERE conversation_id = ?1",
            params![conversation_id],
        )?;
        Ok(())
    }
}
