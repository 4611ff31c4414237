//! pending_redactions 表 DAO - 先于目标事件到达的撤回墓碑

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;

/// 撤回墓碑
#[derive(Debug, Clone, PartialEq)]
pub struct Tombstone {
    pub target_id: String,
    pub redaction_event_id: Option<String>,
    pub conversation_id: Option<String>,
    pub timestamp: i64,
}

pub struct RedactionDao<'a> {
    conn: &'a Connection,
}

impl<'a> RedactionDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn latch(&self, tombstone: &Tombstone) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO pending_redactions (target_id, redaction_event_id, conversation_id, ts)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                tombstone.target_id,
                tombstone.redaction_event_id,
                tombstone.conversation_id,
                tombstone.timestamp
            ],
        )?;
        Ok(())
    }

    pub fn is_pending(&self, target_id: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM pending_redactions WHERE target_id = ?1",
            params![target_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// 取出并删除墓碑（事件 ID 或事务 ID 任一命中即可）
    pub fn take(&self, ids: &[&str]) -> Result<Option<Tombstone>> {
        for id in ids {
            let tombstone = self
                .conn
                .query_row(
                    "SELECT target_id, redaction_event_id, conversation_id, ts
                     FROM pending_redactions WHERE target_id = ?1",
                    params![id],
                    |row| {
                        Ok(Tombstone {
                            target_id: row.get(0)?,
                            redaction_event_id: row.get(1)?,
                            conversation_id: row.get(2)?,
                            timestamp: row.get(3)?,
                        })
                    },
                )
                .optional()?;
            if let Some(tombstone) = tombstone {
                self.conn.execute(
                    "DELETE FROM pending_redactions WHERE target_id = ?1",
                    params![id],
                )?;
                return Ok(Some(tombstone));
            }
        }
        Ok(None)
    }

    pub fn delete_conversation(&self, conversation_id: &str) -> Result<usize> {
        Ok(self.conn.execute(
            "DELETE FROM pending_redactions WHERE conversation_id = ?1",
            params![conversation_id],
        )?)
    }
}
