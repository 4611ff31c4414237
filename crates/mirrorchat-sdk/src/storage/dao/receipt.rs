//! receipt 表 DAO（key = conversation_id:user_id，按时间戳单调前进）

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::storage::entities::{composite_key, ReceiptRow};

pub struct ReceiptDao<'a> {
    conn: &'a Connection,
}

impl<'a> ReceiptDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// 回执只会前进，较旧的回执返回 false
    pub fn upsert(&self, receipt: &ReceiptRow) -> Result<bool> {
        let changed = self.conn.execute(
            "INSERT INTO receipt (receipt_key, conversation_id, user_id, event_id, ts)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(receipt_key) DO UPDATE SET
                event_id = excluded.event_id,
                ts = excluded.ts
             WHERE excluded.ts >= receipt.ts",
            params![
                composite_key(&receipt.conversation_id, &receipt.user_id),
                receipt.conversation_id,
                receipt.user_id,
                receipt.event_id,
                receipt.timestamp,
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn get(&self, conversation_id: &str, user_id: &str) -> Result<Option<ReceiptRow>> {
        Ok(self
            .conn
            .query_row(
                "SELECT conversation_id, user_id, event_id, ts FROM receipt WHERE receipt_key = ?1",
                params![composite_key(conversation_id, user_id)],
                |row| {
                    Ok(ReceiptRow {
                        conversation_id: row.get(0)?,
                        user_id: row.get(1)?,
                        event_id: row.get(2)?,
                        timestamp: row.get(3)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn delete_conversation(&self, conversation_id: &str) -> Result<usize> {
        Ok(self.conn.execute(
            "DELETE FROM receipt WHERE conversation_id = ?1",
            params![conversation_id],
        )?)
    }
}
