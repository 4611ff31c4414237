//! reactions 表 DAO

use rusqlite::{params, Connection, Row};

use crate::error::Result;
use crate::storage::entities::ReactionRow;

pub struct ReactionDao<'a> {
    conn: &'a Connection,
}

impl<'a> ReactionDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn row_to_reaction(row: &Row) -> rusqlite::Result<ReactionRow> {
        Ok(ReactionRow {
            event_id: row.get(0)?,
            target_id: row.get(1)?,
            conversation_id: row.get(2)?,
            sender: row.get(3)?,
            reaction_key: row.get(4)?,
            shortcode: row.get(5)?,
            timestamp: row.get(6)?,
            redacted: row.get(7)?,
        })
    }

    pub fn upsert(&self, reaction: &ReactionRow) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO reactions (event_id, target_id, conversation_id, sender, reaction_key, shortcode, ts, redacted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                reaction.event_id,
                reaction.target_id,
                reaction.conversation_id,
                reaction.sender,
                reaction.reaction_key,
                reaction.shortcode,
                reaction.timestamp,
                reaction.redacted,
            ],
        )?;
        Ok(())
    }

    /// 目标事件上仍有效的反应
    pub fn list_for_target(&self, target_id: &str) -> Result<Vec<ReactionRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT event_id, target_id, conversation_id, sender, reaction_key, shortcode, ts, redacted
             FROM reactions WHERE target_id = ?1 AND redacted = 0 ORDER BY ts ASC",
        )?;
        let rows = stmt.query_map(params![target_id], Self::row_to_reaction)?;
        let mut reactions = Vec::new();
        for row in rows {
            reactions.push(row?);
        }
        Ok(reactions)
    }

    pub fn mark_redacted(&self, event_id: &str) -> Result<usize> {
        Ok(self.conn.execute(
            "UPDATE reactions SET redacted = 1 WHERE event_id = ?1",
            params![event_id],
        )?)
    }

    pub fn retarget(&self, old_target: &str, new_target: &str) -> Result<usize> {
        Ok(self.conn.execute(
            "UPDATE reactions SET target_id = ?2 WHERE target_id = ?1",
            params![old_target, new_target],
        )?)
    }

    pub fn delete(&self, event_id: &str) -> Result<usize> {
        Ok(self
            .conn
            .execute("DELETE FROM reactions WHERE event_id = ?1", params![event_id])?)
    }

    pub fn delete_conversation(&self, conversation_id: &str) -> Result<usize> {
        Ok(self.conn.execute(
            "DELETE FROM reactions WHERE conversation_id = ?1",
            params![conversation_id],
        )?)
    }
}
