//! members 表 DAO（key = conversation_id:user_id）

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::storage::entities::{composite_key, MemberRow};

pub struct MemberDao<'a> {
    conn: &'a Connection,
}

impl<'a> MemberDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// 只接受不早于现有记录的成员事件
    pub fn upsert(&self, member: &MemberRow) -> Result<bool> {
        let changed = self.conn.execute(
            "INSERT INTO members (member_key, conversation_id, user_id, membership, display_name, event_id, ts, redacted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(member_key) DO UPDATE SET
                membership = excluded.membership,
                display_name = excluded.display_name,
                event_id = excluded.event_id,
                ts = excluded.ts,
                redacted = excluded.redacted
             WHERE excluded.ts >= members.ts",
            params![
                composite_key(&member.conversation_id, &member.user_id),
                member.conversation_id,
                member.user_id,
                member.membership,
                member.display_name,
                member.event_id,
                member.timestamp,
                member.redacted,
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn get(&self, conversation_id: &str, user_id: &str) -> Result<Option<MemberRow>> {
        Ok(self
            .conn
            .query_row(
                "SELECT conversation_id, user_id, membership, display_name, event_id, ts, redacted
                 FROM members WHERE member_key = ?1",
                params![composite_key(conversation_id, user_id)],
                |row| {
                    Ok(MemberRow {
                        conversation_id: row.get(0)?,
                        user_id: row.get(1)?,
                        membership: row.get(2)?,
                        display_name: row.get(3)?,
                        event_id: row.get(4)?,
                        timestamp: row.get(5)?,
                        redacted: row.get(6)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn mark_redacted(&self, event_id: &str) -> Result<usize> {
        Ok(self.conn.execute(
            "UPDATE members SET redacted = 1 WHERE event_id = ?1",
            params![event_id],
        )?)
    }

    pub fn delete_conversation(&self, conversation_id: &str) -> Result<usize> {
        Ok(self.conn.execute(
            "DELETE FROM members WHERE conversation_id = ?1",
            params![conversation_id],
        )?)
    }
}
