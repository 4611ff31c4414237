//! messages_search 表 DAO - 搜索用的反范式镜像
//!
//! search_text 统一小写，查询时在 timeline DAO 里做 LIKE 子串匹配。

use rusqlite::{params, Connection};

use crate::error::Result;
use crate::storage::entities::Event;

pub struct MessageSearchDao<'a> {
    conn: &'a Connection,
}

/// 从内容中提取可搜索文本
pub fn searchable_text(content: &serde_json::Value) -> String {
    let mut parts = Vec::new();
    for key in ["body", "formatted_body", "filename"] {
        if let Some(text) = content.get(key).and_then(|v| v.as_str()) {
            parts.push(text.to_lowercase());
        }
    }
    parts.join(" ")
}

impl<'a> MessageSearchDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn upsert(&self, event: &Event) -> Result<()> {
        let text = if event.redacted {
            String::new()
        } else {
            searchable_text(&event.content)
        };
        self.conn.execute(
            "INSERT OR REPLACE INTO messages_search (event_id, conversation_id, sender, search_text, ts, redacted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.id,
                event.conversation_id,
                event.sender,
                text,
                event.timestamp,
                event.redacted
            ],
        )?;
        Ok(())
    }

    pub fn update_text(&self, event_id: &str, content: &serde_json::Value) -> Result<usize> {
        Ok(self.conn.execute(
            "UPDATE messages_search SET search_text = ?2 WHERE event_id = ?1 AND redacted = 0",
            params![event_id, searchable_text(content)],
        )?)
    }

    pub fn mark_redacted(&self, event_id: &str) -> Result<usize> {
        Ok(self.conn.execute(
            "UPDATE messages_search SET redacted = 1, search_text = '' WHERE event_id = ?1",
            params![event_id],
        )?)
    }

    pub fn delete(&self, event_id: &str) -> Result<usize> {
        Ok(self.conn.execute(
            "DELETE FROM messages_search WHERE event_id = ?1",
            params![event_id],
        )?)
    }

    pub fn delete_conversation(&self, conversation_id: &str) -> Result<usize> {
        Ok(self.conn.execute(
            "DELETE FROM messages_search WHERE conversation_id = ?1",
            params![conversation_id],
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_lowercase_text() {
        let text = searchable_text(&json!({"body": "Hello World", "filename": "Cat.PNG"}));
        assert_eq!(text, "hello world cat.png");
    }
}
