//! timeline 表 DAO - 每个事件的规范镜像
//!
//! 所有事件（消息、编辑、反应、撤回、成员、回执）都会写入 timeline，
//! 其余专用表都只是它的派生镜像。

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use super::json_column;
use crate::error::{MirrorchatSDKError, Result};
use crate::storage::entities::{Event, EventQuery, SendStatus, ThreadFilter};

const EVENT_COLUMNS: &str = "event_id, conversation_id, thread_id, event_type, sender, state_key, \
     content, original_content, ts, redacted, send_status, transaction_id, malformed, undecryptable";

pub struct TimelineDao<'a> {
    conn: &'a Connection,
}

impl<'a> TimelineDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// 行 -> Event（列顺序与 EVENT_COLUMNS 一致）
    pub fn row_to_event(row: &Row) -> rusqlite::Result<Event> {
        let send_status: String = row.get(10)?;
        Ok(Event {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            thread_id: row.get(2)?,
            event_type: row.get(3)?,
            sender: row.get(4)?,
            state_key: row.get(5)?,
            content: json_column(row, 6)?,
            original_content: json_column(row, 7)?,
            timestamp: row.get(8)?,
            redacted: row.get(9)?,
            send_status: SendStatus::parse(&send_status),
            transaction_id: row.get(11)?,
            malformed: row.get(12)?,
            undecryptable: row.get(13)?,
            thread_summary: None,
        })
    }

    pub fn get(&self, event_id: &str) -> Result<Option<Event>> {
        let sql = format!("SELECT {} FROM timeline WHERE event_id = ?1", EVENT_COLUMNS);
        let event = self
            .conn
            .query_row(&sql, params![event_id], Self::row_to_event)
            .optional()?;
        Ok(event)
    }

    /// 按事件 ID 或事务 ID 查找（撤回时用于解析本地未确认事件）
    pub fn find_by_id_or_txn(&self, id: &str) -> Result<Vec<Event>> {
        let sql = format!(
            "SELECT {} FROM timeline WHERE event_id = ?1 OR transaction_id = ?1",
            EVENT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![id], Self::row_to_event)?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    pub fn upsert(&self, event: &Event) -> Result<()> {
        let sql = format!(
            "INSERT OR REPLACE INTO timeline ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            EVENT_COLUMNS
        );
        self.conn.execute(
            &sql,
            params![
                event.id,
                event.conversation_id,
                event.thread_id,
                event.event_type,
                event.sender,
                event.state_key,
                serde_json::to_string(&event.content)?,
                serde_json::to_string(&event.original_content)?,
                event.timestamp,
                event.redacted,
                event.send_status.as_str(),
                event.transaction_id,
                event.malformed,
                event.undecryptable,
            ],
        )?;
        Ok(())
    }

    pub fn update_content(&self, event_id: &str, content: &serde_json::Value) -> Result<usize> {
        let changed = self.conn.execute(
            "UPDATE timeline SET content = ?2 WHERE event_id = ?1 AND redacted = 0",
            params![event_id, serde_json::to_string(content)?],
        )?;
        Ok(changed)
    }

    pub fn mark_redacted(&self, event_id: &str) -> Result<usize> {
        let changed = self.conn.execute(
            "UPDATE timeline SET redacted = 1, content = '{}' WHERE event_id = ?1",
            params![event_id],
        )?;
        Ok(changed)
    }

    pub fn set_send_status(&self, event_id: &str, status: SendStatus) -> Result<usize> {
        let changed = self.conn.execute(
            "UPDATE timeline SET send_status = ?2 WHERE event_id = ?1",
            params![event_id, status.as_str()],
        )?;
        Ok(changed)
    }

    pub fn delete(&self, event_id: &str) -> Result<usize> {
        Ok(self
            .conn
            .execute("DELETE FROM timeline WHERE event_id = ?1", params![event_id])?)
    }

    pub fn delete_conversation(&self, conversation_id: &str) -> Result<usize> {
        Ok(self.conn.execute(
            "DELETE FROM timeline WHERE conversation_id = ?1",
            params![conversation_id],
        )?)
    }

    /// 按条件分页查询，时间戳倒序
    pub fn query(&self, query: &EventQuery, page: u32, limit: u32) -> Result<Vec<Event>> {
        if limit == 0 {
            return Err(MirrorchatSDKError::InvalidArgument(
                "分页大小必须大于 0".to_string(),
            ));
        }
        let (where_sql, mut values) = build_filter(query);
        let sql = format!(
            "SELECT {} FROM timeline t {} ORDER BY t.ts DESC, t.event_id DESC LIMIT ? OFFSET ?",
            qualified_columns(),
            where_sql
        );
        values.push(SqlValue::Integer(limit as i64));
        values.push(SqlValue::Integer(page as i64 * limit as i64));

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), Self::row_to_event)?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    pub fn count(&self, query: &EventQuery) -> Result<u64> {
        let (where_sql, values) = build_filter(query);
        let sql = format!("SELECT COUNT(*) FROM timeline t {}", where_sql);
        let count: i64 = self
            .conn
            .query_row(&sql, params_from_iter(values), |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }
}

fn qualified_columns() -> String {
    EVENT_COLUMNS
        .split(", ")
        .map(|c| format!("t.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// LIKE 通配符转义
fn escape_like(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

fn build_filter(query: &EventQuery) -> (String, Vec<SqlValue>) {
    let mut clauses: Vec<String> = Vec::new();
    let mut values: Vec<SqlValue> = Vec::new();
    let mut join = String::new();

    if let Some(conversation_id) = &query.conversation_id {
        clauses.push("t.conversation_id = ?".to_string());
        values.push(SqlValue::Text(conversation_id.clone()));
    }
    match &query.thread {
        ThreadFilter::Any => {}
        ThreadFilter::Main => clauses.push("t.thread_id IS NULL".to_string()),
        ThreadFilter::Thread(thread_id) => {
            clauses.push("t.thread_id = ?".to_string());
            values.push(SqlValue::Text(thread_id.clone()));
        }
    }
    if let Some(sender) = &query.sender {
        clauses.push("t.sender = ?".to_string());
        values.push(SqlValue::Text(sender.clone()));
    }
    if let Some(event_type) = &query.event_type {
        clauses.push("t.event_type = ?".to_string());
        values.push(SqlValue::Text(event_type.clone()));
    }
    if let Some(text) = query.search_text.as_deref().filter(|t| !t.is_empty()) {
        join = "INNER JOIN messages_search s ON s.event_id = t.event_id ".to_string();
        clauses.push("s.search_text LIKE ? ESCAPE '\\'".to_string());
        values.push(SqlValue::Text(format!("%{}%", escape_like(&text.to_lowercase()))));
    }
    if !query.include_redacted {
        clauses.push("t.redacted = 0".to_string());
    }

    let where_sql = if clauses.is_empty() {
        join
    } else {
        format!("{}WHERE {}", join, clauses.join(" AND "))
    };
    (where_sql, values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_pattern_is_escaped() {
        assert_eq!(escape_like("50%_off\\"), "50\\%\\_off\\\\");
    }

    #[test]
    fn filter_combines_clauses() {
        let query = EventQuery {
            conversation_id: Some("!r".into()),
            thread: ThreadFilter::Main,
            sender: Some("@a".into()),
            ..Default::default()
        };
        let (sql, values) = build_filter(&query);
        assert_eq!(
            sql,
            "WHERE t.conversation_id = ? AND t.thread_id IS NULL AND t.sender = ? AND t.redacted = 0"
        );
        assert_eq!(values.len(), 2);
    }
}
