//! 数据实体定义 - 对应数据库表结构
//!
//! 这里定义了所有数据库表对应的 Rust 结构体，用于：
//! - 类型安全的数据传输
//! - 统一的事件表示（Event 为规范单元，各专用表是它的镜像）
//! - 序列化/反序列化支持

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// 本地发出、尚未确认的事件使用的事务 ID 前缀
pub const LOCAL_TXN_PREFIX: &str = "~";

/// 事件类型常量
pub mod event_types {
    pub const MESSAGE: &str = "m.room.message";
    pub const STICKER: &str = "m.sticker";
    pub const ENCRYPTED: &str = "m.room.encrypted";
    pub const REACTION: &str = "m.reaction";
    pub const REDACTION: &str = "m.room.redaction";
    pub const MEMBER: &str = "m.room.member";
    pub const RECEIPT: &str = "m.receipt";
}

/// 关系类型常量（content["m.relates_to"]["rel_type"]）
pub mod rel_types {
    pub const REPLACE: &str = "m.replace";
    pub const ANNOTATION: &str = "m.annotation";
    pub const THREAD: &str = "m.thread";
}

/// 发送状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SendStatus {
    Sending,
    Sent,
    Cancelled,
}

impl SendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SendStatus::Sending => "sending",
            SendStatus::Sent => "sent",
            SendStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "sending" => SendStatus::Sending,
            "cancelled" => SendStatus::Cancelled,
            _ => SendStatus::Sent,
        }
    }
}

/// 会话或会话内子线程，同步/缓存/计数的独立单元
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScopeKey {
    pub conversation_id: String,
    pub thread_id: Option<String>,
}

impl ScopeKey {
    pub fn conversation(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            thread_id: None,
        }
    }

    pub fn thread(conversation_id: impl Into<String>, thread_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            thread_id: Some(thread_id.into()),
        }
    }

    pub fn is_thread(&self) -> bool {
        self.thread_id.is_some()
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.thread_id {
            Some(thread_id) => write!(f, "{}/{}", self.conversation_id, thread_id),
            None => write!(f, "{}", self.conversation_id),
        }
    }
}

/// 事件 - 规范单元
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// 全局唯一 ID；本地未确认事件为 `~` 前缀的事务 ID
    pub id: String,
    pub event_type: String,
    pub sender: String,
    pub conversation_id: String,
    pub thread_id: Option<String>,
    /// 当前内容（可能已被编辑替换）
    pub content: Value,
    pub original_content: Value,
    /// 毫秒时间戳
    pub timestamp: i64,
    /// 一旦为 true 即为终态
    pub redacted: bool,
    pub send_status: SendStatus,
    pub state_key: Option<String>,
    /// 本地回显的事务 ID（服务端确认事件也会带回）
    pub transaction_id: Option<String>,
    /// 结构不完整，UI 渲染为错误标记
    pub malformed: bool,
    /// 解密超时，UI 渲染为占位符
    pub undecryptable: bool,
    /// 远端附带的线程摘要（仅线程根事件有），不落 timeline 列
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_summary: Option<ThreadSummary>,
}

/// 线程根事件上的摘要信息（unsigned.m.relations.m.thread）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadSummary {
    pub reply_count: i64,
    pub latest_event_id: Option<String>,
    pub latest_ts: i64,
    pub participated: bool,
}

impl Event {
    pub fn new(
        id: impl Into<String>,
        event_type: impl Into<String>,
        sender: impl Into<String>,
        conversation_id: impl Into<String>,
        content: Value,
        timestamp: i64,
    ) -> Self {
        Self {
            id: id.into(),
            event_type: event_type.into(),
            sender: sender.into(),
            conversation_id: conversation_id.into(),
            thread_id: None,
            original_content: content.clone(),
            content,
            timestamp,
            redacted: false,
            send_status: SendStatus::Sent,
            state_key: None,
            transaction_id: None,
            malformed: false,
            undecryptable: false,
            thread_summary: None,
        }
    }

    pub fn with_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn with_state_key(mut self, state_key: impl Into<String>) -> Self {
        self.state_key = Some(state_key.into());
        self
    }

    pub fn with_transaction_id(mut self, transaction_id: impl Into<String>) -> Self {
        self.transaction_id = Some(transaction_id.into());
        self
    }

    pub fn with_send_status(mut self, send_status: SendStatus) -> Self {
        self.send_status = send_status;
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn scope(&self) -> ScopeKey {
        ScopeKey {
            conversation_id: self.conversation_id.clone(),
            thread_id: self.thread_id.clone(),
        }
    }

    /// 是否为本地未确认的事件
    pub fn is_local_echo(&self) -> bool {
        self.id.starts_with(LOCAL_TXN_PREFIX)
    }

    pub fn kind(&self) -> EventKind {
        EventKind::classify(self)
    }

    /// 消息正文（用于搜索、提及检测）
    pub fn body(&self) -> Option<&str> {
        self.content.get("body").and_then(|v| v.as_str())
    }

    /// 撤回（redaction）后清空内容，元信息保留
    pub fn strip_for_redaction(&mut self) {
        self.redacted = true;
        self.content = Value::Object(Default::default());
    }
}

/// 事件分类（决定镜像到哪些专用表）
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    Message,
    Sticker,
    Encrypted,
    Edit { target: String, new_content: Value },
    Reaction { target: String, key: String, shortcode: Option<String> },
    Redaction { targets: Vec<String> },
    Membership { user_id: String, membership: String },
    Receipt { event_id: String },
    Other,
}

impl EventKind {
    pub fn classify(event: &Event) -> Self {
        let relates_to = event.original_content.get("m.relates_to");
        let rel_type = relates_to
            .and_then(|r| r.get("rel_type"))
            .and_then(|v| v.as_str());
        let rel_target = relates_to
            .and_then(|r| r.get("event_id"))
            .and_then(|v| v.as_str())
            .map(String::from);

        match event.event_type.as_str() {
            event_types::MESSAGE => match (rel_type, rel_target) {
                (Some(rel_types::REPLACE), Some(target)) => EventKind::Edit {
                    target,
                    new_content: event
                        .original_content
                        .get("m.new_content")
                        .cloned()
                        .unwrap_or(Value::Null),
                },
                _ => EventKind::Message,
            },
            event_types::STICKER => EventKind::Sticker,
            event_types::ENCRYPTED => EventKind::Encrypted,
            event_types::REACTION => match (rel_type, rel_target) {
                (Some(rel_types::ANNOTATION), Some(target)) => {
                    let key = relates_to
                        .and_then(|r| r.get("key"))
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    let shortcode = event
                        .original_content
                        .get("shortcode")
                        .and_then(|v| v.as_str())
                        .map(String::from);
                    EventKind::Reaction {
                        target,
                        key,
                        shortcode,
                    }
                }
                _ => EventKind::Other,
            },
            event_types::REDACTION => {
                let targets = match event.original_content.get("redacts") {
                    Some(Value::String(id)) => vec![id.clone()],
                    Some(Value::Array(ids)) => ids
                        .iter()
                        .filter_map(|v| v.as_str().map(String::from))
                        .collect(),
                    _ => Vec::new(),
                };
                EventKind::Redaction { targets }
            }
            event_types::MEMBER => match &event.state_key {
                Some(user_id) => EventKind::Membership {
                    user_id: user_id.clone(),
                    membership: event
                        .original_content
                        .get("membership")
                        .and_then(|v| v.as_str())
                        .unwrap_or("leave")
                        .to_string(),
                },
                None => EventKind::Other,
            },
            event_types::RECEIPT => match event.original_content.get("event_id").and_then(|v| v.as_str()) {
                Some(id) => EventKind::Receipt { event_id: id.to_string() },
                None => EventKind::Other,
            },
            _ => EventKind::Other,
        }
    }

    /// 会进入时间线窗口并参与未读计数的类型
    pub fn is_windowable(&self) -> bool {
        matches!(
            self,
            EventKind::Message | EventKind::Sticker | EventKind::Encrypted | EventKind::Membership { .. } | EventKind::Other
        )
    }

    /// 镜像到 messages / messages_search 的类型
    pub fn is_message_like(&self) -> bool {
        matches!(self, EventKind::Message | EventKind::Sticker | EventKind::Encrypted)
    }
}

/// 线程过滤条件（替代字符串 "NULL" 哨兵值）
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ThreadFilter {
    /// 不限线程
    #[default]
    Any,
    /// 仅主时间线（thread_id IS NULL）
    Main,
    /// 指定线程
    Thread(String),
}

/// 事件查询条件
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub conversation_id: Option<String>,
    pub thread: ThreadFilter,
    pub sender: Option<String>,
    pub event_type: Option<String>,
    /// 在 messages_search 上做子串匹配
    pub search_text: Option<String>,
    pub include_redacted: bool,
}

impl EventQuery {
    pub fn conversation(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: Some(conversation_id.into()),
            ..Default::default()
        }
    }

    pub fn for_scope(scope: &ScopeKey) -> Self {
        Self {
            conversation_id: Some(scope.conversation_id.clone()),
            thread: match &scope.thread_id {
                Some(thread_id) => ThreadFilter::Thread(thread_id.clone()),
                None => ThreadFilter::Main,
            },
            ..Default::default()
        }
    }
}

/// 分页结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageResult<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
    pub page_count: u32,
}

impl<T> PageResult<T> {
    pub fn new(items: Vec<T>, total: u64, page: u32, page_size: u32) -> Self {
        let page_count = if page_size == 0 {
            0
        } else {
            total.div_ceil(page_size as u64) as u32
        };
        Self {
            items,
            total,
            page,
            page_size,
            page_count,
        }
    }
}

/// 线程标记 - 对应 threads 表
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadMarker {
    pub root_id: String,
    pub conversation_id: String,
    pub reply_count: i64,
    pub latest_event_id: Option<String>,
    pub latest_ts: i64,
    /// 本地用户是否参与过
    pub participated: bool,
    pub redacted: bool,
}

/// 表情反馈 - 对应 reactions 表
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionRow {
    pub event_id: String,
    pub target_id: String,
    pub conversation_id: String,
    pub sender: String,
    pub reaction_key: String,
    pub shortcode: Option<String>,
    pub timestamp: i64,
    pub redacted: bool,
}

/// 成员 - 对应 members 表（key = conversation_id:user_id）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberRow {
    pub conversation_id: String,
    pub user_id: String,
    pub membership: String,
    pub display_name: Option<String>,
    pub event_id: String,
    pub timestamp: i64,
    pub redacted: bool,
}

/// 已读回执 - 对应 receipt 表（key = conversation_id:user_id）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptRow {
    pub conversation_id: String,
    pub user_id: String,
    pub event_id: String,
    pub timestamp: i64,
}

/// 某个 ID 在各镜像表中的行状态（用于检查 redaction 扇出）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRowState {
    pub table: String,
    pub redacted: bool,
}

/// 复合主键 conversation_id:user_id
pub fn composite_key(conversation_id: &str, user_id: &str) -> String {
    format!("{}:{}", conversation_id, user_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_relations() {
        let edit = Event::new(
            "$e1",
            event_types::MESSAGE,
            "@a:hs",
            "!r:hs",
            json!({
                "body": "* fixed",
                "m.new_content": {"body": "fixed"},
                "m.relates_to": {"rel_type": "m.replace", "event_id": "$orig"}
            }),
            10,
        );
        assert_eq!(
            edit.kind(),
            EventKind::Edit {
                target: "$orig".into(),
                new_content: json!({"body": "fixed"})
            }
        );

        let reaction = Event::new(
            "$r1",
            event_types::REACTION,
            "@a:hs",
            "!r:hs",
            json!({"m.relates_to": {"rel_type": "m.annotation", "event_id": "$orig", "key": "👍"}}),
            11,
        );
        assert!(matches!(reaction.kind(), EventKind::Reaction { ref key, .. } if key == "👍"));

        let redaction = Event::new(
            "$x",
            event_types::REDACTION,
            "@a:hs",
            "!r:hs",
            json!({"redacts": ["$a", "$b"]}),
            12,
        );
        assert_eq!(
            redaction.kind(),
            EventKind::Redaction {
                targets: vec!["$a".into(), "$b".into()]
            }
        );
    }

    #[test]
    fn page_count_rounds_up() {
        let page: PageResult<u8> = PageResult::new(vec![], 41, 0, 20);
        assert_eq!(page.page_count, 3);
    }

    #[test]
    fn scope_display() {
        assert_eq!(ScopeKey::conversation("!r").to_string(), "!r");
        assert_eq!(ScopeKey::thread("!r", "$t").to_string(), "!r/$t");
    }
}
