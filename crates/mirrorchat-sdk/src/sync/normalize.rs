//! 原始事件规范化 - 远端 JSON -> Event
//!
//! 字段缺失的事件仍然产出（malformed=true），不会中断同步；
//! 缺少 event_id 时用原始 JSON 的 sha256 前缀生成确定性 ID，重放时保持幂等。

use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::MirrorchatSDKError;
use crate::storage::entities::{rel_types, Event, ThreadSummary};

pub const MALFORMED_ID_PREFIX: &str = "malformed:";

fn deterministic_id(raw: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.to_string().as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{}{}", MALFORMED_ID_PREFIX, &digest[..16])
}

fn str_field(raw: &Value, key: &str) -> Option<String> {
    raw.get(key).and_then(|v| v.as_str()).map(String::from)
}

fn thread_summary(raw: &Value) -> Option<ThreadSummary> {
    let thread = raw.pointer("/unsigned/m.relations/m.thread")?;
    let latest = thread.get("latest_event");
    Some(ThreadSummary {
        reply_count: thread.get("count").and_then(|v| v.as_i64()).unwrap_or(0),
        latest_event_id: latest.and_then(|l| str_field(l, "event_id")),
        latest_ts: latest
            .and_then(|l| l.get("origin_server_ts"))
            .and_then(|v| v.as_i64())
            .unwrap_or(0),
        participated: thread
            .get("current_user_participated")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
    })
}

/// 规范化一条远端事件；第二个返回值为结构问题（不影响落库）
pub fn normalize_raw_event(
    conversation_id: &str,
    thread_id: Option<&str>,
    raw: &Value,
) -> (Event, Option<MirrorchatSDKError>) {
    let mut problems: Vec<&str> = Vec::new();

    let id = match str_field(raw, "event_id") {
        Some(id) if !id.is_empty() => id,
        _ => {
            problems.push("missing event_id");
            deterministic_id(raw)
        }
    };
    let event_type = str_field(raw, "type").unwrap_or_else(|| {
        problems.push("missing type");
        String::new()
    });
    let sender = str_field(raw, "sender").unwrap_or_else(|| {
        problems.push("missing sender");
        String::new()
    });
    let timestamp = raw
        .get("origin_server_ts")
        .and_then(|v| v.as_i64())
        .unwrap_or_else(|| {
            problems.push("missing origin_server_ts");
            0
        });
    let mut content = match raw.get("content") {
        Some(Value::Object(map)) => Value::Object(map.clone()),
        _ => {
            problems.push("content is not an object");
            Value::Object(Default::default())
        }
    };
    // 老格式的 redaction 把 redacts 放在顶层
    if let Some(redacts) = raw.get("redacts") {
        if let Value::Object(map) = &mut content {
            map.entry("redacts").or_insert_with(|| redacts.clone());
        }
    }

    // 线程：事件自带 m.thread 关系优先，其次是所在 scope
    let relation_thread = content
        .pointer("/m.relates_to/rel_type")
        .and_then(|v| v.as_str())
        .filter(|rel| *rel == rel_types::THREAD)
        .and_then(|_| content.pointer("/m.relates_to/event_id"))
        .and_then(|v| v.as_str())
        .map(String::from);

    let mut event = Event::new(id, event_type, sender, conversation_id, content, timestamp);
    event.thread_id = relation_thread.or_else(|| thread_id.map(String::from));
    event.state_key = str_field(raw, "state_key");
    event.transaction_id = raw
        .pointer("/unsigned/transaction_id")
        .and_then(|v| v.as_str())
        .map(String::from);
    event.thread_summary = thread_summary(raw);
    // 线程根事件本身属于主时间线
    if event.thread_id.as_deref() == Some(event.id.as_str()) {
        event.thread_id = None;
    }

    if problems.is_empty() {
        return (event, None);
    }
    let reason = problems.join(", ");
    warn!("事件结构不完整: event_id={}, reason={}", event.id, reason);
    event.malformed = true;
    let error = MirrorchatSDKError::MalformedEvent {
        event_id: event.id.clone(),
        reason,
    };
    (event, Some(error))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn maps_wire_fields() {
        let raw = json!({
            "event_id": "$1",
            "type": "m.room.message",
            "sender": "@bob:hs",
            "origin_server_ts": 42,
            "content": {
                "body": "in thread",
                "m.relates_to": {"rel_type": "m.thread", "event_id": "$root"}
            },
            "unsigned": {"transaction_id": "~tx"}
        });
        let (event, problem) = normalize_raw_event("!room", None, &raw);
        assert!(problem.is_none());
        assert_eq!(event.id, "$1");
        assert_eq!(event.timestamp, 42);
        assert_eq!(event.thread_id.as_deref(), Some("$root"));
        assert_eq!(event.transaction_id.as_deref(), Some("~tx"));
        assert!(!event.malformed);
    }

    #[test]
    fn thread_root_carries_summary() {
        let raw = json!({
            "event_id": "$root",
            "type": "m.room.message",
            "sender": "@bob:hs",
            "origin_server_ts": 1,
            "content": {"body": "root"},
            "unsigned": {"m.relations": {"m.thread": {
                "count": 3,
                "latest_event": {"event_id": "$r3", "origin_server_ts": 9},
                "current_user_participated": true
            }}}
        });
        let (event, _) = normalize_raw_event("!room", Some("$root"), &raw);
        assert!(event.thread_id.is_none());
        let summary = event.thread_summary.unwrap();
        assert_eq!(summary.reply_count, 3);
        assert_eq!(summary.latest_event_id.as_deref(), Some("$r3"));
        assert!(summary.participated);
    }

    #[test]
    fn malformed_events_are_flagged_with_stable_ids() {
        let raw = json!({"type": "m.room.message", "content": "oops"});
        let (first, problem) = normalize_raw_event("!room", None, &raw);
        let (second, _) = normalize_raw_event("!room", None, &raw);
        assert!(first.malformed);
        assert!(first.id.starts_with(MALFORMED_ID_PREFIX));
        assert_eq!(first.id, second.id);
        assert!(matches!(problem, Some(MirrorchatSDKError::MalformedEvent { .. })));
    }

    #[test]
    fn top_level_redacts_moves_into_content() {
        let raw = json!({
            "event_id": "$x",
            "type": "m.room.redaction",
            "sender": "@bob:hs",
            "origin_server_ts": 5,
            "redacts": "$target",
            "content": {}
        });
        let (event, _) = normalize_raw_event("!room", None, &raw);
        assert_eq!(event.content["redacts"], "$target");
        assert_eq!(event.original_content["redacts"], "$target");
    }
}
