//! 未读推导：从事件流计算每个 scope 的 (total, highlight)

use parking_lot::Mutex;
use regex::Regex;
use std::collections::HashMap;

use crate::error::{MirrorchatSDKError, Result};
use crate::notification::rules::PushDecision;
use crate::storage::entities::{Event, EventKind, ScopeKey};

#[derive(Debug, Default)]
struct ScopeUnread {
    /// 本地用户已读位置
    receipt_ts: i64,
    /// 已计入的事件：event_id -> (ts, highlight)
    counted: HashMap<String, (i64, bool)>,
}

impl ScopeUnread {
    fn totals(&self) -> (u64, u64) {
        let total = self.counted.len() as u64;
        let highlight = self.counted.values().filter(|(_, h)| *h).count() as u64;
        (total, highlight)
    }
}

/// 未读追踪器
pub struct UnreadTracker {
    local_user: String,
    mention: Regex,
    scopes: Mutex<HashMap<ScopeKey, ScopeUnread>>,
}

impl UnreadTracker {
    pub fn new(local_user: &str) -> Result<Self> {
        let pattern = format!(r"(^|[^\w@]){}($|[^\w:.-])", regex::escape(local_user));
        let mention = Regex::new(&pattern)
            .map_err(|e| MirrorchatSDKError::Config(format!("提及匹配规则无效: {}", e)))?;
        Ok(Self {
            local_user: local_user.to_string(),
            mention,
            scopes: Mutex::new(HashMap::new()),
        })
    }

    pub fn local_user(&self) -> &str {
        &self.local_user
    }

    /// 正文是否提及本地用户
    pub fn mentions_local_user(&self, event: &Event) -> bool {
        event.body().map(|body| self.mention.is_match(body)).unwrap_or(false)
    }

    pub fn is_highlight(&self, event: &Event, push: &PushDecision) -> bool {
        push.highlight || self.mentions_local_user(event)
    }

    fn is_countable(&self, event: &Event) -> bool {
        event.sender != self.local_user
            && !event.redacted
            && !event.is_local_echo()
            && event.kind().is_message_like()
    }

    /// 新事件落库。计数变化时返回 (scope, total, highlight)
    pub fn on_event_added(&self, event: &Event, push: &PushDecision) -> Option<(ScopeKey, u64, u64)> {
        if let EventKind::Receipt { event_id } = event.kind() {
            if event.sender == self.local_user {
                return self.on_local_receipt(&event.scope(), &event_id, event.timestamp);
            }
            return None;
        }
        if !self.is_countable(event) {
            return None;
        }

        let scope = event.scope();
        let highlight = self.is_highlight(event, push);
        let mut scopes = self.scopes.lock();
        let state = scopes.entry(scope.clone()).or_default();
        if event.timestamp <= state.receipt_ts {
            return None;
        }
        if state.counted.insert(event.id.clone(), (event.timestamp, highlight)) == Some((event.timestamp, highlight)) {
            return None;
        }
        let (total, highlight) = state.totals();
        Some((scope, total, highlight))
    }

    /// 本地已读回执：移除回执位置及之前的事件
    pub fn on_local_receipt(&self, scope: &ScopeKey, event_id: &str, receipt_ts: i64) -> Option<(ScopeKey, u64, u64)> {
        let mut scopes = self.scopes.lock();
        let state = scopes.entry(scope.clone()).or_default();
        let read_up_to = state
            .counted
            .get(event_id)
            .map(|(ts, _)| *ts)
            .unwrap_or(receipt_ts)
            .max(receipt_ts);
        if read_up_to <= state.receipt_ts {
            return None;
        }
        state.receipt_ts = read_up_to;
        state.counted.retain(|_, (ts, _)| *ts > read_up_to);
        let (total, highlight) = state.totals();
        Some((scope.clone(), total, highlight))
    }

    /// 被计入的事件被撤回
    pub fn on_redacted(&self, event: &Event) -> Option<(ScopeKey, u64, u64)> {
        let scope = event.scope();
        let mut scopes = self.scopes.lock();
        let state = scopes.get_mut(&scope)?;
        state.counted.remove(&event.id)?;
        let (total, highlight) = state.totals();
        Some((scope, total, highlight))
    }

    pub fn totals(&self, scope: &ScopeKey) -> (u64, u64) {
        self.scopes
            .lock()
            .get(scope)
            .map(|s| s.totals())
            .unwrap_or((0, 0))
    }

    pub fn forget_conversation(&self, conversation_id: &str) {
        self.scopes
            .lock()
            .retain(|scope, _| scope.conversation_id != conversation_id);
    }
}
