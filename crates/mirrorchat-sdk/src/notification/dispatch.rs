//! 通知分发决策
//!
//! 每个事件一个分发状态机：Unconfirmed → Confirmed → [Edited]* → [Redacted]（终态）。
//! 同一事件最多通知一次；被撤回的事件不会再触发通知。

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::events::EventAdded;
use crate::notification::rules::PushDecision;
use crate::storage::entities::{event_types, Event, EventKind, ScopeKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    /// 本地乐观写入，尚未被服务端确认
    Unconfirmed,
    Confirmed,
    Edited,
    Redacted,
}

/// 计算 should_notify 的上下文
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotifyContext {
    /// 事件所在会话/线程当前处于前台可见
    pub focused_visible: bool,
    pub do_not_disturb: bool,
    pub stickers_enabled: bool,
    /// 远端推送评估结果
    pub push_notify: bool,
}

/// 交给平台层的通知请求
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationRequest {
    pub event_id: String,
    pub scope: ScopeKey,
    pub sender: String,
    pub body: Option<String>,
    pub highlight: bool,
    pub play_sound: bool,
}

/// 平台通知能力（外部提供）
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, request: NotificationRequest) -> Result<()>;

    async fn play_sound(&self, scope: &ScopeKey) -> Result<()>;
}

/// 默认最多跟踪的事件数
const DEFAULT_MAX_TRACKED: usize = 10_000;

#[derive(Debug, Clone, Copy)]
struct Tracked {
    state: DispatchState,
    notified: bool,
    /// 首次出现的顺序，裁剪时先丢最旧的
    seq: u64,
}

/// 通知分发器
pub struct NotificationDispatcher {
    local_user: String,
    sink: Option<Arc<dyn NotificationSink>>,
    tracked: Mutex<HashMap<String, Tracked>>,
    next_seq: AtomicU64,
    max_tracked: usize,
    /// 超过上限后裁剪到此数量
    trim_to: usize,
    focus: RwLock<Option<ScopeKey>>,
    do_not_disturb: AtomicBool,
    stickers_enabled: AtomicBool,
}

impl NotificationDispatcher {
    pub fn new(
        local_user: &str,
        sink: Option<Arc<dyn NotificationSink>>,
        do_not_disturb: bool,
        stickers_enabled: bool,
    ) -> Self {
        Self::with_capacity(local_user, sink, do_not_disturb, stickers_enabled, DEFAULT_MAX_TRACKED)
    }

    pub fn with_capacity(
        local_user: &str,
        sink: Option<Arc<dyn NotificationSink>>,
        do_not_disturb: bool,
        stickers_enabled: bool,
        max_tracked: usize,
    ) -> Self {
        let max_tracked = max_tracked.max(1);
        Self {
            local_user: local_user.to_string(),
            sink,
            tracked: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            max_tracked,
            trim_to: (max_tracked * 4 / 5).max(1), // 80%
            focus: RwLock::new(None),
            do_not_disturb: AtomicBool::new(do_not_disturb),
            stickers_enabled: AtomicBool::new(stickers_enabled),
        }
    }

    /// 设置当前前台可见的 scope（None 表示没有）
    pub fn set_focus(&self, scope: Option<ScopeKey>) {
        *self.focus.write() = scope;
    }

    pub fn set_do_not_disturb(&self, enabled: bool) {
        self.do_not_disturb.store(enabled, Ordering::SeqCst);
    }

    pub fn set_stickers_enabled(&self, enabled: bool) {
        self.stickers_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn state(&self, event_id: &str) -> Option<DispatchState> {
        self.tracked.lock().get(event_id).map(|t| t.state)
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.lock().len()
    }

    fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// 超过上限时丢弃最早出现的记录。被丢弃的事件若再次出现，
    /// 存储层的 redacted 标志和提交去重仍会挡住重复通知
    fn trim(&self, tracked: &mut HashMap<String, Tracked>) {
        if tracked.len() <= self.max_tracked {
            return;
        }
        let mut by_age: Vec<(String, u64)> = tracked.iter().map(|(id, t)| (id.clone(), t.seq)).collect();
        by_age.sort_by_key(|(_, seq)| *seq);
        let excess = tracked.len() - self.trim_to;
        for (id, _) in by_age.into_iter().take(excess) {
            tracked.remove(&id);
        }
        debug!("🧹 裁剪分发状态: 剩余 {} 条", tracked.len());
    }

    pub fn context_for(&self, event: &Event, push: &PushDecision) -> NotifyContext {
        NotifyContext {
            focused_visible: self.focus.read().as_ref() == Some(&event.scope()),
            do_not_disturb: self.do_not_disturb.load(Ordering::SeqCst),
            stickers_enabled: self.stickers_enabled.load(Ordering::SeqCst),
            push_notify: push.notify,
        }
    }

    /// 推进分发状态机（不做通知决策）
    pub fn observe_added(&self, added: &EventAdded) {
        let event = &added.event;
        let mut tracked = self.tracked.lock();

        let inherited = added
            .replaced_local_echo
            .as_ref()
            .and_then(|txn| tracked.remove(txn));

        if let EventKind::Edit { target, .. } = event.kind() {
            if let Some(entry) = tracked.get_mut(&target) {
                if entry.state != DispatchState::Redacted {
                    entry.state = DispatchState::Edited;
                }
            }
        }

        let state = if event.redacted {
            DispatchState::Redacted
        } else if event.is_local_echo() {
            DispatchState::Unconfirmed
        } else {
            DispatchState::Confirmed
        };
        let seq = self.next_seq();
        let entry = tracked.entry(event.id.clone()).or_insert(Tracked {
            state,
            notified: inherited.map(|t| t.notified).unwrap_or(false),
            seq,
        });
        match (entry.state, state) {
            (DispatchState::Redacted, _) => {}
            (_, DispatchState::Redacted) => entry.state = DispatchState::Redacted,
            (DispatchState::Unconfirmed, DispatchState::Confirmed) => entry.state = DispatchState::Confirmed,
            _ => {}
        }
        if let Some(prev) = inherited {
            if prev.state == DispatchState::Redacted {
                entry.state = DispatchState::Redacted;
            }
        }
        self.trim(&mut tracked);
    }

    pub fn observe_redacted(&self, event_id: &str) {
        let seq = self.next_seq();
        let mut tracked = self.tracked.lock();
        let entry = tracked.entry(event_id.to_string()).or_insert(Tracked {
            state: DispatchState::Redacted,
            notified: false,
            seq,
        });
        entry.state = DispatchState::Redacted;
        self.trim(&mut tracked);
    }

    /// 是否应该为该事件发出通知
    pub fn should_notify(&self, event: &Event, ctx: &NotifyContext) -> bool {
        if event.sender == self.local_user || event.is_local_echo() || event.redacted {
            return false;
        }
        if !event.kind().is_message_like() {
            return false;
        }
        if let Some(entry) = self.tracked.lock().get(&event.id) {
            if entry.notified || entry.state == DispatchState::Redacted {
                return false;
            }
        }
        if ctx.focused_visible || ctx.do_not_disturb || !ctx.push_notify {
            return false;
        }
        if event.event_type == event_types::STICKER && !ctx.stickers_enabled {
            return false;
        }
        true
    }

    /// 对新落库的事件做出决策；需要通知时交给 sink，返回发出的请求
    pub async fn handle_added(&self, added: &EventAdded, push: &PushDecision, highlight: bool) -> Option<NotificationRequest> {
        self.observe_added(added);
        let event = &added.event;
        let ctx = self.context_for(event, push);
        if !self.should_notify(event, &ctx) {
            return None;
        }
        if let Some(entry) = self.tracked.lock().get_mut(&event.id) {
            entry.notified = true;
        }

        let request = NotificationRequest {
            event_id: event.id.clone(),
            scope: event.scope(),
            sender: event.sender.clone(),
            body: event.body().map(String::from),
            highlight,
            play_sound: push.sound,
        };
        debug!("发出通知: event_id={}, highlight={}", event.id, highlight);
        if let Some(sink) = &self.sink {
            let sound = async {
                if request.play_sound {
                    sink.play_sound(&request.scope).await
                } else {
                    Ok(())
                }
            };
            let (notified, played) = futures::future::join(sink.notify(request.clone()), sound).await;
            if let Err(e) = notified {
                warn!("平台通知失败: event_id={}, error={}", event.id, e);
            }
            if let Err(e) = played {
                warn!("提示音播放失败: event_id={}, error={}", event.id, e);
            }
        }
        Some(request)
    }

    pub fn forget_conversation(&self, conversation_id: &str) {
        if self.focus.read().as_ref().map(|s| s.conversation_id.as_str()) == Some(conversation_id) {
            *self.focus.write() = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CommitOrigin;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingSink {
        notified: AtomicUsize,
        sounds: AtomicUsize,
    }

    #[async_trait]
    impl NotificationSink for CountingSink {
        async fn notify(&self, _request: NotificationRequest) -> Result<()> {
            self.notified.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn play_sound(&self, _scope: &ScopeKey) -> Result<()> {
            self.sounds.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn added(event: Event) -> EventAdded {
        EventAdded {
            scope: event.scope(),
            event,
            origin: CommitOrigin::Live,
            is_thread_root: false,
            replaced_local_echo: None,
        }
    }

    fn message(id: &str, sender: &str) -> Event {
        Event::new(id, event_types::MESSAGE, sender, "!room", json!({"body": "hi"}), 1)
    }

    fn ctx() -> NotifyContext {
        NotifyContext {
            focused_visible: false,
            do_not_disturb: false,
            stickers_enabled: true,
            push_notify: true,
        }
    }

    #[tokio::test]
    async fn notifies_once_per_event() {
        let sink = Arc::new(CountingSink::default());
        let dispatcher = NotificationDispatcher::new("@me:hs", Some(sink.clone()), false, true);
        let push = PushDecision::default();

        assert!(dispatcher.handle_added(&added(message("$a", "@bob:hs")), &push, false).await.is_some());
        assert!(dispatcher.handle_added(&added(message("$a", "@bob:hs")), &push, false).await.is_none());
        assert!(dispatcher.handle_added(&added(message("$b", "@me:hs")), &push, false).await.is_none());
        assert_eq!(sink.notified.load(Ordering::SeqCst), 1);
        assert_eq!(sink.sounds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn suppression_rules() {
        let dispatcher = NotificationDispatcher::new("@me:hs", None, false, true);
        let event = message("$a", "@bob:hs");
        assert!(dispatcher.should_notify(&event, &ctx()));
        assert!(!dispatcher.should_notify(&event, &NotifyContext { focused_visible: true, ..ctx() }));
        assert!(!dispatcher.should_notify(&event, &NotifyContext { do_not_disturb: true, ..ctx() }));
        assert!(!dispatcher.should_notify(&event, &NotifyContext { push_notify: false, ..ctx() }));

        let sticker = Event::new("$s", event_types::STICKER, "@bob:hs", "!room", json!({"body": "cat"}), 1);
        assert!(!dispatcher.should_notify(&sticker, &NotifyContext { stickers_enabled: false, ..ctx() }));
        assert!(!dispatcher.should_notify(&message("~txn", "@bob:hs"), &ctx()));
    }

    #[test]
    fn focus_applies_to_matching_scope_only() {
        let dispatcher = NotificationDispatcher::new("@me:hs", None, false, true);
        dispatcher.set_focus(Some(ScopeKey::conversation("!room")));
        let event = message("$a", "@bob:hs");
        assert!(dispatcher.context_for(&event, &PushDecision::default()).focused_visible);
        let in_thread = message("$b", "@bob:hs").with_thread("$root");
        assert!(!dispatcher.context_for(&in_thread, &PushDecision::default()).focused_visible);
    }

    #[test]
    fn tracked_states_are_capped() {
        let dispatcher = NotificationDispatcher::with_capacity("@me:hs", None, false, true, 100);
        for i in 0..1_000 {
            dispatcher.observe_added(&added(message(&format!("$m{}", i), "@bob:hs")));
            assert!(dispatcher.tracked_count() <= 100);
        }
        // 最新的事件仍被跟踪，最旧的已被裁剪
        assert_eq!(dispatcher.state("$m999"), Some(DispatchState::Confirmed));
        assert_eq!(dispatcher.state("$m0"), None);
    }

    #[test]
    fn state_machine_is_terminal_at_redacted() {
        let dispatcher = NotificationDispatcher::new("@me:hs", None, false, true);
        let echo = message("~t1", "@me:hs");
        dispatcher.observe_added(&added(echo));
        assert_eq!(dispatcher.state("~t1"), Some(DispatchState::Unconfirmed));

        let mut confirmed = added(message("$a", "@me:hs"));
        confirmed.replaced_local_echo = Some("~t1".into());
        dispatcher.observe_added(&confirmed);
        assert_eq!(dispatcher.state("$a"), Some(DispatchState::Confirmed));
        assert_eq!(dispatcher.state("~t1"), None);

        let edit = Event::new(
            "$e",
            event_types::MESSAGE,
            "@me:hs",
            "!room",
            json!({"m.new_content": {"body": "x"}, "m.relates_to": {"rel_type": "m.replace", "event_id": "$a"}}),
            2,
        );
        dispatcher.observe_added(&added(edit));
        assert_eq!(dispatcher.state("$a"), Some(DispatchState::Edited));

        dispatcher.observe_redacted("$a");
        dispatcher.observe_added(&added(message("$a", "@bob:hs")));
        assert_eq!(dispatcher.state("$a"), Some(DispatchState::Redacted));
        assert!(!dispatcher.should_notify(&message("$a", "@bob:hs"), &ctx()));
    }
}
