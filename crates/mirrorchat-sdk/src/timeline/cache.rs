//! 时间线缓存 - 每个 scope 一个有界窗口，外加编辑覆盖层和反应聚合
//!
//! 输入是存储层发出的有序变更通知（`apply`），输出是可直接渲染的窗口快照。

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::events::{ChangeNotification, CommitOrigin, EventAdded, SyncStatus};
use crate::storage::entities::{Event, EventKind, ScopeKey};
use crate::timeline::edit_overlay::{EditApply, EditOverlay, Reelection};
use crate::timeline::reaction_aggregate::{ReactionAggregate, ReactionSummary};
use crate::timeline::window::{InsertStatus, TimelineWindow};
use crate::timeline::{ThreadFetcher, ThreadInfo};

/// 窗口淘汰通知
#[derive(Debug, Clone)]
pub struct EvictionNotice {
    pub scope: ScopeKey,
    pub evicted: Event,
    /// 淘汰后窗口中最旧的事件（最后可用锚点）
    pub oldest_kept: Option<Event>,
}

pub type EvictCallback = Arc<dyn Fn(&EvictionNotice) + Send + Sync>;

/// 每个窗口上限对应的游离 ID 容量倍数
const DETACHED_PER_SLOT: usize = 4;
const MIN_DETACHED: usize = 64;

/// 缓存各派生结构当前保留的条目数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheFootprint {
    pub window_events: usize,
    pub edit_targets: usize,
    pub edits: usize,
    pub redacted_marks: usize,
    pub reaction_targets: usize,
    pub reactions: usize,
    pub orphan_retractions: usize,
    pub detached: usize,
    pub threads: usize,
}

/// 不在任何窗口中、但挂着编辑/反应/撤回状态的 ID（按到达顺序，有上限）
struct DetachedIds {
    capacity: usize,
    order: VecDeque<String>,
    conversations: HashMap<String, String>,
}

impl DetachedIds {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::new(),
            conversations: HashMap::new(),
        }
    }

    /// 记录一个游离 ID，返回因超出容量被挤出的 ID
    fn insert(&mut self, id: &str, conversation_id: &str) -> Vec<String> {
        if self.conversations.contains_key(id) {
            return Vec::new();
        }
        self.conversations.insert(id.to_string(), conversation_id.to_string());
        self.order.push_back(id.to_string());
        let mut overflow = Vec::new();
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.conversations.remove(&oldest);
                overflow.push(oldest);
            }
        }
        overflow
    }

    fn remove(&mut self, id: &str) {
        if self.conversations.remove(id).is_some() {
            self.order.retain(|d| d != id);
        }
    }

    fn drain_conversation(&mut self, conversation_id: &str) -> Vec<String> {
        let drained: Vec<String> = self
            .order
            .iter()
            .filter(|id| self.conversations.get(*id).map(String::as_str) == Some(conversation_id))
            .cloned()
            .collect();
        for id in &drained {
            self.conversations.remove(id);
        }
        self.order.retain(|id| self.conversations.contains_key(id));
        drained
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

struct CacheState {
    windows: HashMap<ScopeKey, TimelineWindow>,
    edits: EditOverlay,
    reactions: ReactionAggregate,
    threads: HashMap<String, ThreadInfo>,
    detached: DetachedIds,
}

impl CacheState {
    fn find_mut(&mut self, conversation_id: &str, event_id: &str) -> Option<&mut Event> {
        self.windows
            .iter_mut()
            .filter(|(scope, _)| scope.conversation_id == conversation_id)
            .find_map(|(_, window)| window.get_mut(event_id))
    }

    fn in_window(&self, event_id: &str) -> bool {
        self.windows.values().any(|w| w.get(event_id).is_some())
    }

    /// 丢弃挂在 ID 上的全部派生状态
    fn forget(&mut self, id: &str) {
        self.edits.invalidate(id);
        self.reactions.invalidate(id);
        self.threads.remove(id);
    }

    /// ID 不在窗口中时记为游离；被挤出的游离 ID 的状态随之丢弃
    fn detach(&mut self, id: &str, conversation_id: &str) {
        if self.in_window(id) {
            return;
        }
        for overflow in self.detached.insert(id, conversation_id) {
            debug!("游离状态超出上限，丢弃: id={}", overflow);
            self.forget(&overflow);
        }
    }
}

struct CacheInner {
    page_limit: usize,
    state: Mutex<CacheState>,
    thread_fetcher: Option<Arc<dyn ThreadFetcher>>,
    thread_fetches: Mutex<HashMap<String, Arc<OnceCell<ThreadInfo>>>>,
    evict_callbacks: RwLock<Vec<EvictCallback>>,
}

/// 时间线缓存
#[derive(Clone)]
pub struct TimelineCache {
    inner: Arc<CacheInner>,
}

impl TimelineCache {
    pub fn new(page_limit: usize, local_user: &str, thread_fetcher: Option<Arc<dyn ThreadFetcher>>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                page_limit: page_limit.max(1),
                state: Mutex::new(CacheState {
                    windows: HashMap::new(),
                    edits: EditOverlay::new(),
                    reactions: ReactionAggregate::new(local_user),
                    threads: HashMap::new(),
                    detached: DetachedIds::new((page_limit * DETACHED_PER_SLOT).max(MIN_DETACHED)),
                }),
                thread_fetcher,
                thread_fetches: Mutex::new(HashMap::new()),
                evict_callbacks: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn page_limit(&self) -> usize {
        self.inner.page_limit
    }

    /// 注册淘汰回调
    pub fn on_evict(&self, callback: EvictCallback) {
        self.inner.evict_callbacks.write().push(callback);
    }

    fn fire_evictions(&self, scope: &ScopeKey, evicted: Vec<Event>, oldest_kept: Option<Event>) {
        if evicted.is_empty() {
            return;
        }
        let callbacks = self.inner.evict_callbacks.read().clone();
        for event in evicted {
            debug!("窗口淘汰: scope={}, event_id={}", scope, event.id);
            let notice = EvictionNotice {
                scope: scope.clone(),
                evicted: event,
                oldest_kept: oldest_kept.clone(),
            };
            for callback in &callbacks {
                callback(&notice);
            }
        }
    }

    /// 线程根事件入窗前等待线程信息拉取完成；同一个根的并发插入共享一次拉取
    async fn await_thread(&self, root: &Event) {
        let Some(fetcher) = self.inner.thread_fetcher.clone() else {
            return;
        };
        if self.inner.state.lock().threads.contains_key(&root.id) {
            return;
        }
        let cell = self
            .inner
            .thread_fetches
            .lock()
            .entry(root.id.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();
        let result = cell
            .get_or_try_init(|| async { fetcher.fetch_thread(&root.conversation_id, &root.id).await })
            .await;
        match result {
            Ok(info) => {
                self.inner.state.lock().threads.insert(root.id.clone(), info.clone());
                self.inner.thread_fetches.lock().remove(&root.id);
            }
            Err(e) => warn!("线程信息拉取失败，按普通事件入窗: root={}, error={}", root.id, e),
        }
    }

    /// 插入一个可入窗的事件
    pub async fn insert(&self, mut event: Event, origin: CommitOrigin, is_thread_root: bool) -> InsertStatus {
        if is_thread_root || event.thread_summary.is_some() {
            self.await_thread(&event).await;
        }

        let scope = event.scope();
        let (result, oldest_kept) = {
            let mut state = self.inner.state.lock();
            if event.redacted {
                state.edits.mark_target_redacted(&event.id);
            } else if let Some(winner) = state.edits.winner(&event.id) {
                event.content = winner.content.clone();
            }
            let limit = self.inner.page_limit;
            let window = state
                .windows
                .entry(scope.clone())
                .or_insert_with(|| TimelineWindow::new(limit));
            let event_id = event.id.clone();
            let result = window.insert(event, origin.is_initial_page());
            let oldest_kept = window.oldest().cloned();
            state.detached.remove(&event_id);
            if result.status == InsertStatus::Rejected {
                state.forget(&event_id);
            }
            for evicted in &result.evicted {
                state.forget(&evicted.id);
            }
            (result, oldest_kept)
        };
        self.fire_evictions(&scope, result.evicted, oldest_kept);
        result.status
    }

    /// 从窗口中删除事件，并清理它的编辑覆盖与反应聚合
    pub fn delete(&self, event_id: &str) -> Option<Event> {
        let mut state = self.inner.state.lock();
        let removed = state
            .windows
            .values_mut()
            .find_map(|window| window.remove(event_id));
        if removed.is_some() {
            state.forget(event_id);
        }
        removed
    }

    pub fn apply_edit(&self, edit: &Event, target_id: &str, new_content: serde_json::Value) -> EditApply {
        let mut state = self.inner.state.lock();
        let target_redacted = state
            .windows
            .values()
            .find_map(|w| w.get(target_id))
            .map(|e| e.redacted)
            .unwrap_or(false);
        if target_redacted {
            state.edits.mark_target_redacted(target_id);
        }
        let result = state.edits.apply(target_id, &edit.id, new_content, edit.timestamp);
        if let EditApply::Applied(content) = &result {
            if let Some(target) = state.find_mut(&edit.conversation_id, target_id) {
                target.content = content.clone();
            }
        }
        state.detach(target_id, &edit.conversation_id);
        result
    }

    pub fn add_reaction(&self, reaction: &Event, target_id: &str, key: &str, shortcode: Option<&str>) -> bool {
        let mut state = self.inner.state.lock();
        if state.edits.is_target_redacted(target_id) {
            return false;
        }
        let added = state
            .reactions
            .add(&reaction.id, target_id, key, shortcode, &reaction.sender, reaction.timestamp);
        state.detach(target_id, &reaction.conversation_id);
        added
    }

    /// 应用一条撤回：被撤回的是编辑则重新选举，是反应则撤回聚合，其他事件在窗口中标记撤回
    pub fn redact(&self, redacted: &Event) {
        let mut state = self.inner.state.lock();
        match redacted.kind() {
            EventKind::Edit { .. } => {
                if let Some((target_id, reelection)) = state.edits.redact_edit(&redacted.id) {
                    if let Some(target) = state.find_mut(&redacted.conversation_id, &target_id) {
                        target.content = match reelection {
                            Reelection::Winner(content) => content,
                            Reelection::Original => target.original_content.clone(),
                        };
                    }
                }
            }
            EventKind::Reaction { .. } => {
                if state.reactions.retract(&redacted.id, redacted.timestamp).is_none() {
                    // 可能记成了孤立撤回
                    state.detach(&redacted.id, &redacted.conversation_id);
                }
            }
            _ => {
                state.edits.mark_target_redacted(&redacted.id);
                state.reactions.invalidate(&redacted.id);
                match state.find_mut(&redacted.conversation_id, &redacted.id) {
                    Some(entry) => entry.strip_for_redaction(),
                    None => state.detach(&redacted.id, &redacted.conversation_id),
                }
            }
        }
    }

    /// 结束 scope 的首次填充阶段并裁剪到上限
    pub fn settle(&self, scope: &ScopeKey) {
        let (evicted, oldest_kept) = {
            let mut state = self.inner.state.lock();
            let Some(window) = state.windows.get_mut(scope) else {
                return;
            };
            let evicted = window.settle();
            let oldest_kept = window.oldest().cloned();
            for event in &evicted {
                state.forget(&event.id);
            }
            (evicted, oldest_kept)
        };
        self.fire_evictions(scope, evicted, oldest_kept);
    }

    /// 按变更通知更新缓存（由 SDK 的有序管线调用）
    pub async fn apply(&self, notification: &ChangeNotification) {
        match notification {
            ChangeNotification::EventAdded(added) => self.apply_added(added).await,
            ChangeNotification::EventRedacted(redacted) => self.redact(&redacted.event),
            ChangeNotification::SyncStatusChanged(change) => {
                if matches!(change.status, SyncStatus::CaughtUp | SyncStatus::Complete) {
                    self.settle(&change.scope);
                }
            }
            ChangeNotification::NotificationChanged(_) => {}
        }
    }

    async fn apply_added(&self, added: &EventAdded) {
        let event = &added.event;
        if let Some(txn) = &added.replaced_local_echo {
            let mut state = self.inner.state.lock();
            for window in state.windows.values_mut() {
                window.remove(txn);
            }
            state.edits.retarget(txn, &event.id);
            state.reactions.invalidate(txn);
            state.detached.remove(txn);
        }

        let kind = event.kind();
        match kind {
            EventKind::Edit { target, new_content } if !event.redacted => {
                let result = self.apply_edit(event, &target, new_content);
                debug!("编辑已应用到缓存: edit_id={}, target={}, result={:?}", event.id, target, result);
            }
            EventKind::Reaction { target, key, shortcode } if !event.redacted => {
                self.add_reaction(event, &target, &key, shortcode.as_deref());
            }
            kind if kind.is_windowable() => {
                self.insert(event.clone(), added.origin, added.is_thread_root).await;
            }
            _ => {}
        }
    }

    pub fn events(&self, scope: &ScopeKey) -> Vec<Event> {
        self.inner
            .state
            .lock()
            .windows
            .get(scope)
            .map(|w| w.events().to_vec())
            .unwrap_or_default()
    }

    pub fn window_len(&self, scope: &ScopeKey) -> usize {
        self.inner
            .state
            .lock()
            .windows
            .get(scope)
            .map(|w| w.len())
            .unwrap_or(0)
    }

    pub fn reactions(&self, target_id: &str) -> Vec<ReactionSummary> {
        self.inner.state.lock().reactions.summary(target_id)
    }

    pub fn thread_info(&self, root_id: &str) -> Option<ThreadInfo> {
        self.inner.state.lock().threads.get(root_id).cloned()
    }

    /// 丢弃会话（含线程）的全部窗口
    pub fn clear_conversation(&self, conversation_id: &str) {
        let mut state = self.inner.state.lock();
        let dropped: Vec<String> = state
            .windows
            .iter()
            .filter(|(scope, _)| scope.conversation_id == conversation_id)
            .flat_map(|(_, window)| window.events().iter().map(|e| e.id.clone()))
            .collect();
        state.windows.retain(|scope, _| scope.conversation_id != conversation_id);
        let detached = state.detached.drain_conversation(conversation_id);
        for id in dropped.iter().chain(detached.iter()) {
            state.forget(id);
        }
        state.threads.retain(|_, info| info.root.conversation_id != conversation_id);
    }

    pub fn footprint(&self) -> CacheFootprint {
        let state = self.inner.state.lock();
        let (edit_targets, edits, redacted_marks) = state.edits.sizes();
        let (reaction_targets, reactions, orphan_retractions) = state.reactions.sizes();
        CacheFootprint {
            window_events: state.windows.values().map(|w| w.len()).sum(),
            edit_targets,
            edits,
            redacted_marks,
            reaction_targets,
            reactions,
            orphan_retractions,
            detached: state.detached.len(),
            threads: state.threads.len(),
        }
    }
}
