//! 同步协调器
//!
//! 全局单队列、单 worker 串行处理各 scope 的同步请求：
//! - 同一 scope 排队中的请求合并（新参数覆盖旧参数，队列位置不变）
//! - 正在执行的 scope 最多再排一个后续请求
//! - 每页之间等待写队列回落到阈值以下，再检查是否应继续（暂停/取消/关闭）
//! - 拉取失败只终止当前 scope 的同步链，不做自动重试
//! - 重置游标前先等正在执行的同一会话同步链退出，避免旧游标被写回

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{MirrorchatSDKError, Result};
use crate::events::{CommitOrigin, EventManager, SyncStatus};
use crate::lifecycle::LifecycleHook;
use crate::storage::entities::{Event, ScopeKey};
use crate::storage::{StorageManager, UpsertOutcome};
use crate::sync::commit_applier::CommitApplier;
use crate::sync::cursor_store::{SyncCursor, SyncCursorStore};
use crate::sync::normalize::normalize_raw_event;
use crate::sync::source::{Direction, EventPage, RemoteEventSource};
use crate::sync::{SyncMode, SyncRequest};

/// 同步链在继续点停下的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Paused,
    Cancelled,
}

/// 一条同步链的结束方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChainEnd {
    /// 远端已无更多历史
    Complete,
    /// 越过追赶检查点；未完成全量时需要补一个回填请求
    CaughtUp { needs_backfill: bool },
    /// 回填提交到了锚点事件
    AnchorReached,
    Stopped(StopReason),
}

#[derive(Default)]
struct QueueState {
    order: VecDeque<ScopeKey>,
    pending: HashMap<ScopeKey, SyncRequest>,
    in_flight: Option<ScopeKey>,
    cancelled: HashSet<ScopeKey>,
}

impl QueueState {
    fn is_idle(&self) -> bool {
        self.in_flight.is_none() && self.pending.is_empty()
    }

    fn take_next(&mut self) -> Option<SyncRequest> {
        while let Some(scope) = self.order.pop_front() {
            if let Some(request) = self.pending.remove(&scope) {
                self.cancelled.remove(&scope);
                self.in_flight = Some(scope);
                return Some(request);
            }
        }
        None
    }
}

struct Inner {
    source: Arc<dyn RemoteEventSource>,
    applier: CommitApplier,
    cursors: SyncCursorStore,
    storage: StorageManager,
    events: EventManager,
    page_limit: u32,
    write_queue_depth: usize,
    queue: Mutex<QueueState>,
    wakeup: Notify,
    idle: Notify,
    /// 每个请求执行结束（in_flight 清空）时通知
    chain_done: Notify,
    paused: AtomicBool,
    resumed: Notify,
    shutdown: CancellationToken,
}

/// 同步协调器
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<Inner>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SyncCoordinator {
    /// 创建协调器并启动 worker 任务（需要在 tokio runtime 中调用）
    pub fn start(
        source: Arc<dyn RemoteEventSource>,
        applier: CommitApplier,
        cursors: SyncCursorStore,
        storage: StorageManager,
        events: EventManager,
        page_limit: u32,
        write_queue_depth: usize,
    ) -> Self {
        let inner = Arc::new(Inner {
            source,
            applier,
            cursors,
            storage,
            events,
            page_limit: page_limit.max(1),
            write_queue_depth: write_queue_depth.max(1),
            queue: Mutex::new(QueueState::default()),
            wakeup: Notify::new(),
            idle: Notify::new(),
            chain_done: Notify::new(),
            paused: AtomicBool::new(false),
            resumed: Notify::new(),
            shutdown: CancellationToken::new(),
        });
        let handle = tokio::spawn(Inner::run_worker(inner.clone()));
        info!(
            "🔄 同步协调器已启动: page_limit={}, write_queue_depth={}",
            inner.page_limit, inner.write_queue_depth
        );
        Self {
            inner,
            worker: Arc::new(Mutex::new(Some(handle))),
        }
    }

    /// 为 scope 排入一个同步请求
    pub fn sync(&self, scope: ScopeKey, anchor_event: Option<String>) -> Result<()> {
        self.enqueue(SyncRequest {
            scope,
            anchor_event,
            mode: None,
        })
    }

    pub fn enqueue(&self, request: SyncRequest) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(MirrorchatSDKError::ShuttingDown("同步协调器已关闭".to_string()));
        }
        self.inner.enqueue_back(request);
        Ok(())
    }

    /// 排队中（未执行）的请求，按队列顺序
    pub fn queued(&self) -> Vec<SyncRequest> {
        let queue = self.inner.queue.lock();
        queue
            .order
            .iter()
            .filter_map(|scope| queue.pending.get(scope).cloned())
            .collect()
    }

    pub fn in_flight(&self) -> Option<ScopeKey> {
        self.inner.queue.lock().in_flight.clone()
    }

    /// 取消某个 scope：移出队列；正在执行时在下一个继续点停止
    pub fn cancel(&self, scope: &ScopeKey) {
        let mut queue = self.inner.queue.lock();
        queue.pending.remove(scope);
        queue.order.retain(|s| s != scope);
        if queue.in_flight.as_ref() == Some(scope) {
            queue.cancelled.insert(scope.clone());
        }
        debug!("同步请求已取消: scope={}", scope);
    }

    /// 等待队列清空且没有正在执行的请求
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.queue.lock().is_idle() || self.inner.shutdown.is_cancelled() {
                return;
            }
            tokio::select! {
                _ = notified => {}
                _ = self.inner.shutdown.cancelled() => return,
            }
        }
    }

    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
        info!("⏸️ 同步协调器已暂停");
    }

    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
        self.inner.resumed.notify_one();
        self.inner.wakeup.notify_one();
        info!("▶️ 同步协调器已恢复");
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    pub async fn cursor(&self, scope: &ScopeKey) -> Result<Option<SyncCursor>> {
        self.inner.cursors.get(scope).await
    }

    /// 本地乐观写入，走与同步相同的提交路径
    pub async fn commit_local_echo(&self, event: Event) -> Result<Option<UpsertOutcome>> {
        self.ensure_running()?;
        self.inner.applier.apply_event(event, CommitOrigin::LocalEcho).await
    }

    /// 单条实时推送（不推进追赶检查点，避免跳过断线期间的空洞）
    pub async fn commit_live(&self, event: Event) -> Result<Option<UpsertOutcome>> {
        self.ensure_running()?;
        self.inner.applier.apply_event(event, CommitOrigin::Live).await
    }

    pub async fn cancel_local_echo(&self, transaction_id: &str) -> Result<Option<Event>> {
        self.ensure_running()?;
        let removed = self.inner.storage.cancel_local_echo(transaction_id).await?;
        if let Some(event) = &removed {
            self.inner.applier.dedup().unmark(&event.id);
        }
        Ok(removed)
    }

    /// 删除 scope 的游标与检查点（历史清空后重新同步）
    pub async fn reset_scope(&self, scope: &ScopeKey) -> Result<()> {
        self.cancel(scope);
        self.wait_chain_exit(|s| s == scope).await;
        self.inner.cursors.reset(scope).await?;
        info!("同步游标已重置: scope={}", scope);
        Ok(())
    }

    /// 删除整个会话（含所有线程）的同步状态，并清空去重集合
    pub async fn reset_conversation(&self, conversation_id: &str) -> Result<()> {
        let scopes: Vec<ScopeKey> = {
            let queue = self.inner.queue.lock();
            queue
                .pending
                .keys()
                .chain(queue.in_flight.iter())
                .filter(|s| s.conversation_id == conversation_id)
                .cloned()
                .collect()
        };
        for scope in &scopes {
            self.cancel(scope);
        }
        self.wait_chain_exit(|s| s.conversation_id == conversation_id).await;
        let removed = self.inner.cursors.reset_conversation(conversation_id).await?;
        self.inner.applier.dedup().clear();
        info!(
            "会话同步状态已重置: conversation_id={}, removed_keys={}",
            conversation_id, removed
        );
        Ok(())
    }

    /// 等待正在执行且匹配的同步链退出；关闭时不再等待
    async fn wait_chain_exit(&self, matches: impl Fn(&ScopeKey) -> bool) {
        loop {
            let notified = self.inner.chain_done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let busy = self.inner.queue.lock().in_flight.as_ref().map_or(false, &matches);
            if !busy || self.inner.shutdown.is_cancelled() {
                return;
            }
            debug!("等待正在执行的同步链退出");
            tokio::select! {
                _ = notified => {}
                _ = self.inner.shutdown.cancelled() => return,
            }
        }
    }

    /// 停止 worker；正在进行的拉取不会被中断，当前页提交完成后退出
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.idle.notify_waiters();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("同步 worker 退出异常: {}", e);
            }
        }
        info!("🛑 同步协调器已关闭");
    }

    fn ensure_running(&self) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(MirrorchatSDKError::ShuttingDown("同步协调器已关闭".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl LifecycleHook for SyncCoordinator {
    async fn on_background(&self) -> Result<()> {
        self.pause();
        Ok(())
    }

    async fn on_foreground(&self) -> Result<()> {
        self.resume();
        Ok(())
    }
}

impl Inner {
    fn enqueue_back(&self, request: SyncRequest) {
        {
            let mut queue = self.queue.lock();
            let scope = request.scope.clone();
            if queue.pending.insert(scope.clone(), request).is_some() {
                debug!("同步请求已合并: scope={}", scope);
            } else {
                queue.order.push_back(scope);
            }
        }
        self.wakeup.notify_one();
    }

    /// 暂停打断的请求放回队首；期间若已有更新的请求则保留新的
    fn enqueue_front(&self, request: SyncRequest) {
        {
            let mut queue = self.queue.lock();
            if !queue.pending.contains_key(&request.scope) {
                queue.order.push_front(request.scope.clone());
                queue.pending.insert(request.scope.clone(), request);
            }
        }
        self.wakeup.notify_one();
    }

    async fn run_worker(inner: Arc<Inner>) {
        loop {
            if inner.shutdown.is_cancelled() {
                break;
            }
            if inner.paused.load(Ordering::SeqCst) {
                tokio::select! {
                    _ = inner.resumed.notified() => continue,
                    _ = inner.shutdown.cancelled() => break,
                }
            }

            let next = inner.queue.lock().take_next();
            match next {
                Some(request) => {
                    inner.run_request(request).await;
                    inner.queue.lock().in_flight = None;
                    inner.chain_done.notify_waiters();
                }
                None => {
                    inner.idle.notify_waiters();
                    tokio::select! {
                        _ = inner.wakeup.notified() => {}
                        _ = inner.shutdown.cancelled() => break,
                    }
                }
            }
        }
        inner.idle.notify_waiters();
        debug!("同步 worker 已退出");
    }

    fn is_cancelled(&self, scope: &ScopeKey) -> bool {
        self.queue.lock().cancelled.contains(scope)
    }

    fn stop_reason(&self, scope: &ScopeKey) -> Option<StopReason> {
        if self.shutdown.is_cancelled() || self.is_cancelled(scope) {
            return Some(StopReason::Cancelled);
        }
        if self.paused.load(Ordering::SeqCst) {
            return Some(StopReason::Paused);
        }
        None
    }

    /// 翻页前的继续点：先等写队列回落，再检查是否继续
    async fn continuation_point(&self, scope: &ScopeKey) -> Option<StopReason> {
        self.storage.wait_for_drain(self.write_queue_depth).await;
        self.stop_reason(scope)
    }

    async fn run_request(&self, request: SyncRequest) {
        let scope = request.scope.clone();
        let cursor = match self.cursors.get(&scope).await {
            Ok(cursor) => cursor.unwrap_or_default(),
            Err(e) => {
                warn!("读取同步游标失败: scope={}, error={}", scope, e);
                self.events
                    .emit_sync_status(&scope, SyncStatus::Failed { error: e.to_string() });
                return;
            }
        };
        let mode = request.mode.unwrap_or(if cursor.last_event_id.is_none() {
            SyncMode::Backfill
        } else {
            SyncMode::CatchUp
        });

        info!("开始同步: scope={}, mode={:?}", scope, mode);
        self.events.emit_sync_status(&scope, SyncStatus::Started { mode });

        let result = match mode {
            SyncMode::Backfill => self.backfill(&request, cursor).await,
            SyncMode::CatchUp => self.catch_up(&scope, cursor).await,
        };

        match result {
            Ok(ChainEnd::Complete) => {
                info!("✅ 同步完成，历史已完整: scope={}", scope);
                self.events.emit_sync_status(&scope, SyncStatus::Complete);
            }
            Ok(ChainEnd::CaughtUp { needs_backfill }) => {
                info!("✅ 追赶完成: scope={}, needs_backfill={}", scope, needs_backfill);
                self.events.emit_sync_status(&scope, SyncStatus::CaughtUp);
                if needs_backfill {
                    self.enqueue_back(SyncRequest::backfill(scope));
                }
            }
            Ok(ChainEnd::AnchorReached) => {
                info!("回填已到达锚点: scope={}", scope);
                self.events.emit_sync_status(&scope, SyncStatus::CaughtUp);
            }
            Ok(ChainEnd::Stopped(reason)) => {
                info!("同步在继续点停止: scope={}, reason={:?}", scope, reason);
                self.events.emit_sync_status(&scope, SyncStatus::Cancelled);
                if reason == StopReason::Paused {
                    self.enqueue_front(request);
                }
            }
            Err(e) => {
                warn!("❌ 同步失败: scope={}, error={}", scope, e);
                self.events
                    .emit_sync_status(&scope, SyncStatus::Failed { error: e.to_string() });
            }
        }
    }

    async fn fetch(&self, scope: &ScopeKey, from_token: Option<&str>) -> Result<EventPage> {
        self.source
            .fetch_events(
                &scope.conversation_id,
                scope.thread_id.as_deref(),
                Direction::Backward,
                self.page_limit,
                from_token,
            )
            .await
            .map_err(|e| match e {
                MirrorchatSDKError::TransientFetch { .. } => e,
                other => MirrorchatSDKError::transient(scope, other),
            })
    }

    fn normalize_page(&self, scope: &ScopeKey, page: &EventPage) -> Vec<Event> {
        page.events
            .iter()
            .map(|raw| {
                normalize_raw_event(&scope.conversation_id, scope.thread_id.as_deref(), raw).0
            })
            .collect()
    }

    /// 远端没有下一页，或返回的令牌原地不动
    fn is_exhausted(page: &EventPage, from_token: Option<&str>) -> bool {
        match page.next_token.as_deref() {
            None => true,
            Some(next) => page.events.is_empty() && Some(next) == from_token,
        }
    }

    /// 全量回填：从保存的令牌继续向更早的历史翻页
    async fn backfill(&self, request: &SyncRequest, mut cursor: SyncCursor) -> Result<ChainEnd> {
        let scope = &request.scope;
        if cursor.is_complete {
            return Ok(ChainEnd::Complete);
        }
        let mut page_index = 0u32;
        loop {
            if page_index > 0 {
                if let Some(reason) = self.continuation_point(scope).await {
                    return Ok(ChainEnd::Stopped(reason));
                }
            }

            let from_token = cursor.pagination_token.clone();
            let page = self.fetch(scope, from_token.as_deref()).await?;
            let events = self.normalize_page(scope, &page);
            let seen: Vec<(String, i64)> = events
                .iter()
                .filter(|e| !e.malformed)
                .map(|e| (e.id.clone(), e.timestamp))
                .collect();
            let report = self
                .applier
                .apply_page(events, CommitOrigin::Sync { page_index })
                .await?;

            for (id, ts) in &seen {
                cursor.observe(id, *ts);
            }
            if Self::is_exhausted(&page, from_token.as_deref()) {
                cursor.is_complete = true;
                cursor.pagination_token = None;
            } else {
                cursor.pagination_token = page.next_token.clone();
            }
            // 拉取期间被取消（会话可能已重置），已提交的页保留，游标不再写回
            if self.is_cancelled(scope) {
                return Ok(ChainEnd::Stopped(StopReason::Cancelled));
            }
            self.cursors.set(scope, &cursor).await?;
            debug!(
                "回填页已提交: scope={}, page_index={}, committed={}, duplicates={}",
                scope,
                page_index,
                report.committed.len(),
                report.duplicates
            );
            self.events.emit_sync_status(
                scope,
                SyncStatus::PageCommitted {
                    page_index,
                    committed: report.committed.len(),
                },
            );

            if cursor.is_complete {
                return Ok(ChainEnd::Complete);
            }
            if let Some(anchor) = &request.anchor_event {
                if seen.iter().any(|(id, _)| id == anchor) {
                    return Ok(ChainEnd::AnchorReached);
                }
            }
            page_index += 1;
        }
    }

    /// 追赶：从最新处翻页直到越过检查点。
    /// 检查点只在链结束时推进，中途中断时下一次仍从旧检查点追赶；
    /// 回填令牌只有在远端已耗尽（完成）时才会改写。
    async fn catch_up(&self, scope: &ScopeKey, mut cursor: SyncCursor) -> Result<ChainEnd> {
        let checkpoint_id = cursor.last_event_id.clone();
        let checkpoint_ts = cursor.last_event_ts;
        let mut newest = SyncCursor {
            last_event_id: cursor.last_event_id.clone(),
            last_event_ts: cursor.last_event_ts,
            ..Default::default()
        };
        let mut token: Option<String> = None;
        let mut page_index = 0u32;

        loop {
            if page_index > 0 {
                if let Some(reason) = self.continuation_point(scope).await {
                    return Ok(ChainEnd::Stopped(reason));
                }
            }

            let page = self.fetch(scope, token.as_deref()).await?;
            let events = self.normalize_page(scope, &page);
            let crossed = events.iter().any(|e| {
                checkpoint_id.as_deref() == Some(e.id.as_str())
                    || (!e.malformed && e.timestamp <= checkpoint_ts)
            });
            let seen: Vec<(String, i64)> = events
                .iter()
                .filter(|e| !e.malformed)
                .map(|e| (e.id.clone(), e.timestamp))
                .collect();
            let report = self
                .applier
                .apply_page(events, CommitOrigin::Sync { page_index })
                .await?;
            for (id, ts) in &seen {
                newest.observe(id, *ts);
            }
            self.events.emit_sync_status(
                scope,
                SyncStatus::PageCommitted {
                    page_index,
                    committed: report.committed.len(),
                },
            );

            let exhausted = Self::is_exhausted(&page, token.as_deref());
            if exhausted || crossed {
                cursor.last_event_id = newest.last_event_id.clone();
                cursor.last_event_ts = newest.last_event_ts;
                // 同一页既耗尽又越过检查点时，以完成为准
                if exhausted {
                    cursor.is_complete = true;
                    cursor.pagination_token = None;
                }
                if self.is_cancelled(scope) {
                    return Ok(ChainEnd::Stopped(StopReason::Cancelled));
                }
                self.cursors.set(scope, &cursor).await?;
                if cursor.is_complete && exhausted {
                    return Ok(ChainEnd::Complete);
                }
                return Ok(ChainEnd::CaughtUp {
                    needs_backfill: !cursor.is_complete,
                });
            }

            token = page.next_token.clone();
            page_index += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::deduplication::DeduplicationManager;
    use crate::storage::entities::EventQuery;
    use crate::sync::decrypt::DecryptRetryPolicy;
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tokio::sync::broadcast;

    /// 按时间升序保存历史，Backward 翻页时从新到旧返回
    #[derive(Default)]
    struct FakeSource {
        history: Mutex<HashMap<String, Vec<Value>>>,
        failing: Mutex<HashSet<String>>,
        calls: Mutex<Vec<(String, Option<String>)>>,
        /// 置位时每次拉取先通知 entered，再等 release 放行
        held: AtomicBool,
        entered: Notify,
        release: Notify,
    }

    impl FakeSource {
        fn push(&self, conversation_id: &str, from_ts: i64, count: i64) {
            let mut history = self.history.lock();
            let timeline = history.entry(conversation_id.to_string()).or_default();
            for ts in from_ts..from_ts + count {
                timeline.push(json!({
                    "event_id": format!("${}-{}", conversation_id, ts),
                    "type": "m.room.message",
                    "sender": "@bob:hs",
                    "origin_server_ts": ts,
                    "content": {"msgtype": "m.text", "body": format!("message {}", ts)}
                }));
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().len()
        }

        fn open_gate(&self) {
            self.held.store(false, Ordering::SeqCst);
            self.release.notify_one();
        }
    }

    #[async_trait]
    impl RemoteEventSource for FakeSource {
        async fn fetch_events(
            &self,
            conversation_id: &str,
            _thread_id: Option<&str>,
            _direction: Direction,
            limit: u32,
            from_token: Option<&str>,
        ) -> Result<EventPage> {
            self.calls
                .lock()
                .push((conversation_id.to_string(), from_token.map(String::from)));
            if self.held.load(Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            if self.failing.lock().contains(conversation_id) {
                return Err(MirrorchatSDKError::IO("connection reset".into()));
            }
            let history = self.history.lock();
            let timeline = history.get(conversation_id).cloned().unwrap_or_default();
            let end = from_token
                .and_then(|t| t.parse::<usize>().ok())
                .unwrap_or(timeline.len());
            let start = end.saturating_sub(limit as usize);
            Ok(EventPage {
                events: timeline[start..end].iter().rev().cloned().collect(),
                next_token: (start > 0).then(|| start.to_string()),
                prev_token: None,
            })
        }
    }

    struct Fixture {
        _dir: TempDir,
        source: Arc<FakeSource>,
        storage: StorageManager,
        coordinator: SyncCoordinator,
        statuses: broadcast::Receiver<crate::events::SyncStatusChanged>,
    }

    async fn fixture(page_limit: u32) -> Fixture {
        let dir = TempDir::new().unwrap();
        let events = EventManager::new(1024);
        let statuses = events.subscribe_sync_status();
        let storage = StorageManager::open(dir.path(), "@me:hs", events.clone()).await.unwrap();
        let source = Arc::new(FakeSource::default());
        let applier = CommitApplier::new(
            storage.clone(),
            DeduplicationManager::new(),
            None,
            DecryptRetryPolicy::default(),
        );
        let coordinator = SyncCoordinator::start(
            source.clone(),
            applier,
            SyncCursorStore::new(storage.kv().clone()),
            storage.clone(),
            events,
            page_limit,
            8,
        );
        Fixture {
            _dir: dir,
            source,
            storage,
            coordinator,
            statuses,
        }
    }

    fn drain(rx: &mut broadcast::Receiver<crate::events::SyncStatusChanged>, scope: &ScopeKey) -> Vec<SyncStatus> {
        let mut out = Vec::new();
        while let Ok(change) = rx.try_recv() {
            if &change.scope == scope {
                out.push(change.status);
            }
        }
        out
    }

    #[tokio::test]
    async fn first_sync_backfills_until_exhausted() {
        let mut f = fixture(10).await;
        f.source.push("!room", 1, 25);
        let scope = ScopeKey::conversation("!room");

        f.coordinator.sync(scope.clone(), None).unwrap();
        f.coordinator.wait_idle().await;

        let statuses = drain(&mut f.statuses, &scope);
        assert_eq!(statuses.first(), Some(&SyncStatus::Started { mode: SyncMode::Backfill }));
        assert_eq!(statuses.last(), Some(&SyncStatus::Complete));
        assert_eq!(
            statuses
                .iter()
                .filter(|s| matches!(s, SyncStatus::PageCommitted { .. }))
                .count(),
            3
        );

        let cursor = f.coordinator.cursor(&scope).await.unwrap().unwrap();
        assert!(cursor.is_complete);
        assert_eq!(cursor.last_event_id.as_deref(), Some("$!room-25"));
        assert_eq!(f.storage.count(EventQuery::conversation("!room")).await.unwrap(), 25);
        f.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn catch_up_stops_at_checkpoint() {
        let mut f = fixture(10).await;
        f.source.push("!room", 1, 25);
        let scope = ScopeKey::conversation("!room");
        f.coordinator.sync(scope.clone(), None).unwrap();
        f.coordinator.wait_idle().await;
        drain(&mut f.statuses, &scope);
        let calls_before = f.source.call_count();

        f.source.push("!room", 26, 4);
        f.coordinator.sync(scope.clone(), None).unwrap();
        f.coordinator.wait_idle().await;

        let statuses = drain(&mut f.statuses, &scope);
        assert_eq!(statuses.first(), Some(&SyncStatus::Started { mode: SyncMode::CatchUp }));
        assert_eq!(statuses.last(), Some(&SyncStatus::CaughtUp));
        assert_eq!(f.source.call_count() - calls_before, 1);

        let cursor = f.coordinator.cursor(&scope).await.unwrap().unwrap();
        assert_eq!(cursor.last_event_id.as_deref(), Some("$!room-29"));
        assert!(cursor.is_complete);
        assert_eq!(f.storage.count(EventQuery::conversation("!room")).await.unwrap(), 29);
        f.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn catch_up_requeues_unfinished_backfill() {
        let mut f = fixture(10).await;
        f.source.push("!room", 1, 30);
        let scope = ScopeKey::conversation("!room");

        // 锚点在第一页，回填链在第一页后停下
        f.coordinator
            .sync(scope.clone(), Some("$!room-25".to_string()))
            .unwrap();
        f.coordinator.wait_idle().await;
        let cursor = f.coordinator.cursor(&scope).await.unwrap().unwrap();
        assert!(!cursor.is_complete);
        assert_eq!(cursor.pagination_token.as_deref(), Some("20"));
        drain(&mut f.statuses, &scope);

        f.source.push("!room", 31, 3);
        f.coordinator.sync(scope.clone(), None).unwrap();
        f.coordinator.wait_idle().await;

        let statuses = drain(&mut f.statuses, &scope);
        assert!(statuses.contains(&SyncStatus::CaughtUp));
        assert_eq!(statuses.last(), Some(&SyncStatus::Complete));
        assert!(statuses.contains(&SyncStatus::Started { mode: SyncMode::Backfill }));

        let cursor = f.coordinator.cursor(&scope).await.unwrap().unwrap();
        assert!(cursor.is_complete);
        assert_eq!(cursor.last_event_id.as_deref(), Some("$!room-33"));
        assert_eq!(f.storage.count(EventQuery::conversation("!room")).await.unwrap(), 33);
        f.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn fetch_failure_only_aborts_its_scope() {
        let mut f = fixture(10).await;
        f.source.push("!bad", 1, 5);
        f.source.push("!good", 1, 5);
        f.source.failing.lock().insert("!bad".to_string());
        let bad = ScopeKey::conversation("!bad");
        let good = ScopeKey::conversation("!good");

        f.coordinator.sync(bad.clone(), None).unwrap();
        f.coordinator.sync(good.clone(), None).unwrap();
        f.coordinator.wait_idle().await;

        let mut bad_status = Vec::new();
        let mut good_status = Vec::new();
        while let Ok(change) = f.statuses.try_recv() {
            if change.scope == bad {
                bad_status.push(change.status);
            } else if change.scope == good {
                good_status.push(change.status);
            }
        }
        assert!(matches!(bad_status.last(), Some(SyncStatus::Failed { error }) if error.contains("connection reset")));
        assert_eq!(good_status.last(), Some(&SyncStatus::Complete));
        assert!(f.coordinator.cursor(&bad).await.unwrap().is_none());
        f.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn queued_requests_for_same_scope_coalesce() {
        let f = fixture(10).await;
        f.source.push("!a", 1, 3);
        f.source.push("!b", 1, 3);
        let a = ScopeKey::conversation("!a");
        let b = ScopeKey::conversation("!b");

        f.coordinator.pause();
        f.coordinator.sync(a.clone(), Some("$old".into())).unwrap();
        f.coordinator.sync(b.clone(), None).unwrap();
        f.coordinator.sync(a.clone(), Some("$new".into())).unwrap();

        let queued = f.coordinator.queued();
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[0].scope, a);
        assert_eq!(queued[0].anchor_event.as_deref(), Some("$new"));
        assert_eq!(queued[1].scope, b);

        f.coordinator.resume();
        f.coordinator.wait_idle().await;
        assert_eq!(f.source.call_count(), 2);
        f.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn requests_during_fetch_queue_a_single_follow_up() {
        let f = fixture(10).await;
        f.source.push("!a", 1, 3);
        let a = ScopeKey::conversation("!a");
        f.source.held.store(true, Ordering::SeqCst);

        f.coordinator.sync(a.clone(), Some("$anchor1".into())).unwrap();
        f.source.entered.notified().await;
        assert_eq!(f.coordinator.in_flight(), Some(a.clone()));
        assert!(f.coordinator.queued().is_empty());

        f.coordinator.sync(a.clone(), Some("$anchor2".into())).unwrap();
        let queued = f.coordinator.queued();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].scope, a);
        assert_eq!(queued[0].anchor_event.as_deref(), Some("$anchor2"));

        // 后续请求再次合并，仍只有一个
        f.coordinator.sync(a.clone(), Some("$anchor3".into())).unwrap();
        let queued = f.coordinator.queued();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].anchor_event.as_deref(), Some("$anchor3"));

        f.source.open_gate();
        f.coordinator.wait_idle().await;
        // 首次回填一页完成，后续请求追赶一页
        assert_eq!(f.source.call_count(), 2);
        f.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn conversation_reset_during_fetch_leaves_no_cursor() {
        let f = fixture(10).await;
        f.source.push("!room", 1, 25);
        let scope = ScopeKey::conversation("!room");
        f.source.held.store(true, Ordering::SeqCst);

        f.coordinator.sync(scope.clone(), None).unwrap();
        f.source.entered.notified().await;

        let coordinator = f.coordinator.clone();
        let reset = tokio::spawn(async move { coordinator.reset_conversation("!room").await });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!reset.is_finished());

        f.source.open_gate();
        reset.await.unwrap().unwrap();
        assert_eq!(f.coordinator.in_flight(), None);
        assert!(f.coordinator.cursor(&scope).await.unwrap().is_none());

        f.coordinator.wait_idle().await;
        assert!(f.coordinator.cursor(&scope).await.unwrap().is_none());
        // 被打断的链在第一页后停止
        assert_eq!(f.source.call_count(), 1);
        f.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn store_failure_keeps_cursor_unadvanced() {
        let mut f = fixture(10).await;
        f.source.push("!room", 1, 5);
        let scope = ScopeKey::conversation("!room");
        f.storage.db().shutdown();

        f.coordinator.sync(scope.clone(), None).unwrap();
        f.coordinator.wait_idle().await;

        let statuses = drain(&mut f.statuses, &scope);
        assert!(matches!(statuses.last(), Some(SyncStatus::Failed { .. })));
        assert!(f.coordinator.cursor(&scope).await.unwrap().is_none());
        f.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn calls_after_shutdown_are_rejected() {
        let f = fixture(10).await;
        f.coordinator.shutdown().await;
        assert!(matches!(
            f.coordinator.sync(ScopeKey::conversation("!room"), None),
            Err(MirrorchatSDKError::ShuttingDown(_))
        ));
    }
}
