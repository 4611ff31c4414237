//! MirrorchatSDK - 显式构造、显式关闭的服务对象
//!
//! 初始化顺序：
//! 1. 存储层（DbActor + migrations + KV）
//! 2. 事件层（类型化广播 + 有序管线订阅）
//! 3. 同步层（去重 + 游标 + 协调器 worker）
//! 4. 时间线缓存、未读/计数/分发
//! 5. 管线任务：有序消费变更通知，依次驱动缓存和通知计数

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{MirrorchatSDKError, Result};
use crate::events::{
    ChangeNotification, CommitOrigin, EventAdded, EventManager, EventRedacted, NotificationChanged,
    SyncStatusChanged,
};
use crate::lifecycle::LifecycleManager;
use crate::notification::{
    BucketKey, GroupingResolver, HierarchyMap, NotificationBucket, NotificationCounter,
    NotificationDispatcher, NotificationSink, PushRuleSource, StaticPushRules, UnreadTracker,
};
use crate::storage::deduplication::DeduplicationManager;
use crate::storage::entities::{
    Event, EventQuery, PageResult, ScopeKey, SendStatus, LOCAL_TXN_PREFIX,
};
use crate::storage::{StorageManager, UpsertOutcome};
use crate::sync::{
    normalize_raw_event, CommitApplier, DecryptRetryPolicy, EventDecryptor, RemoteEventSource,
    SyncCoordinator, SyncCursor, SyncCursorStore, TimelineAnchor,
};
use crate::timeline::{EvictionNotice, ReactionSummary, ThreadFetcher, TimelineCache};

/// SDK 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorchatConfig {
    /// 数据根目录，用户数据位于 {data_dir}/users/{user_id}/
    pub data_dir: PathBuf,
    /// 本地用户
    pub user_id: String,
    /// 时间线窗口大小，同时是远端分页大小
    pub page_limit: u32,
    /// 翻页前等待写队列回落到的深度
    pub write_queue_depth: usize,
    /// 解密等待上限（秒）
    pub decrypt_timeout_secs: u64,
    /// 每个广播通道的容量
    pub event_buffer_size: usize,
    pub do_not_disturb: bool,
    pub stickers_enabled: bool,
}

impl Default for MirrorchatConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./mirrorchat_data"),
            user_id: String::new(),
            page_limit: 30,
            write_queue_depth: 64,
            decrypt_timeout_secs: 60,
            event_buffer_size: 1000,
            do_not_disturb: false,
            stickers_enabled: true,
        }
    }
}

impl MirrorchatConfig {
    pub fn builder() -> MirrorchatConfigBuilder {
        MirrorchatConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(MirrorchatSDKError::Config("数据目录不能为空".to_string()));
        }
        if self.user_id.trim().is_empty() {
            return Err(MirrorchatSDKError::Config("user_id 不能为空".to_string()));
        }
        if self.page_limit == 0 {
            return Err(MirrorchatSDKError::Config("page_limit 必须大于 0".to_string()));
        }
        if self.write_queue_depth == 0 {
            return Err(MirrorchatSDKError::Config("write_queue_depth 必须大于 0".to_string()));
        }
        if self.decrypt_timeout_secs == 0 {
            return Err(MirrorchatSDKError::Config("decrypt_timeout_secs 必须大于 0".to_string()));
        }
        if self.event_buffer_size == 0 {
            return Err(MirrorchatSDKError::Config("event_buffer_size 必须大于 0".to_string()));
        }
        Ok(())
    }
}

pub struct MirrorchatConfigBuilder {
    config: MirrorchatConfig,
}

impl Default for MirrorchatConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MirrorchatConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: MirrorchatConfig::default(),
        }
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = path.as_ref().to_path_buf();
        self
    }

    pub fn user_id<S: Into<String>>(mut self, user_id: S) -> Self {
        self.config.user_id = user_id.into();
        self
    }

    pub fn page_limit(mut self, page_limit: u32) -> Self {
        self.config.page_limit = page_limit;
        self
    }

    pub fn write_queue_depth(mut self, depth: usize) -> Self {
        self.config.write_queue_depth = depth;
        self
    }

    pub fn decrypt_timeout_secs(mut self, secs: u64) -> Self {
        self.config.decrypt_timeout_secs = secs;
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.config.event_buffer_size = size;
        self
    }

    pub fn do_not_disturb(mut self, enabled: bool) -> Self {
        self.config.do_not_disturb = enabled;
        self
    }

    pub fn stickers_enabled(mut self, enabled: bool) -> Self {
        self.config.stickers_enabled = enabled;
        self
    }

    pub fn build(self) -> MirrorchatConfig {
        self.config
    }
}

/// 外部协作者
#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn RemoteEventSource>,
    pub decryptor: Option<Arc<dyn EventDecryptor>>,
    pub thread_fetcher: Option<Arc<dyn ThreadFetcher>>,
    pub push_rules: Arc<dyn PushRuleSource>,
    pub grouping: Arc<dyn GroupingResolver>,
    pub sink: Option<Arc<dyn NotificationSink>>,
}

impl Collaborators {
    /// 只有远端事件源，其余使用内存默认实现
    pub fn new(source: Arc<dyn RemoteEventSource>) -> Self {
        Self {
            source,
            decryptor: None,
            thread_fetcher: None,
            push_rules: Arc::new(StaticPushRules::new()),
            grouping: Arc::new(HierarchyMap::new()),
            sink: None,
        }
    }

    pub fn with_decryptor(mut self, decryptor: Arc<dyn EventDecryptor>) -> Self {
        self.decryptor = Some(decryptor);
        self
    }

    pub fn with_thread_fetcher(mut self, fetcher: Arc<dyn ThreadFetcher>) -> Self {
        self.thread_fetcher = Some(fetcher);
        self
    }

    pub fn with_push_rules(mut self, rules: Arc<dyn PushRuleSource>) -> Self {
        self.push_rules = rules;
        self
    }

    pub fn with_grouping(mut self, grouping: Arc<dyn GroupingResolver>) -> Self {
        self.grouping = grouping;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = Some(sink);
        self
    }
}

/// 管线持有的组件
#[derive(Clone)]
struct Pipeline {
    timeline: TimelineCache,
    unread: Arc<UnreadTracker>,
    counter: Arc<NotificationCounter>,
    dispatcher: Arc<NotificationDispatcher>,
    push_rules: Arc<dyn PushRuleSource>,
}

impl Pipeline {
    async fn handle(&self, notification: ChangeNotification) {
        self.timeline.apply(&notification).await;
        match notification {
            ChangeNotification::EventAdded(added) => self.on_added(&added).await,
            ChangeNotification::EventRedacted(redacted) => self.on_redacted(&redacted).await,
            ChangeNotification::SyncStatusChanged(_) | ChangeNotification::NotificationChanged(_) => {}
        }
    }

    async fn on_added(&self, added: &EventAdded) {
        let push = self.push_rules.evaluate(&added.event);
        if let Some((scope, total, highlight)) = self.unread.on_event_added(&added.event, &push) {
            if !self.counter.record(&scope, total, highlight).is_empty() {
                self.counter.persist_best_effort().await;
            }
        }
        // 只有实时推送的事件可能触发通知，历史回填只推进状态机
        if added.origin == CommitOrigin::Live {
            let highlight = self.unread.is_highlight(&added.event, &push);
            self.dispatcher.handle_added(added, &push, highlight).await;
        } else {
            self.dispatcher.observe_added(added);
        }
    }

    async fn on_redacted(&self, redacted: &EventRedacted) {
        self.dispatcher.observe_redacted(&redacted.event.id);
        if let Some((scope, total, highlight)) = self.unread.on_redacted(&redacted.event) {
            if !self.counter.record(&scope, total, highlight).is_empty() {
                self.counter.persist_best_effort().await;
            }
        }
    }

    async fn run(self, mut feed: mpsc::UnboundedReceiver<ChangeNotification>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                notification = feed.recv() => match notification {
                    Some(notification) => self.handle(notification).await,
                    None => break,
                },
                _ = cancel.cancelled() => {
                    // 关闭前处理完已排队的通知
                    while let Ok(notification) = feed.try_recv() {
                        self.handle(notification).await;
                    }
                    break;
                }
            }
        }
        debug!("变更通知管线已退出");
    }
}

/// MirrorchatSDK 主对象
pub struct MirrorchatSDK {
    config: MirrorchatConfig,
    storage: StorageManager,
    events: EventManager,
    cursors: SyncCursorStore,
    coordinator: SyncCoordinator,
    pipeline: Pipeline,
    lifecycle: tokio::sync::RwLock<LifecycleManager>,
    pipeline_cancel: CancellationToken,
    pipeline_task: Mutex<Option<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl MirrorchatSDK {
    /// 初始化 SDK
    pub async fn initialize(config: MirrorchatConfig, collaborators: Collaborators) -> Result<Arc<Self>> {
        info!("正在初始化 MirrorchatSDK...");
        config.validate()?;

        // === 第1层：存储 ===
        let events = EventManager::new(config.event_buffer_size);
        let storage = StorageManager::open(&config.data_dir, &config.user_id, events.clone()).await?;
        match storage.schema_version().await? {
            Some(version) => info!("数据库 schema 版本: {}", version),
            None => warn!("数据库 schema 版本未知"),
        }

        // === 第2层：有序管线订阅（先于任何写入） ===
        let feed = events.subscribe_ordered();

        // === 第3层：同步 ===
        let cursors = SyncCursorStore::new(storage.kv().clone());
        let applier = CommitApplier::new(
            storage.clone(),
            DeduplicationManager::new(),
            collaborators.decryptor.clone(),
            DecryptRetryPolicy::with_timeout(Duration::from_secs(config.decrypt_timeout_secs)),
        );

        // === 第4层：缓存与通知 ===
        let timeline = TimelineCache::new(
            config.page_limit as usize,
            &config.user_id,
            collaborators.thread_fetcher.clone(),
        );
        let anchor_store = cursors.clone();
        timeline.on_evict(Arc::new(move |notice: &EvictionNotice| {
            let Some(oldest) = notice.oldest_kept.clone() else {
                return;
            };
            let store = anchor_store.clone();
            let scope = notice.scope.clone();
            tokio::spawn(async move {
                let anchor = TimelineAnchor {
                    event_id: oldest.id,
                    timestamp: oldest.timestamp,
                };
                if let Err(e) = store.set_anchor(&scope, &anchor).await {
                    warn!("时间线锚点持久化失败: scope={}, error={}", scope, e);
                }
            });
        }));

        let counter = Arc::new(NotificationCounter::new(
            collaborators.grouping.clone(),
            collaborators.push_rules.clone(),
            events.clone(),
            Some(storage.kv().clone()),
        ));
        if let Err(e) = counter.load().await {
            warn!("计数快照恢复失败，从空状态开始: {}", e);
        }
        let unread = Arc::new(UnreadTracker::new(&config.user_id)?);
        let dispatcher = Arc::new(NotificationDispatcher::new(
            &config.user_id,
            collaborators.sink.clone(),
            config.do_not_disturb,
            config.stickers_enabled,
        ));
        let pipeline = Pipeline {
            timeline,
            unread,
            counter,
            dispatcher,
            push_rules: collaborators.push_rules.clone(),
        };

        // === 第5层：任务 ===
        let pipeline_cancel = CancellationToken::new();
        let pipeline_task = tokio::spawn(pipeline.clone().run(feed, pipeline_cancel.clone()));
        let coordinator = SyncCoordinator::start(
            collaborators.source.clone(),
            applier,
            cursors.clone(),
            storage.clone(),
            events.clone(),
            config.page_limit,
            config.write_queue_depth,
        );

        let mut lifecycle = LifecycleManager::new();
        lifecycle.register_hook(Arc::new(coordinator.clone()));

        info!("✅ MirrorchatSDK 初始化完成: user_id={}", config.user_id);
        Ok(Arc::new(Self {
            config,
            storage,
            events,
            cursors,
            coordinator,
            pipeline,
            lifecycle: tokio::sync::RwLock::new(lifecycle),
            pipeline_cancel,
            pipeline_task: Mutex::new(Some(pipeline_task)),
            shutting_down: AtomicBool::new(false),
        }))
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(MirrorchatSDKError::ShuttingDown("SDK 已关闭".to_string()));
        }
        Ok(())
    }

    pub fn config(&self) -> &MirrorchatConfig {
        &self.config
    }

    pub fn storage(&self) -> &StorageManager {
        &self.storage
    }

    pub fn coordinator(&self) -> &SyncCoordinator {
        &self.coordinator
    }

    pub fn timeline_cache(&self) -> &TimelineCache {
        &self.pipeline.timeline
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    // ========== 同步 ==========

    /// 为会话或线程排入同步请求
    pub fn sync(&self, conversation_id: &str, thread_id: Option<&str>, anchor_event: Option<&str>) -> Result<()> {
        self.ensure_running()?;
        let scope = match thread_id {
            Some(thread_id) => ScopeKey::thread(conversation_id, thread_id),
            None => ScopeKey::conversation(conversation_id),
        };
        self.coordinator.sync(scope, anchor_event.map(String::from))
    }

    /// 等待同步队列清空
    pub async fn wait_sync_idle(&self) {
        self.coordinator.wait_idle().await
    }

    pub async fn cursor(&self, scope: &ScopeKey) -> Result<Option<SyncCursor>> {
        self.cursors.get(scope).await
    }

    pub async fn timeline_anchor(&self, scope: &ScopeKey) -> Result<Option<TimelineAnchor>> {
        self.cursors.get_anchor(scope).await
    }

    /// 实时推送的单条原始事件
    pub async fn receive_live(
        &self,
        conversation_id: &str,
        thread_id: Option<&str>,
        raw: &Value,
    ) -> Result<Option<UpsertOutcome>> {
        self.ensure_running()?;
        let (event, problem) = normalize_raw_event(conversation_id, thread_id, raw);
        if let Some(problem) = problem {
            debug!("实时事件结构不完整，仍然写入: {}", problem);
        }
        self.coordinator.commit_live(event).await
    }

    // ========== 本地发送 ==========

    /// 乐观写入一条本地事件，返回带 `~` 事务 ID 的事件
    pub async fn send_local_echo(
        &self,
        conversation_id: &str,
        thread_id: Option<&str>,
        event_type: &str,
        content: Value,
    ) -> Result<Event> {
        self.ensure_running()?;
        let txn = format!("{}{}", LOCAL_TXN_PREFIX, uuid::Uuid::new_v4().simple());
        let mut event = Event::new(
            txn.clone(),
            event_type,
            self.config.user_id.clone(),
            conversation_id,
            content,
            chrono::Utc::now().timestamp_millis(),
        )
        .with_transaction_id(txn)
        .with_send_status(SendStatus::Sending);
        if let Some(thread_id) = thread_id {
            event = event.with_thread(thread_id);
        }
        self.coordinator.commit_local_echo(event.clone()).await?;
        Ok(event)
    }

    pub async fn cancel_local_echo(&self, transaction_id: &str) -> Result<Option<Event>> {
        self.ensure_running()?;
        let cancelled = self.coordinator.cancel_local_echo(transaction_id).await?;
        if cancelled.is_some() {
            self.pipeline.timeline.delete(transaction_id);
        }
        Ok(cancelled)
    }

    /// 清空会话的本地历史：存储、游标、缓存和计数一并清除
    pub async fn purge_conversation(&self, conversation_id: &str) -> Result<usize> {
        self.ensure_running()?;
        self.coordinator.reset_conversation(conversation_id).await?;
        let removed = self.storage.purge_conversation(conversation_id).await?;
        self.pipeline.timeline.clear_conversation(conversation_id);
        self.pipeline.unread.forget_conversation(conversation_id);
        self.pipeline.dispatcher.forget_conversation(conversation_id);
        self.pipeline.counter.clear_conversation(conversation_id);
        self.pipeline.counter.persist_best_effort().await;
        info!("会话已清空: conversation_id={}, removed={}", conversation_id, removed);
        Ok(removed)
    }

    // ========== 查询 ==========

    pub async fn query(&self, query: EventQuery, page: u32, limit: u32) -> Result<PageResult<Event>> {
        self.ensure_running()?;
        self.storage.query(query, page, limit).await
    }

    pub async fn get_event(&self, event_id: &str) -> Result<Option<Event>> {
        self.ensure_running()?;
        self.storage.get_event(event_id).await
    }

    /// 当前时间线窗口快照（按时间升序）
    pub fn timeline(&self, scope: &ScopeKey) -> Vec<Event> {
        self.pipeline.timeline.events(scope)
    }

    pub fn reactions(&self, target_id: &str) -> Vec<ReactionSummary> {
        self.pipeline.timeline.reactions(target_id)
    }

    // ========== 通知 ==========

    pub fn notification_bucket(&self, key: &BucketKey) -> Option<NotificationBucket> {
        self.pipeline.counter.bucket(key)
    }

    pub fn set_focus(&self, scope: Option<ScopeKey>) {
        self.pipeline.dispatcher.set_focus(scope);
    }

    pub fn set_do_not_disturb(&self, enabled: bool) {
        self.pipeline.dispatcher.set_do_not_disturb(enabled);
    }

    /// 静音规则变化后调用
    pub async fn refresh_mute(&self, scope: &ScopeKey) {
        if !self.pipeline.counter.refresh_mute(scope).is_empty() {
            self.pipeline.counter.persist_best_effort().await;
        }
    }

    // ========== 订阅 ==========

    pub fn subscribe_event_added(&self) -> broadcast::Receiver<EventAdded> {
        self.events.subscribe_event_added()
    }

    pub fn subscribe_event_redacted(&self) -> broadcast::Receiver<EventRedacted> {
        self.events.subscribe_event_redacted()
    }

    pub fn subscribe_notification_changed(&self) -> broadcast::Receiver<NotificationChanged> {
        self.events.subscribe_notification_changed()
    }

    pub fn subscribe_sync_status(&self) -> broadcast::Receiver<SyncStatusChanged> {
        self.events.subscribe_sync_status()
    }

    // ========== 生命周期 ==========

    pub async fn on_background(&self) -> Result<()> {
        self.ensure_running()?;
        self.lifecycle.read().await.notify_background().await
    }

    pub async fn on_foreground(&self) -> Result<()> {
        self.ensure_running()?;
        self.lifecycle.read().await.notify_foreground().await
    }

    /// 关闭 SDK：停止同步 worker、处理完排队的通知、持久化计数、关闭存储
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Err(MirrorchatSDKError::ShuttingDown("SDK 已关闭".to_string()));
        }
        info!("正在关闭 MirrorchatSDK...");

        self.coordinator.shutdown().await;

        self.pipeline_cancel.cancel();
        let task = self.pipeline_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("变更通知管线退出异常: {}", e);
            }
        }

        self.pipeline.counter.persist_best_effort().await;
        self.storage.shutdown().await?;
        info!("MirrorchatSDK 关闭完成");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::entities::event_types;
    use crate::sync::{Direction, EventPage};
    use async_trait::async_trait;
    use serde_json::json;
    use tempfile::TempDir;

    /// 按时间升序保存的单会话历史
    #[derive(Default)]
    struct ScriptedSource {
        history: Mutex<Vec<Value>>,
    }

    impl ScriptedSource {
        fn push(&self, event: Value) {
            self.history.lock().push(event);
        }
    }

    #[async_trait]
    impl RemoteEventSource for ScriptedSource {
        async fn fetch_events(
            &self,
            _conversation_id: &str,
            _thread_id: Option<&str>,
            _direction: Direction,
            limit: u32,
            from_token: Option<&str>,
        ) -> Result<EventPage> {
            let history = self.history.lock();
            let end = from_token
                .and_then(|t| t.parse::<usize>().ok())
                .unwrap_or(history.len());
            let start = end.saturating_sub(limit as usize);
            Ok(EventPage {
                events: history[start..end].iter().rev().cloned().collect(),
                next_token: (start > 0).then(|| start.to_string()),
                prev_token: None,
            })
        }
    }

    fn raw_message(id: &str, sender: &str, body: &str, ts: i64) -> Value {
        json!({
            "event_id": id,
            "type": "m.room.message",
            "sender": sender,
            "origin_server_ts": ts,
            "content": {"msgtype": "m.text", "body": body}
        })
    }

    async fn eventually<F: Fn() -> bool>(check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    async fn sdk_with(dir: &TempDir, page_limit: u32, collaborators: Collaborators) -> Arc<MirrorchatSDK> {
        let config = MirrorchatConfig::builder()
            .data_dir(dir.path())
            .user_id("@me:hs")
            .page_limit(page_limit)
            .build();
        MirrorchatSDK::initialize(config, collaborators).await.unwrap()
    }

    #[test]
    fn config_validation() {
        assert!(MirrorchatConfig::default().validate().is_err());
        let config = MirrorchatConfig::builder().user_id("@me:hs").build();
        assert!(config.validate().is_ok());
        assert_eq!(config.page_limit, 30);
        assert!(MirrorchatConfig::builder().user_id("@me:hs").page_limit(0).build().validate().is_err());
    }

    #[tokio::test]
    async fn backfill_fills_window_with_newest_events() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(ScriptedSource::default());
        for ts in 1..=50 {
            source.push(raw_message(&format!("$e{:02}", ts), "@bob:hs", "hi", ts));
        }
        let sdk = sdk_with(&dir, 20, Collaborators::new(source)).await;
        let scope = ScopeKey::conversation("!room");

        sdk.sync("!room", None, None).unwrap();
        sdk.wait_sync_idle().await;
        let expected: Vec<i64> = (31..=50).collect();
        eventually(|| {
            sdk.timeline(&scope).iter().map(|e| e.timestamp).collect::<Vec<_>>() == expected
        })
        .await;

        let cursor = sdk.cursor(&scope).await.unwrap().unwrap();
        assert_eq!(cursor.last_event_id.as_deref(), Some("$e50"));
        assert!(cursor.is_complete);
        sdk.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn local_echo_is_replaced_by_confirmation() {
        let dir = TempDir::new().unwrap();
        let sdk = sdk_with(&dir, 20, Collaborators::new(Arc::new(ScriptedSource::default()))).await;
        let scope = ScopeKey::conversation("!room");

        let echo = sdk
            .send_local_echo("!room", None, event_types::MESSAGE, json!({"body": "hello"}))
            .await
            .unwrap();
        assert!(echo.is_local_echo());
        eventually(|| sdk.timeline(&scope).len() == 1).await;

        let mut confirmation = raw_message("$abc", "@me:hs", "hello", echo.timestamp + 1);
        confirmation["unsigned"] = json!({"transaction_id": echo.id});
        sdk.receive_live("!room", None, &confirmation).await.unwrap();

        eventually(|| {
            let ids: Vec<String> = sdk.timeline(&scope).into_iter().map(|e| e.id).collect();
            ids == vec!["$abc".to_string()]
        })
        .await;
        assert!(sdk.get_event(&echo.id).await.unwrap().is_none());
        assert_eq!(sdk.storage().count(EventQuery::conversation("!room")).await.unwrap(), 1);
        sdk.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn mute_removes_bucket_and_rollup() {
        let dir = TempDir::new().unwrap();
        let rules = Arc::new(StaticPushRules::new());
        let groups = Arc::new(HierarchyMap::new());
        groups.set_parents("!c", vec!["space".into()]);
        let collaborators = Collaborators::new(Arc::new(ScriptedSource::default()))
            .with_push_rules(rules.clone())
            .with_grouping(groups);
        let sdk = sdk_with(&dir, 20, collaborators).await;
        let scope = ScopeKey::conversation("!c");
        let conversation = BucketKey::Scope(scope.clone());
        let space = BucketKey::Grouping("space".into());

        for ts in 1..=5 {
            let body = if ts <= 2 { "ping @me:hs" } else { "hello" };
            sdk.receive_live("!c", None, &raw_message(&format!("$m{}", ts), "@bob:hs", body, ts))
                .await
                .unwrap();
        }
        eventually(|| {
            sdk.notification_bucket(&conversation)
                .map(|b| (b.total, b.highlight))
                == Some((5, 2))
        })
        .await;
        assert_eq!(sdk.notification_bucket(&space).unwrap().total, 5);

        rules.mute(scope.clone());
        sdk.refresh_mute(&scope).await;
        assert!(sdk.notification_bucket(&conversation).is_none());
        assert!(sdk.notification_bucket(&space).is_none());
        sdk.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn reactions_rebuild_after_purge_and_resync() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(ScriptedSource::default());
        source.push(raw_message("$t", "@bob:hs", "hi", 1));
        source.push(json!({
            "event_id": "$r",
            "type": "m.reaction",
            "sender": "@bob:hs",
            "origin_server_ts": 2,
            "content": {"m.relates_to": {"rel_type": "m.annotation", "event_id": "$t", "key": "👍"}}
        }));
        let sdk = sdk_with(&dir, 20, Collaborators::new(source)).await;
        let scope = ScopeKey::conversation("!room");

        sdk.sync("!room", None, None).unwrap();
        sdk.wait_sync_idle().await;
        eventually(|| sdk.reactions("$t").first().map(|r| r.count) == Some(1)).await;

        sdk.purge_conversation("!room").await.unwrap();
        assert!(sdk.reactions("$t").is_empty());
        assert!(sdk.timeline(&scope).is_empty());
        assert!(sdk.cursor(&scope).await.unwrap().is_none());

        sdk.sync("!room", None, None).unwrap();
        sdk.wait_sync_idle().await;
        eventually(|| sdk.reactions("$t").first().map(|r| r.count) == Some(1)).await;
        assert_eq!(sdk.timeline(&scope).len(), 1);
        sdk.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn calls_after_shutdown_fail() {
        let dir = TempDir::new().unwrap();
        let sdk = sdk_with(&dir, 20, Collaborators::new(Arc::new(ScriptedSource::default()))).await;
        sdk.shutdown().await.unwrap();
        assert!(matches!(sdk.sync("!room", None, None), Err(MirrorchatSDKError::ShuttingDown(_))));
        assert!(matches!(sdk.shutdown().await, Err(MirrorchatSDKError::ShuttingDown(_))));
    }
}
