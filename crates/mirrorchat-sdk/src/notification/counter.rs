//! 未读/高亮计数桶
//!
//! - 会话桶按增量汇总到所有祖先分组，并记录该会话为分组的贡献者
//! - 清除会话时从所有祖先中移除其贡献；没有贡献者的祖先桶直接删除
//! - 线程桶独立存在，不向上汇总
//! - 静音优先：被静音的 scope 丢弃增量并清除已有计数

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::events::{EventManager, NotificationChanged};
use crate::notification::rules::PushRuleSource;
use crate::storage::entities::ScopeKey;
use crate::storage::kv::KvStore;

const SNAPSHOT_KEY: &str = "notification_buckets";

/// 计数桶的键
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BucketKey {
    Scope(ScopeKey),
    Grouping(String),
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BucketKey::Scope(scope) => write!(f, "scope:{}", scope),
            BucketKey::Grouping(id) => write!(f, "group:{}", id),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contribution {
    pub total: u64,
    pub highlight: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationBucket {
    pub total: u64,
    pub highlight: u64,
    /// 分组桶：conversation_id -> 该会话的贡献
    pub contributors: BTreeMap<String, Contribution>,
}

/// 会话所属的分组（可多级）
pub trait GroupingResolver: Send + Sync {
    /// 所有祖先分组，由近到远，不含重复
    fn ancestors(&self, conversation_id: &str) -> Vec<String>;
}

/// 内存中的父子关系表；分组本身也可以有父分组
#[derive(Debug, Default)]
pub struct HierarchyMap {
    parents: RwLock<HashMap<String, Vec<String>>>,
}

impl HierarchyMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_parents(&self, id: impl Into<String>, parents: Vec<String>) {
        self.parents.write().insert(id.into(), parents);
    }
}

impl GroupingResolver for HierarchyMap {
    fn ancestors(&self, conversation_id: &str) -> Vec<String> {
        let parents = self.parents.read();
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        seen.insert(conversation_id.to_string());
        let mut frontier: Vec<String> = parents.get(conversation_id).cloned().unwrap_or_default();
        while !frontier.is_empty() {
            let mut next = Vec::new();
            for id in frontier {
                if seen.insert(id.clone()) {
                    if let Some(grand) = parents.get(&id) {
                        next.extend(grand.iter().cloned());
                    }
                    out.push(id);
                }
            }
            frontier = next;
        }
        out
    }
}

/// 计数器
pub struct NotificationCounter {
    buckets: Mutex<HashMap<BucketKey, NotificationBucket>>,
    grouping: Arc<dyn GroupingResolver>,
    rules: Arc<dyn PushRuleSource>,
    events: EventManager,
    kv: Option<KvStore>,
}

fn apply_delta(value: u64, delta: i64) -> u64 {
    (value as i64).saturating_add(delta).max(0) as u64
}

impl NotificationCounter {
    pub fn new(
        grouping: Arc<dyn GroupingResolver>,
        rules: Arc<dyn PushRuleSource>,
        events: EventManager,
        kv: Option<KvStore>,
    ) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            grouping,
            rules,
            events,
            kv,
        }
    }

    pub fn bucket(&self, key: &BucketKey) -> Option<NotificationBucket> {
        self.buckets.lock().get(key).cloned()
    }

    pub fn scope_bucket(&self, scope: &ScopeKey) -> Option<NotificationBucket> {
        self.bucket(&BucketKey::Scope(scope.clone()))
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().len()
    }

    /// 记录 scope 的最新总数。增量按上次记录计算，结果不会为负；
    /// 被静音的 scope 只会被清除。返回发生变化的桶。
    pub fn record(&self, scope: &ScopeKey, total: u64, highlight: u64) -> Vec<NotificationChanged> {
        if self.rules.is_muted(scope) {
            debug!("scope 已静音，丢弃计数并清除: scope={}", scope);
            return self.clear(scope);
        }
        if total == 0 && highlight == 0 {
            return self.clear(scope);
        }

        let own_key = BucketKey::Scope(scope.clone());
        let mut changes = Vec::new();
        {
            let mut buckets = self.buckets.lock();
            let own = buckets.entry(own_key.clone()).or_default();
            if own.total != total || own.highlight != highlight {
                own.total = total;
                own.highlight = highlight;
                changes.push(Self::changed(&own_key, own));
            }

            // 自身计数没变时也要对齐祖先：层级关系可能在两次记录之间变化
            if !scope.is_thread() {
                let contribution = Contribution { total, highlight };
                let ancestors: BTreeSet<String> =
                    self.grouping.ancestors(&scope.conversation_id).into_iter().collect();
                for ancestor in &ancestors {
                    let key = BucketKey::Grouping(ancestor.clone());
                    let bucket = buckets.entry(key.clone()).or_default();
                    let previous = bucket
                        .contributors
                        .insert(scope.conversation_id.clone(), contribution)
                        .unwrap_or_default();
                    if previous == contribution {
                        continue;
                    }
                    bucket.total = apply_delta(bucket.total, total as i64 - previous.total as i64);
                    bucket.highlight =
                        apply_delta(bucket.highlight, highlight as i64 - previous.highlight as i64);
                    changes.push(Self::changed(&key, bucket));
                }
                changes.extend(Self::detach_stale(&mut buckets, &scope.conversation_id, &ancestors));
            }
        }
        self.emit(&changes);
        changes
    }

    /// 从已不再是祖先的分组中移除会话的贡献
    fn detach_stale(
        buckets: &mut HashMap<BucketKey, NotificationBucket>,
        conversation_id: &str,
        ancestors: &BTreeSet<String>,
    ) -> Vec<NotificationChanged> {
        let stale: Vec<BucketKey> = buckets
            .iter()
            .filter(|(key, bucket)| match key {
                BucketKey::Grouping(id) => !ancestors.contains(id) && bucket.contributors.contains_key(conversation_id),
                BucketKey::Scope(_) => false,
            })
            .map(|(key, _)| key.clone())
            .collect();
        let mut changes = Vec::new();
        for key in stale {
            let Some(bucket) = buckets.get_mut(&key) else {
                continue;
            };
            let Some(previous) = bucket.contributors.remove(conversation_id) else {
                continue;
            };
            if bucket.contributors.is_empty() {
                buckets.remove(&key);
                changes.push(Self::removed(&key));
            } else {
                bucket.total = apply_delta(bucket.total, -(previous.total as i64));
                bucket.highlight = apply_delta(bucket.highlight, -(previous.highlight as i64));
                changes.push(Self::changed(&key, bucket));
            }
        }
        changes
    }

    /// 删除 scope 的桶，并从所有祖先中移除其贡献
    pub fn clear(&self, scope: &ScopeKey) -> Vec<NotificationChanged> {
        let own_key = BucketKey::Scope(scope.clone());
        let mut changes = Vec::new();
        {
            let mut buckets = self.buckets.lock();
            if buckets.remove(&own_key).is_some() {
                changes.push(Self::removed(&own_key));
            }
            if !scope.is_thread() {
                for ancestor in self.grouping.ancestors(&scope.conversation_id) {
                    let key = BucketKey::Grouping(ancestor);
                    let Some(bucket) = buckets.get_mut(&key) else {
                        continue;
                    };
                    let Some(previous) = bucket.contributors.remove(&scope.conversation_id) else {
                        continue;
                    };
                    if bucket.contributors.is_empty() {
                        buckets.remove(&key);
                        changes.push(Self::removed(&key));
                    } else {
                        bucket.total = apply_delta(bucket.total, -(previous.total as i64));
                        bucket.highlight = apply_delta(bucket.highlight, -(previous.highlight as i64));
                        changes.push(Self::changed(&key, bucket));
                    }
                }
            }
        }
        self.emit(&changes);
        changes
    }

    /// 静音规则变化后调用：已被静音的 scope 立即清除
    pub fn refresh_mute(&self, scope: &ScopeKey) -> Vec<NotificationChanged> {
        if self.rules.is_muted(scope) {
            return self.clear(scope);
        }
        Vec::new()
    }

    /// 清除会话及其所有线程的桶
    pub fn clear_conversation(&self, conversation_id: &str) -> Vec<NotificationChanged> {
        let scopes: Vec<ScopeKey> = self
            .buckets
            .lock()
            .keys()
            .filter_map(|key| match key {
                BucketKey::Scope(scope) if scope.conversation_id == conversation_id => Some(scope.clone()),
                _ => None,
            })
            .collect();
        let mut changes = self.clear(&ScopeKey::conversation(conversation_id));
        for scope in scopes.iter().filter(|s| s.is_thread()) {
            changes.extend(self.clear(scope));
        }
        changes
    }

    fn changed(key: &BucketKey, bucket: &NotificationBucket) -> NotificationChanged {
        NotificationChanged {
            key: key.to_string(),
            total: bucket.total,
            highlight: bucket.highlight,
            removed: false,
        }
    }

    fn removed(key: &BucketKey) -> NotificationChanged {
        NotificationChanged {
            key: key.to_string(),
            total: 0,
            highlight: 0,
            removed: true,
        }
    }

    fn emit(&self, changes: &[NotificationChanged]) {
        for change in changes {
            self.events.emit_notification_changed(change.clone());
        }
    }

    /// 把所有桶快照写入 KV
    pub async fn persist(&self) -> Result<()> {
        let Some(kv) = &self.kv else {
            return Ok(());
        };
        let snapshot: Vec<(BucketKey, NotificationBucket)> = self
            .buckets
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        kv.set(SNAPSHOT_KEY, &snapshot).await
    }

    /// 尽力持久化，失败只记日志
    pub async fn persist_best_effort(&self) {
        if let Err(e) = self.persist().await {
            warn!("计数快照持久化失败: {}", e);
        }
    }

    /// 从 KV 恢复快照，返回恢复的桶数
    pub async fn load(&self) -> Result<usize> {
        let Some(kv) = &self.kv else {
            return Ok(0);
        };
        let snapshot: Vec<(BucketKey, NotificationBucket)> =
            kv.get(SNAPSHOT_KEY).await?.unwrap_or_default();
        let count = snapshot.len();
        *self.buckets.lock() = snapshot.into_iter().collect();
        info!("计数快照已恢复: buckets={}", count);
        Ok(count)
    }
}
