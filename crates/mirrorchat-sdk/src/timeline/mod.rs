//! 时间线缓存模块
//!
//! - window: 单个 scope 的有界有序窗口
//! - edit_overlay: 编辑的最后写入者覆盖层
//! - reaction_aggregate: 带时间戳闩锁的反应聚合
//! - cache: 组合以上三者，消费有序变更通知

pub mod cache;
pub mod edit_overlay;
pub mod reaction_aggregate;
pub mod window;

pub use cache::{CacheFootprint, EvictCallback, EvictionNotice, TimelineCache};
pub use edit_overlay::{EditApply, EditOverlay, Reelection};
pub use reaction_aggregate::{ReactionAggregate, ReactionSummary};
pub use window::{InsertResult, InsertStatus, TimelineWindow};

use async_trait::async_trait;

use crate::error::Result;
use crate::storage::entities::Event;

/// 线程完整信息
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadInfo {
    pub root: Event,
    /// 本地用户是否参与过该线程
    pub participated: bool,
    pub reply_count: i64,
}

/// 线程信息拉取（外部提供）
#[async_trait]
pub trait ThreadFetcher: Send + Sync {
    async fn fetch_thread(&self, conversation_id: &str, root_id: &str) -> Result<ThreadInfo>;
}
