/// 历史同步模块
///
/// 职责：
/// - 从远端事件源分页拉取会话/线程历史
/// - 规范化、去重、解密后按远端顺序写入事件存储
/// - 维护每个 scope 的分页游标与追赶检查点
/// - 全局单队列串行调度，同一 scope 的请求合并
pub mod commit_applier;
pub mod coordinator;
pub mod cursor_store;
pub mod decrypt;
pub mod normalize;
pub mod source;

pub use commit_applier::{CommitApplier, PageCommit};
pub use coordinator::SyncCoordinator;
pub use cursor_store::{SyncCursor, SyncCursorStore, TimelineAnchor};
pub use decrypt::{decrypt_with_timeout, DecryptRetryPolicy, EventDecryptor};
pub use normalize::normalize_raw_event;
pub use source::{Direction, EventPage, RemoteEventSource};

use serde::{Deserialize, Serialize};

use crate::storage::entities::ScopeKey;

/// 同步模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    /// 全量回填：一直向前翻页直到远端没有更多历史
    Backfill,
    /// 追赶：从最新处翻页，越过上次记录的检查点即停止
    CatchUp,
}

/// 同步请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub scope: ScopeKey,
    /// 回填链提交到该事件后停止
    pub anchor_event: Option<String>,
    /// None 表示运行时根据游标决定
    pub mode: Option<SyncMode>,
}

impl SyncRequest {
    pub fn new(scope: ScopeKey) -> Self {
        Self {
            scope,
            anchor_event: None,
            mode: None,
        }
    }

    pub fn with_anchor(mut self, anchor_event: impl Into<String>) -> Self {
        self.anchor_event = Some(anchor_event.into());
        self
    }

    pub fn backfill(scope: ScopeKey) -> Self {
        Self {
            scope,
            anchor_event: None,
            mode: Some(SyncMode::Backfill),
        }
    }
}
