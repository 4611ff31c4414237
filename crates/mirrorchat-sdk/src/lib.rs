//! Mirrorchat SDK - 本地事件镜像与同步引擎
//!
//! 把远端会话事件流镜像到本地 SQLite，并在其上维护：
//! - 🗄️ 事件存储：幂等 upsert、撤回墓碑、编辑/表情/线程关系表
//! - 🔄 同步协调：按 scope 串行的回填与追赶，持久化游标，可取消
//! - 🪟 时间线缓存：固定窗口、编辑覆盖层、表情聚合、线程根预取
//! - 🔔 通知计数：未读/高亮、分组汇总、静音清除、逐事件分发状态机
//! - ⚙️ 事件系统：类型化广播 + 保序的变更通知管线
//! - 🧵 生命周期：前后台切换时暂停/恢复同步
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mirrorchat_sdk::{Collaborators, MirrorchatConfig, MirrorchatSDK, RemoteEventSource};
//!
//! async fn run(source: Arc<dyn RemoteEventSource>) -> mirrorchat_sdk::Result<()> {
//!     let config = MirrorchatConfig::builder()
//!         .data_dir("/path/to/data")
//!         .user_id("@alice:example.org")
//!         .page_limit(30)
//!         .build();
//!
//!     let sdk = MirrorchatSDK::initialize(config, Collaborators::new(source)).await?;
//!
//!     // 排入同步并等待完成
//!     sdk.sync("!room:example.org", None, None)?;
//!     sdk.wait_sync_idle().await;
//!
//!     for event in sdk.timeline(&mirrorchat_sdk::ScopeKey::conversation("!room:example.org")) {
//!         println!("{} {}: {:?}", event.timestamp, event.sender, event.body());
//!     }
//!
//!     sdk.shutdown().await
//! }
//! ```

// 导出核心模块
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod notification;
pub mod sdk;
pub mod storage;
pub mod sync;
pub mod timeline;
pub mod version;

// 重新导出核心类型，方便使用
pub use error::{MirrorchatSDKError, Result};
pub use events::{
    ChangeNotification, CommitOrigin, EventAdded, EventManager, EventRedacted, NotificationChanged,
    SyncStatus, SyncStatusChanged,
};
pub use lifecycle::{LifecycleHook, LifecycleManager};
pub use notification::{
    BucketKey, GroupingResolver, HierarchyMap, NotificationBucket, NotificationRequest, NotificationSink,
    PushDecision, PushRuleSource, StaticPushRules,
};
pub use sdk::{Collaborators, MirrorchatConfig, MirrorchatConfigBuilder, MirrorchatSDK};
pub use storage::entities::{Event, EventKind, EventQuery, PageResult, ScopeKey, SendStatus};
pub use storage::StorageManager;
pub use sync::{
    Direction, EventDecryptor, EventPage, RemoteEventSource, SyncCoordinator, SyncCursor, SyncMode, SyncRequest,
};
pub use timeline::{ReactionSummary, ThreadFetcher, ThreadInfo, TimelineCache};
pub use version::{SDK_DB_VERSION, SDK_VERSION};
