//! 通知计数模块
//!
//! - counter: 计数桶与祖先分组汇总、静音清除
//! - unread: 从事件流推导每个 scope 的未读/高亮
//! - dispatch: 逐事件的分发状态机与 should_notify 决策
//! - rules: 推送/静音规则

pub mod counter;
pub mod dispatch;
pub mod rules;
pub mod unread;

pub use counter::{BucketKey, Contribution, GroupingResolver, HierarchyMap, NotificationBucket, NotificationCounter};
pub use dispatch::{DispatchState, NotificationDispatcher, NotificationRequest, NotificationSink, NotifyContext};
pub use rules::{PushDecision, PushRuleSource, StaticPushRules};
pub use unread::UnreadTracker;
