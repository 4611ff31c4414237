//! 推送规则（静音、推送评估）

use parking_lot::RwLock;
use std::collections::HashSet;

use crate::storage::entities::{Event, ScopeKey};

/// 远端推送规则对单个事件的评估结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushDecision {
    pub notify: bool,
    pub highlight: bool,
    pub sound: bool,
}

impl Default for PushDecision {
    fn default() -> Self {
        Self {
            notify: true,
            highlight: false,
            sound: true,
        }
    }
}

impl PushDecision {
    pub fn silent() -> Self {
        Self {
            notify: false,
            highlight: false,
            sound: false,
        }
    }
}

/// 推送/静音规则来源（外部提供）
pub trait PushRuleSource: Send + Sync {
    /// scope 是否被静音（静音优先于计数累积）
    fn is_muted(&self, scope: &ScopeKey) -> bool;

    fn evaluate(&self, event: &Event) -> PushDecision;
}

/// 内存中的静态规则：按 scope 静音，会话级静音覆盖其下所有线程
#[derive(Debug, Default)]
pub struct StaticPushRules {
    muted: RwLock<HashSet<ScopeKey>>,
}

impl StaticPushRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mute(&self, scope: ScopeKey) {
        self.muted.write().insert(scope);
    }

    pub fn unmute(&self, scope: &ScopeKey) -> bool {
        self.muted.write().remove(scope)
    }
}

impl PushRuleSource for StaticPushRules {
    fn is_muted(&self, scope: &ScopeKey) -> bool {
        let muted = self.muted.read();
        muted.contains(scope) || muted.contains(&ScopeKey::conversation(scope.conversation_id.clone()))
    }

    fn evaluate(&self, event: &Event) -> PushDecision {
        if self.is_muted(&event.scope()) {
            return PushDecision::silent();
        }
        PushDecision::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversation_mute_covers_threads() {
        let rules = StaticPushRules::new();
        rules.mute(ScopeKey::conversation("!room"));
        assert!(rules.is_muted(&ScopeKey::thread("!room", "$root")));
        assert!(!rules.is_muted(&ScopeKey::conversation("!other")));

        rules.unmute(&ScopeKey::conversation("!room"));
        assert!(!rules.is_muted(&ScopeKey::thread("!room", "$root")));
    }
}
