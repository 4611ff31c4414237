//! 反应聚合
//!
//! 每个 (target, reaction_event_id) 记录一个单调时间戳闩锁：
//! 比闩锁旧的添加或撤回直接忽略，重复或乱序到达不能覆盖更新的状态。
//! 闩锁和聚合一起挂在目标上，目标被 invalidate 时整体丢弃。

use std::collections::{BTreeMap, HashMap};

/// 某个目标事件上同一个 key 的聚合
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionSummary {
    pub key: String,
    /// 不同用户数
    pub count: usize,
    pub shortcode: Option<String>,
    /// 按首次到达顺序，不重复
    pub users: Vec<String>,
    /// 本地用户是否在其中
    pub is_active: bool,
}

#[derive(Debug, Clone)]
struct ReactionEntry {
    target_id: String,
    key: String,
    sender: String,
    shortcode: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LatchState {
    Active(i64),
    Retracted(i64),
}

impl LatchState {
    fn timestamp(&self) -> i64 {
        match self {
            LatchState::Active(ts) | LatchState::Retracted(ts) => *ts,
        }
    }
}

#[derive(Debug, Default)]
pub struct ReactionAggregate {
    local_user: String,
    /// target_id -> reaction_id -> 闩锁
    latch: HashMap<String, HashMap<String, LatchState>>,
    entries: HashMap<String, ReactionEntry>,
    /// 只知道反应 ID、还不知道目标的撤回
    orphan_retractions: HashMap<String, i64>,
    /// target_id -> 按到达顺序的 reaction_id
    by_target: HashMap<String, Vec<String>>,
}

impl ReactionAggregate {
    pub fn new(local_user: impl Into<String>) -> Self {
        Self {
            local_user: local_user.into(),
            ..Default::default()
        }
    }

    /// 记录一个反应；被闩锁挡住或已存在时返回 false
    pub fn add(
        &mut self,
        reaction_id: &str,
        target_id: &str,
        key: &str,
        shortcode: Option<&str>,
        sender: &str,
        timestamp: i64,
    ) -> bool {
        if self.orphan_retractions.contains_key(reaction_id) {
            return false;
        }
        if let Some(state) = self.latch.get(target_id).and_then(|l| l.get(reaction_id)) {
            if matches!(state, LatchState::Retracted(_)) || state.timestamp() >= timestamp {
                return false;
            }
        }
        if self.entries.contains_key(reaction_id) {
            return false;
        }
        self.latch
            .entry(target_id.to_string())
            .or_default()
            .insert(reaction_id.to_string(), LatchState::Active(timestamp));
        self.entries.insert(
            reaction_id.to_string(),
            ReactionEntry {
                target_id: target_id.to_string(),
                key: key.to_string(),
                sender: sender.to_string(),
                shortcode: shortcode.map(String::from),
            },
        );
        self.by_target
            .entry(target_id.to_string())
            .or_default()
            .push(reaction_id.to_string());
        true
    }

    /// 撤回一个反应（反应事件被 redact）；返回受影响的目标
    pub fn retract(&mut self, reaction_id: &str, timestamp: i64) -> Option<String> {
        let Some(entry) = self.entries.get(reaction_id).cloned() else {
            let ts = self.orphan_retractions.entry(reaction_id.to_string()).or_insert(timestamp);
            *ts = (*ts).max(timestamp);
            return None;
        };
        let latch = self.latch.entry(entry.target_id.clone()).or_default();
        if let Some(state) = latch.get(reaction_id) {
            if state.timestamp() > timestamp {
                return None;
            }
        }
        latch.insert(reaction_id.to_string(), LatchState::Retracted(timestamp));
        self.entries.remove(reaction_id);

        if let Some(ids) = self.by_target.get_mut(&entry.target_id) {
            ids.retain(|id| id != reaction_id);
            if ids.is_empty() {
                self.by_target.remove(&entry.target_id);
            }
        }
        Some(entry.target_id)
    }

    pub fn summary(&self, target_id: &str) -> Vec<ReactionSummary> {
        let Some(ids) = self.by_target.get(target_id) else {
            return Vec::new();
        };
        let mut by_key: BTreeMap<&str, ReactionSummary> = BTreeMap::new();
        for entry in ids.iter().filter_map(|id| self.entries.get(id)) {
            let summary = by_key.entry(entry.key.as_str()).or_insert_with(|| ReactionSummary {
                key: entry.key.clone(),
                count: 0,
                shortcode: None,
                users: Vec::new(),
                is_active: false,
            });
            if summary.shortcode.is_none() {
                summary.shortcode = entry.shortcode.clone();
            }
            if !summary.users.contains(&entry.sender) {
                summary.users.push(entry.sender.clone());
                summary.count += 1;
                summary.is_active |= entry.sender == self.local_user;
            }
        }
        by_key.into_values().collect()
    }

    /// 丢弃与该 ID 相关的全部状态：作为目标的聚合与闩锁，以及作为反应的孤立撤回
    pub fn invalidate(&mut self, id: &str) {
        if let Some(ids) = self.by_target.remove(id) {
            for reaction_id in ids {
                self.entries.remove(&reaction_id);
            }
        }
        self.latch.remove(id);
        self.orphan_retractions.remove(id);
    }

    /// (闩锁目标数, 有效反应数, 孤立撤回数)
    pub fn sizes(&self) -> (usize, usize, usize) {
        (self.latch.len(), self.entries.len(), self.orphan_retractions.len())
    }

    pub fn clear(&mut self) {
        self.latch.clear();
        self.entries.clear();
        self.orphan_retractions.clear();
        self.by_target.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregates_by_key_and_tracks_local_user() {
        let mut agg = ReactionAggregate::new("@me:hs");
        assert!(agg.add("$r1", "$t", "👍", None, "@bob:hs", 1));
        assert!(agg.add("$r2", "$t", "👍", Some(":thumbsup:"), "@me:hs", 2));
        assert!(agg.add("$r3", "$t", "🎉", None, "@bob:hs", 3));

        let summary = agg.summary("$t");
        assert_eq!(summary.len(), 2);
        let thumbs = summary.iter().find(|s| s.key == "👍").unwrap();
        assert_eq!(thumbs.count, 2);
        assert!(thumbs.is_active);
        assert_eq!(thumbs.shortcode.as_deref(), Some(":thumbsup:"));
        assert_eq!(thumbs.users, vec!["@bob:hs".to_string(), "@me:hs".to_string()]);
    }

    #[test]
    fn duplicate_add_is_ignored() {
        let mut agg = ReactionAggregate::new("@me:hs");
        assert!(agg.add("$r1", "$t", "👍", None, "@bob:hs", 5));
        assert!(!agg.add("$r1", "$t", "👍", None, "@bob:hs", 5));
        assert_eq!(agg.summary("$t")[0].count, 1);
    }

    #[test]
    fn same_sender_counts_once_per_key() {
        let mut agg = ReactionAggregate::new("@me:hs");
        agg.add("$r1", "$t", "👍", None, "@bob:hs", 1);
        agg.add("$r2", "$t", "👍", None, "@bob:hs", 2);
        let thumbs = agg.summary("$t").remove(0);
        assert_eq!(thumbs.count, 1);
        assert_eq!(thumbs.users, vec!["@bob:hs".to_string()]);

        // 撤回其中一个，另一个仍然有效
        agg.retract("$r1", 3);
        assert_eq!(agg.summary("$t")[0].count, 1);
        agg.retract("$r2", 4);
        assert!(agg.summary("$t").is_empty());
    }

    #[test]
    fn stale_replay_cannot_resurrect_retracted_reaction() {
        let mut agg = ReactionAggregate::new("@me:hs");
        agg.add("$r1", "$t", "👍", None, "@me:hs", 5);
        assert_eq!(agg.retract("$r1", 9), Some("$t".to_string()));
        assert!(agg.summary("$t").is_empty());
        assert!(!agg.add("$r1", "$t", "👍", None, "@me:hs", 5));
        assert!(agg.summary("$t").is_empty());
    }

    #[test]
    fn retraction_before_reaction_is_remembered() {
        let mut agg = ReactionAggregate::new("@me:hs");
        assert_eq!(agg.retract("$r1", 9), None);
        assert!(!agg.add("$r1", "$t", "👍", None, "@bob:hs", 5));
        assert!(agg.summary("$t").is_empty());
    }

    #[test]
    fn invalidated_target_accepts_reactions_again() {
        let mut agg = ReactionAggregate::new("@me:hs");
        agg.add("$r1", "$t", "👍", None, "@bob:hs", 5);
        agg.invalidate("$t");
        assert!(agg.summary("$t").is_empty());
        assert_eq!(agg.sizes(), (0, 0, 0));

        assert!(agg.add("$r1", "$t", "👍", None, "@bob:hs", 5));
        assert_eq!(agg.summary("$t")[0].count, 1);
    }
}
