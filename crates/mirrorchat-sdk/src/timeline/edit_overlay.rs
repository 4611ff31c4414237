//! 编辑覆盖层
//!
//! 每个目标事件保留全部编辑，按 (ts, 到达顺序) 取最后写入者；
//! 获胜编辑被撤回时重新选举，没有剩余编辑则回退到原始内容。

use serde_json::Value;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq)]
pub struct EditEntry {
    pub edit_id: String,
    pub content: Value,
    pub timestamp: i64,
    seq: u64,
}

impl EditEntry {
    fn rank(&self) -> (i64, u64) {
        (self.timestamp, self.seq)
    }
}

/// 一次编辑操作后目标的显示内容
#[derive(Debug, Clone, PartialEq)]
pub enum EditApply {
    /// 新编辑获胜，显示内容变为该值
    Applied(Value),
    /// 已记录，但被更晚的编辑压过
    Superseded,
    /// 目标已撤回，编辑被丢弃
    Rejected,
}

/// 撤回获胜编辑后的重新选举结果
#[derive(Debug, Clone, PartialEq)]
pub enum Reelection {
    /// 剩余编辑中的新获胜者
    Winner(Value),
    /// 没有剩余编辑，显示原始内容
    Original,
}

#[derive(Debug, Default)]
pub struct EditOverlay {
    edits: HashMap<String, Vec<EditEntry>>,
    /// edit_id -> target_id
    index: HashMap<String, String>,
    redacted_targets: HashSet<String>,
    next_seq: u64,
}

impl EditOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn winner(&self, target_id: &str) -> Option<&EditEntry> {
        self.edits
            .get(target_id)?
            .iter()
            .max_by_key(|entry| entry.rank())
    }

    pub fn is_target_redacted(&self, target_id: &str) -> bool {
        self.redacted_targets.contains(target_id)
    }

    pub fn apply(&mut self, target_id: &str, edit_id: &str, content: Value, timestamp: i64) -> EditApply {
        if self.redacted_targets.contains(target_id) {
            return EditApply::Rejected;
        }
        if self.index.contains_key(edit_id) {
            return EditApply::Superseded;
        }
        self.next_seq += 1;
        let entry = EditEntry {
            edit_id: edit_id.to_string(),
            content,
            timestamp,
            seq: self.next_seq,
        };
        self.index.insert(edit_id.to_string(), target_id.to_string());
        let entries = self.edits.entry(target_id.to_string()).or_default();
        entries.push(entry);

        match self.winner(target_id) {
            Some(winner) if winner.edit_id == edit_id => EditApply::Applied(winner.content.clone()),
            _ => EditApply::Superseded,
        }
    }

    /// 撤回一个编辑。只有当被撤回的是当前获胜者时才返回 (target, 重新选举结果)
    pub fn redact_edit(&mut self, edit_id: &str) -> Option<(String, Reelection)> {
        let target_id = self.index.remove(edit_id)?;
        let was_winner = self
            .winner(&target_id)
            .map(|w| w.edit_id == edit_id)
            .unwrap_or(false);
        if let Some(entries) = self.edits.get_mut(&target_id) {
            entries.retain(|e| e.edit_id != edit_id);
            if entries.is_empty() {
                self.edits.remove(&target_id);
            }
        }
        if !was_winner {
            return None;
        }
        let reelection = match self.winner(&target_id) {
            Some(next) => Reelection::Winner(next.content.clone()),
            None => Reelection::Original,
        };
        Some((target_id, reelection))
    }

    /// 目标被撤回：丢弃它的全部编辑，此后的编辑一律拒绝
    pub fn mark_target_redacted(&mut self, target_id: &str) {
        self.invalidate(target_id);
        self.redacted_targets.insert(target_id.to_string());
    }

    /// 目标移出窗口时清理，撤回标记一并丢弃（重新入窗的事件自带 redacted 标志）
    pub fn invalidate(&mut self, target_id: &str) {
        if let Some(entries) = self.edits.remove(target_id) {
            for entry in entries {
                self.index.remove(&entry.edit_id);
            }
        }
        self.redacted_targets.remove(target_id);
    }

    /// (有编辑的目标数, 编辑总数, 撤回标记数)
    pub fn sizes(&self) -> (usize, usize, usize) {
        (self.edits.len(), self.index.len(), self.redacted_targets.len())
    }

    /// 本地回显被确认后，编辑改挂到正式 ID
    pub fn retarget(&mut self, old_id: &str, new_id: &str) {
        if let Some(entries) = self.edits.remove(old_id) {
            for entry in &entries {
                self.index.insert(entry.edit_id.clone(), new_id.to_string());
            }
            self.edits.entry(new_id.to_string()).or_default().extend(entries);
        }
    }

    pub fn clear(&mut self) {
        self.edits.clear();
        self.index.clear();
        self.redacted_targets.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn last_writer_wins_with_arrival_tiebreak() {
        let mut overlay = EditOverlay::new();
        assert_eq!(
            overlay.apply("$t", "$e1", json!({"body": "one"}), 10),
            EditApply::Applied(json!({"body": "one"}))
        );
        assert_eq!(overlay.apply("$t", "$e0", json!({"body": "zero"}), 5), EditApply::Superseded);
        assert_eq!(
            overlay.apply("$t", "$e2", json!({"body": "two"}), 10),
            EditApply::Applied(json!({"body": "two"}))
        );
        assert_eq!(overlay.winner("$t").unwrap().edit_id, "$e2");
    }

    #[test]
    fn redacting_winner_reelects_then_restores_original() {
        let mut overlay = EditOverlay::new();
        overlay.apply("$t", "$e1", json!({"body": "one"}), 1);
        overlay.apply("$t", "$e2", json!({"body": "two"}), 2);

        assert_eq!(overlay.redact_edit("$e1"), None);
        assert_eq!(overlay.redact_edit("$e2"), Some(("$t".to_string(), Reelection::Original)));

        overlay.apply("$t", "$e3", json!({"body": "three"}), 3);
        overlay.apply("$t", "$e4", json!({"body": "four"}), 4);
        assert_eq!(
            overlay.redact_edit("$e4"),
            Some(("$t".to_string(), Reelection::Winner(json!({"body": "three"}))))
        );
    }

    #[test]
    fn redacted_target_rejects_edits() {
        let mut overlay = EditOverlay::new();
        overlay.apply("$t", "$e1", json!({"body": "one"}), 1);
        overlay.mark_target_redacted("$t");
        assert!(overlay.winner("$t").is_none());
        assert_eq!(overlay.apply("$t", "$e2", json!({"body": "two"}), 2), EditApply::Rejected);
    }
}
