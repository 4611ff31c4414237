//! Commit 应用器
//!
//! 职责：
//! - 按远端返回顺序把一页事件写入存储（去重 → 解密 → upsert）
//! - redaction 事件落库后立即做撤回扇出
//! - 写库失败时撤销该事件的去重标记，错误返回给调用方

use std::sync::Arc;
use tracing::{debug, error};

use crate::error::Result;
use crate::events::CommitOrigin;
use crate::storage::deduplication::DeduplicationManager;
use crate::storage::entities::{Event, EventKind};
use crate::storage::{StorageManager, UpsertOutcome};
use crate::sync::decrypt::{decrypt_with_timeout, DecryptRetryPolicy, EventDecryptor};

/// 一页提交的结果
#[derive(Debug, Clone, Default)]
pub struct PageCommit {
    /// 本次实际提交的事件 (event_id, ts)，保持远端顺序
    pub committed: Vec<(String, i64)>,
    /// 被去重跳过的事件数
    pub duplicates: usize,
}

/// Commit 应用器
#[derive(Clone)]
pub struct CommitApplier {
    storage: StorageManager,
    dedup: DeduplicationManager,
    decryptor: Option<Arc<dyn EventDecryptor>>,
    decrypt_policy: DecryptRetryPolicy,
}

impl CommitApplier {
    pub fn new(
        storage: StorageManager,
        dedup: DeduplicationManager,
        decryptor: Option<Arc<dyn EventDecryptor>>,
        decrypt_policy: DecryptRetryPolicy,
    ) -> Self {
        Self {
            storage,
            dedup,
            decryptor,
            decrypt_policy,
        }
    }

    pub fn dedup(&self) -> &DeduplicationManager {
        &self.dedup
    }

    /// 应用单个事件；去重命中时返回 None
    pub async fn apply_event(&self, event: Event, origin: CommitOrigin) -> Result<Option<UpsertOutcome>> {
        if !self.dedup.check_and_mark(&event.id) {
            return Ok(None);
        }
        let event_id = event.id.clone();
        match self.commit(event, origin).await {
            Ok(outcome) => Ok(Some(outcome)),
            Err(e) => {
                error!("提交事件失败，撤销去重标记: event_id={}, error={}", event_id, e);
                self.dedup.unmark(&event_id);
                Err(e)
            }
        }
    }

    /// 按顺序应用一页；遇到第一个写库错误即停止
    pub async fn apply_page(&self, events: Vec<Event>, origin: CommitOrigin) -> Result<PageCommit> {
        let mut report = PageCommit::default();
        for event in events {
            let (id, ts) = (event.id.clone(), event.timestamp);
            match self.apply_event(event, origin).await? {
                Some(_) => report.committed.push((id, ts)),
                None => report.duplicates += 1,
            }
        }
        debug!(
            "页面提交完成: committed={}, duplicates={}",
            report.committed.len(),
            report.duplicates
        );
        Ok(report)
    }

    async fn commit(&self, event: Event, origin: CommitOrigin) -> Result<UpsertOutcome> {
        let event = match &self.decryptor {
            Some(decryptor) => decrypt_with_timeout(decryptor.as_ref(), event, &self.decrypt_policy).await,
            None => event,
        };
        let kind = event.kind();
        let outcome = self.storage.upsert(event, origin).await?;

        if let EventKind::Redaction { targets } = kind {
            if !targets.is_empty() && !outcome.event.redacted {
                self.storage
                    .redact(targets, Some(outcome.event.clone()))
                    .await?;
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventManager;
    use crate::storage::entities::event_types;
    use serde_json::json;
    use tempfile::TempDir;

    async fn applier(dir: &TempDir) -> CommitApplier {
        let storage = StorageManager::open(dir.path(), "@me:hs", EventManager::new(64))
            .await
            .unwrap();
        CommitApplier::new(storage, DeduplicationManager::new(), None, DecryptRetryPolicy::default())
    }

    fn message(id: &str, ts: i64) -> Event {
        Event::new(id, event_types::MESSAGE, "@bob:hs", "!room", json!({"body": id}), ts)
    }

    #[tokio::test]
    async fn replayed_page_is_deduplicated() {
        let dir = TempDir::new().unwrap();
        let applier = applier(&dir).await;
        let page = vec![message("$a", 1), message("$b", 2)];

        let first = applier.apply_page(page.clone(), CommitOrigin::Sync { page_index: 0 }).await.unwrap();
        assert_eq!(first.committed.len(), 2);
        let second = applier.apply_page(page, CommitOrigin::Sync { page_index: 0 }).await.unwrap();
        assert!(second.committed.is_empty());
        assert_eq!(second.duplicates, 2);
    }

    #[tokio::test]
    async fn redaction_event_fans_out() {
        let dir = TempDir::new().unwrap();
        let applier = applier(&dir).await;
        let redaction = Event::new("$x", event_types::REDACTION, "@bob:hs", "!room", json!({"redacts": "$a"}), 3);
        applier
            .apply_page(vec![message("$a", 1), redaction], CommitOrigin::Live)
            .await
            .unwrap();
        let stored = applier.storage.get_event("$a").await.unwrap().unwrap();
        assert!(stored.redacted);
    }

    #[tokio::test]
    async fn failed_write_rolls_back_dedup_mark() {
        let dir = TempDir::new().unwrap();
        let applier = applier(&dir).await;
        applier.storage.shutdown().await.unwrap();

        let err = applier.apply_event(message("$a", 1), CommitOrigin::Live).await;
        assert!(err.is_err());
        assert!(!applier.dedup().is_duplicate("$a"));
    }
}
