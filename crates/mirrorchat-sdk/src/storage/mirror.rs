//! 事件镜像写入 - 把一个规范事件按类型写入各专用表
//!
//! 这里的函数都只在 DbActor 线程里调用，每次调用一个事务：
//! - upsert：幂等收敛，已撤回的行为终态
//! - redact：按事件 ID 或事务 ID 扇出到所有镜像表，找不到目标时落墓碑
//! - 编辑：按时间戳后写者胜选出 primary edit，撤回 primary 时重新选举

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::error::Result;
use crate::storage::dao::message_edit::EditRow;
use crate::storage::dao::redaction::Tombstone;
use crate::storage::dao::{DaoFactory, TransactionManager};
use crate::storage::entities::{Event, EventKind, MemberRow, ReactionRow, ReceiptRow, SendStatus, TableRowState};

/// upsert 的结果分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertStatus {
    /// 新写入
    Inserted,
    /// 已存在但状态不同，已收敛为新状态
    Updated,
    /// 完全重复，无变化
    Unchanged,
    /// 已撤回的行是终态，忽略
    RedactedTerminal,
    /// 目标已撤回的编辑，拒绝
    EditRejected,
}

#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub status: UpsertStatus,
    /// 写入后的行（拒绝/终态时为库中现有行或传入事件）
    pub event: Event,
    /// 被本次确认替换掉的本地事务 ID
    pub replaced_local_echo: Option<String>,
    /// 编辑生效后内容发生变化的目标事件
    pub edited_target: Option<Event>,
    pub is_thread_root: bool,
}

impl UpsertOutcome {
    pub fn changed(&self) -> bool {
        matches!(self.status, UpsertStatus::Inserted | UpsertStatus::Updated)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RedactOutcome {
    /// 本次新撤回的行
    pub redacted: Vec<Event>,
    /// 目标尚未落库、已登记墓碑的 ID
    pub pending: Vec<String>,
    /// 因编辑被撤回而重新选举内容的目标事件
    pub reelected: Vec<Event>,
}

/// 除 content 以外的字段都相同（content 可能已被编辑覆盖）
fn same_state(existing: &Event, incoming: &Event) -> bool {
    existing.event_type == incoming.event_type
        && existing.sender == incoming.sender
        && existing.conversation_id == incoming.conversation_id
        && existing.thread_id == incoming.thread_id
        && existing.original_content == incoming.original_content
        && existing.timestamp == incoming.timestamp
        && existing.send_status == incoming.send_status
        && existing.state_key == incoming.state_key
        && existing.transaction_id == incoming.transaction_id
        && existing.malformed == incoming.malformed
        && existing.undecryptable == incoming.undecryptable
}

pub fn upsert_event(conn: &Connection, local_user: &str, event: &Event) -> Result<UpsertOutcome> {
    TransactionManager::new(conn).execute(|conn| upsert_in_tx(conn, local_user, event))
}

fn upsert_in_tx(conn: &Connection, local_user: &str, event: &Event) -> Result<UpsertOutcome> {
    let timeline = DaoFactory::timeline_dao(conn);
    let edits = DaoFactory::message_edit_dao(conn);
    let kind = event.kind();
    let mut incoming = event.clone();
    incoming.thread_summary = None;

    // 本地回显确认：删除 ~txn 行，编辑和反应改指向正式 ID
    let mut replaced_local_echo = None;
    let mut inherited_redaction = false;
    if let Some(txn) = event.transaction_id.as_deref() {
        if !event.is_local_echo() && txn != event.id {
            if let Some(local) = timeline.get(txn)? {
                inherited_redaction = local.redacted;
                delete_local_rows(conn, txn)?;
                edits.retarget(txn, &event.id)?;
                DaoFactory::reaction_dao(conn).retarget(txn, &event.id)?;
                debug!("本地回显已确认: txn={}, event_id={}", txn, event.id);
                replaced_local_echo = Some(txn.to_string());
            }
        }
    }

    let existing = timeline.get(&event.id)?;
    if let Some(existing) = &existing {
        if existing.redacted {
            return Ok(UpsertOutcome {
                status: UpsertStatus::RedactedTerminal,
                event: existing.clone(),
                replaced_local_echo,
                edited_target: None,
                is_thread_root: false,
            });
        }
        if replaced_local_echo.is_none() && event.thread_summary.is_none() && same_state(existing, &incoming) {
            return Ok(UpsertOutcome {
                status: UpsertStatus::Unchanged,
                event: existing.clone(),
                replaced_local_echo: None,
                edited_target: None,
                is_thread_root: DaoFactory::thread_dao(conn).get(&event.id)?.is_some(),
            });
        }
    }

    if let EventKind::Edit { target, .. } = &kind {
        let target_redacted = match timeline.get(target)? {
            Some(row) => row.redacted,
            None => DaoFactory::redaction_dao(conn).is_pending(target)?,
        };
        if target_redacted {
            debug!("编辑目标已撤回，忽略: edit={}, target={}", event.id, target);
            return Ok(UpsertOutcome {
                status: UpsertStatus::EditRejected,
                event: incoming,
                replaced_local_echo,
                edited_target: None,
                is_thread_root: false,
            });
        }
    }

    let mut tombstone_ids = vec![event.id.as_str()];
    if let Some(txn) = event.transaction_id.as_deref() {
        tombstone_ids.push(txn);
    }
    let tombstone = DaoFactory::redaction_dao(conn).take(&tombstone_ids)?;
    if let Some(tombstone) = &tombstone {
        info!(
            "应用待处理的撤回: event_id={}, redaction={:?}",
            event.id, tombstone.redaction_event_id
        );
    }

    if inherited_redaction || tombstone.is_some() {
        incoming.strip_for_redaction();
    } else if let Some(primary) = edits.primary(&event.id)? {
        if !primary.redacted {
            incoming.content = primary.content;
        }
    }

    timeline.upsert(&incoming)?;
    let is_new = existing.is_none();
    let mut edited_target = None;

    match &kind {
        EventKind::Message | EventKind::Sticker | EventKind::Encrypted => {
            DaoFactory::message_dao(conn).upsert(&incoming)?;
            DaoFactory::message_search_dao(conn).upsert(&incoming)?;
        }
        EventKind::Edit { target, new_content } => {
            edits.insert(&incoming, target, new_content)?;
            if new_content.is_object() && !incoming.redacted {
                edited_target = reelect(conn, target)?;
            }
        }
        EventKind::Reaction { target, key, shortcode } => {
            DaoFactory::reaction_dao(conn).upsert(&ReactionRow {
                event_id: incoming.id.clone(),
                target_id: target.clone(),
                conversation_id: incoming.conversation_id.clone(),
                sender: incoming.sender.clone(),
                reaction_key: key.clone(),
                shortcode: shortcode.clone(),
                timestamp: incoming.timestamp,
                redacted: incoming.redacted,
            })?;
        }
        EventKind::Membership { user_id, membership } => {
            DaoFactory::member_dao(conn).upsert(&MemberRow {
                conversation_id: incoming.conversation_id.clone(),
                user_id: user_id.clone(),
                membership: membership.clone(),
                display_name: incoming
                    .original_content
                    .get("displayname")
                    .and_then(|v| v.as_str())
                    .map(String::from),
                event_id: incoming.id.clone(),
                timestamp: incoming.timestamp,
                redacted: incoming.redacted,
            })?;
        }
        EventKind::Receipt { event_id } => {
            DaoFactory::receipt_dao(conn).upsert(&ReceiptRow {
                conversation_id: incoming.conversation_id.clone(),
                user_id: incoming.sender.clone(),
                event_id: event_id.clone(),
                timestamp: incoming.timestamp,
            })?;
        }
        EventKind::Redaction { .. } | EventKind::Other => {}
    }

    let threads = DaoFactory::thread_dao(conn);
    if let Some(root) = incoming.thread_id.as_deref() {
        if is_new && root != incoming.id && !incoming.redacted {
            threads.record_reply(
                root,
                &incoming.conversation_id,
                &incoming.id,
                incoming.timestamp,
                incoming.sender == local_user,
            )?;
        }
    }
    if let Some(summary) = &event.thread_summary {
        threads.merge_summary(&incoming.id, &incoming.conversation_id, summary)?;
    }
    let is_thread_root = match threads.get(&incoming.id)? {
        Some(_) if incoming.redacted => {
            threads.mark_redacted(&incoming.id)?;
            true
        }
        Some(_) => true,
        None => false,
    };

    Ok(UpsertOutcome {
        status: if is_new {
            UpsertStatus::Inserted
        } else {
            UpsertStatus::Updated
        },
        event: incoming,
        replaced_local_echo,
        edited_target,
        is_thread_root,
    })
}

/// 重新选举目标事件的生效编辑，内容有变化时返回更新后的目标
fn reelect(conn: &Connection, target_id: &str) -> Result<Option<Event>> {
    let edits = DaoFactory::message_edit_dao(conn);
    let timeline = DaoFactory::timeline_dao(conn);
    let latest: Option<EditRow> = edits.latest_for(target_id)?;
    match &latest {
        Some(edit) => edits.set_primary(edit)?,
        None => {
            edits.clear_primary(target_id)?;
        }
    }

    let Some(mut target) = timeline.get(target_id)? else {
        return Ok(None);
    };
    if target.redacted {
        return Ok(None);
    }
    let content = latest
        .map(|edit| edit.content)
        .unwrap_or_else(|| target.original_content.clone());
    if content == target.content {
        return Ok(None);
    }
    timeline.update_content(target_id, &content)?;
    DaoFactory::message_dao(conn).update_content(target_id, &content)?;
    DaoFactory::message_search_dao(conn).update_text(target_id, &content)?;
    target.content = content;
    Ok(Some(target))
}

fn delete_local_rows(conn: &Connection, txn: &str) -> Result<()> {
    DaoFactory::timeline_dao(conn).delete(txn)?;
    DaoFactory::message_dao(conn).delete(txn)?;
    DaoFactory::message_search_dao(conn).delete(txn)?;
    DaoFactory::reaction_dao(conn).delete(txn)?;
    Ok(())
}

pub fn redact_events(conn: &Connection, ids: &[String], redaction: Option<&Event>) -> Result<RedactOutcome> {
    TransactionManager::new(conn).execute(|conn| {
        let timeline = DaoFactory::timeline_dao(conn);
        let mut outcome = RedactOutcome::default();
        for id in ids {
            let rows = timeline.find_by_id_or_txn(id)?;
            if rows.is_empty() {
                DaoFactory::redaction_dao(conn).latch(&Tombstone {
                    target_id: id.clone(),
                    redaction_event_id: redaction.map(|r| r.id.clone()),
                    conversation_id: redaction.map(|r| r.conversation_id.clone()),
                    timestamp: redaction.map(|r| r.timestamp).unwrap_or_default(),
                })?;
                debug!("撤回目标尚未落库，登记墓碑: target={}", id);
                outcome.pending.push(id.clone());
                continue;
            }
            for row in rows {
                if row.redacted {
                    continue;
                }
                redact_row(conn, row, &mut outcome)?;
            }
        }
        Ok(outcome)
    })
}

/// 把一个事件的所有镜像行标记为撤回
fn redact_row(conn: &Connection, mut row: Event, outcome: &mut RedactOutcome) -> Result<()> {
    let id = row.id.clone();
    DaoFactory::timeline_dao(conn).mark_redacted(&id)?;
    DaoFactory::message_dao(conn).mark_redacted(&id)?;
    DaoFactory::message_search_dao(conn).mark_redacted(&id)?;
    DaoFactory::reaction_dao(conn).mark_redacted(&id)?;
    DaoFactory::member_dao(conn).mark_redacted(&id)?;
    let threads = DaoFactory::thread_dao(conn);
    threads.mark_redacted(&id)?;
    if let Some(root) = row.thread_id.as_deref() {
        if root != id {
            threads.retract_reply(root)?;
        }
    }

    let edits = DaoFactory::message_edit_dao(conn);
    edits.mark_primary_redacted(&id)?;
    if let Some(target) = edits.mark_redacted(&id)? {
        if let Some(updated) = reelect(conn, &target)? {
            outcome.reelected.push(updated);
        }
    }

    row.strip_for_redaction();
    outcome.redacted.push(row);
    Ok(())
}

/// 取消本地未确认事件（状态置为 cancelled）
pub fn cancel_local_echo(conn: &Connection, txn: &str) -> Result<Option<Event>> {
    TransactionManager::new(conn).execute(|conn| {
        let timeline = DaoFactory::timeline_dao(conn);
        if timeline.set_send_status(txn, SendStatus::Cancelled)? == 0 {
            return Ok(None);
        }
        DaoFactory::message_dao(conn).set_send_status(txn, SendStatus::Cancelled)?;
        timeline.get(txn)
    })
}

/// 清空会话的全部镜像行，返回删除的 timeline 行数
pub fn purge_conversation(conn: &Connection, conversation_id: &str) -> Result<usize> {
    TransactionManager::new(conn).execute(|conn| {
        DaoFactory::message_edit_dao(conn).delete_conversation(conversation_id)?;
        DaoFactory::message_dao(conn).delete_conversation(conversation_id)?;
        DaoFactory::message_search_dao(conn).delete_conversation(conversation_id)?;
        DaoFactory::reaction_dao(conn).delete_conversation(conversation_id)?;
        DaoFactory::thread_dao(conn).delete_conversation(conversation_id)?;
        DaoFactory::member_dao(conn).delete_conversation(conversation_id)?;
        DaoFactory::receipt_dao(conn).delete_conversation(conversation_id)?;
        DaoFactory::redaction_dao(conn).delete_conversation(conversation_id)?;
        DaoFactory::timeline_dao(conn).delete_conversation(conversation_id)
    })
}

/// 各镜像表中以该 ID 为键的行
pub fn table_rows_for(conn: &Connection, id: &str) -> Result<Vec<TableRowState>> {
    const TABLES: [(&str, &str); 8] = [
        ("timeline", "event_id"),
        ("messages", "event_id"),
        ("messages_search", "event_id"),
        ("messages_edit", "event_id"),
        ("messages_primary_edit", "target_id"),
        ("reactions", "event_id"),
        ("members", "event_id"),
        ("threads", "root_id"),
    ];
    let mut states = Vec::new();
    for (table, column) in TABLES {
        let sql = format!("SELECT redacted FROM {} WHERE {} = ?1", table, column);
        let redacted: Option<bool> = conn.query_row(&sql, params![id], |row| row.get(0)).optional()?;
        if let Some(redacted) = redacted {
            states.push(TableRowState {
                table: table.to_string(),
                redacted,
            });
        }
    }
    Ok(states)
}
