//! 单个 scope 的有界时间线窗口

use crate::storage::entities::Event;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertStatus {
    Inserted,
    /// 窗口中已有同 ID 事件，已替换
    Replaced,
    /// 窗口已满且事件不比最旧的新
    Rejected,
}

/// 插入结果；evicted 为本次被淘汰的最旧事件（从旧到新）
#[derive(Debug, Clone, PartialEq)]
pub struct InsertResult {
    pub status: InsertStatus,
    pub evicted: Vec<Event>,
}

/// 按 (timestamp, event_id) 升序保存的窗口
#[derive(Debug, Clone)]
pub struct TimelineWindow {
    limit: usize,
    events: Vec<Event>,
    /// 首次填充阶段，首页可以暂时超过上限
    populating: bool,
}

fn sort_key(event: &Event) -> (i64, &str) {
    (event.timestamp, event.id.as_str())
}

impl TimelineWindow {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            events: Vec::new(),
            populating: true,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn is_populating(&self) -> bool {
        self.populating
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn oldest(&self) -> Option<&Event> {
        self.events.first()
    }

    pub fn get(&self, event_id: &str) -> Option<&Event> {
        self.events.iter().find(|e| e.id == event_id)
    }

    pub fn get_mut(&mut self, event_id: &str) -> Option<&mut Event> {
        self.events.iter_mut().find(|e| e.id == event_id)
    }

    /// 结束首次填充并裁剪到上限，返回被淘汰的事件（从旧到新）
    pub fn settle(&mut self) -> Vec<Event> {
        self.populating = false;
        self.trim()
    }

    fn trim(&mut self) -> Vec<Event> {
        if self.populating || self.events.len() <= self.limit {
            return Vec::new();
        }
        let overflow = self.events.len() - self.limit;
        self.events.drain(..overflow).collect()
    }

    /// 插入事件。`initial_page` 为首页提交时，填充阶段允许超限增长；
    /// 非首页的插入会先结束填充阶段。
    pub fn insert(&mut self, event: Event, initial_page: bool) -> InsertResult {
        let mut evicted = Vec::new();
        if !initial_page && self.populating {
            evicted = self.settle();
        }

        if let Some(pos) = self.events.iter().position(|e| e.id == event.id) {
            self.events.remove(pos);
            let at = self.position_for(&event);
            self.events.insert(at, event);
            return InsertResult {
                status: InsertStatus::Replaced,
                evicted,
            };
        }

        let has_room = self.events.len() < self.limit;
        let newer_than_oldest = self
            .oldest()
            .map(|oldest| event.timestamp > oldest.timestamp)
            .unwrap_or(true);
        let growing = initial_page && self.populating;
        if !(has_room || newer_than_oldest || growing) {
            return InsertResult {
                status: InsertStatus::Rejected,
                evicted,
            };
        }

        let at = self.position_for(&event);
        self.events.insert(at, event);
        evicted.extend(self.trim());
        InsertResult {
            status: InsertStatus::Inserted,
            evicted,
        }
    }

    fn position_for(&self, event: &Event) -> usize {
        let key = sort_key(event);
        self.events.partition_point(|e| sort_key(e) < key)
    }

    pub fn remove(&mut self, event_id: &str) -> Option<Event> {
        let pos = self.events.iter().position(|e| e.id == event_id)?;
        Some(self.events.remove(pos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::entities::event_types;
    use serde_json::json;

    fn event(ts: i64) -> Event {
        Event::new(format!("$e{:03}", ts), event_types::MESSAGE, "@bob:hs", "!room", json!({"body": ts}), ts)
    }

    fn timestamps(window: &TimelineWindow) -> Vec<i64> {
        window.events().iter().map(|e| e.timestamp).collect()
    }

    #[test]
    fn keeps_ascending_order_for_out_of_order_inserts() {
        let mut window = TimelineWindow::new(10);
        for ts in [5, 1, 9, 3, 7] {
            window.insert(event(ts), false);
        }
        assert_eq!(timestamps(&window), vec![1, 3, 5, 7, 9]);
    }

    #[test]
    fn steady_state_never_exceeds_limit() {
        let mut window = TimelineWindow::new(3);
        window.settle();
        let mut evicted = Vec::new();
        for ts in 1..=6 {
            let result = window.insert(event(ts), false);
            assert_eq!(result.status, InsertStatus::Inserted);
            evicted.extend(result.evicted.into_iter().map(|e| e.timestamp));
            assert!(window.len() <= 3);
        }
        assert_eq!(timestamps(&window), vec![4, 5, 6]);
        assert_eq!(evicted, vec![1, 2, 3]);
    }

    #[test]
    fn full_window_rejects_older_events() {
        let mut window = TimelineWindow::new(2);
        window.settle();
        window.insert(event(10), false);
        window.insert(event(20), false);
        assert_eq!(window.insert(event(5), false).status, InsertStatus::Rejected);
        assert_eq!(window.insert(event(10), false).status, InsertStatus::Replaced);
        assert_eq!(timestamps(&window), vec![10, 20]);
    }

    #[test]
    fn initial_page_may_overgrow_until_settled() {
        let mut window = TimelineWindow::new(2);
        for ts in [30, 20, 10] {
            window.insert(event(ts), true);
        }
        assert_eq!(window.len(), 3);
        let evicted = window.settle();
        assert_eq!(evicted.len(), 1);
        assert_eq!(timestamps(&window), vec![20, 30]);
    }

    #[test]
    fn first_non_initial_insert_settles() {
        let mut window = TimelineWindow::new(2);
        for ts in [30, 20, 10] {
            window.insert(event(ts), true);
        }
        let result = window.insert(event(5), false);
        assert_eq!(result.status, InsertStatus::Rejected);
        assert_eq!(result.evicted.len(), 1);
        assert!(!window.is_populating());
        assert_eq!(timestamps(&window), vec![20, 30]);
    }
}
