//! 远端事件源接口（协议客户端由外部提供）

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// 分页方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// 从新到旧
    Backward,
    /// 从旧到新
    Forward,
}

/// 一页远端事件（原始 JSON，由 normalize 转为 Event）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventPage {
    pub events: Vec<serde_json::Value>,
    /// 继续同方向翻页的令牌；None 表示已无更多
    pub next_token: Option<String>,
    pub prev_token: Option<String>,
}

#[async_trait]
pub trait RemoteEventSource: Send + Sync {
    /// 拉取一页事件。`from_token` 为 None 时从最新处开始。
    /// 返回错误时由协调器归类为 TransientFetch。
    async fn fetch_events(
        &self,
        conversation_id: &str,
        thread_id: Option<&str>,
        direction: Direction,
        limit: u32,
        from_token: Option<&str>,
    ) -> Result<EventPage>;
}
