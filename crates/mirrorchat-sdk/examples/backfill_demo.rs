//! 回填演示：内存事件源 → 同步 → 时间线窗口 → 未读计数
//!
//! cargo run --example backfill_demo

use async_trait::async_trait;
use mirrorchat_sdk::{
    BucketKey, Collaborators, Direction, EventPage, MirrorchatConfig, MirrorchatSDK, RemoteEventSource, Result,
    ScopeKey,
};
use serde_json::{json, Value};
use std::sync::Arc;

struct InMemorySource {
    history: Vec<Value>,
}

impl InMemorySource {
    fn new(count: i64) -> Self {
        let history = (1..=count)
            .map(|i| {
                json!({
                    "event_id": format!("$demo{}", i),
                    "type": "m.room.message",
                    "sender": if i % 3 == 0 { "@carol:demo" } else { "@bob:demo" },
                    "origin_server_ts": 1_700_000_000_000i64 + i * 1000,
                    "content": {"msgtype": "m.text", "body": format!("message #{}", i)}
                })
            })
            .collect();
        Self { history }
    }
}

#[async_trait]
impl RemoteEventSource for InMemorySource {
    async fn fetch_events(
        &self,
        _conversation_id: &str,
        _thread_id: Option<&str>,
        _direction: Direction,
        limit: u32,
        from_token: Option<&str>,
    ) -> Result<EventPage> {
        let end = from_token
            .and_then(|t| t.parse::<usize>().ok())
            .unwrap_or(self.history.len());
        let start = end.saturating_sub(limit as usize);
        Ok(EventPage {
            events: self.history[start..end].iter().rev().cloned().collect(),
            next_token: (start > 0).then(|| start.to_string()),
            prev_token: None,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).init();

    let data_dir = std::env::temp_dir().join("mirrorchat_demo");
    let config = MirrorchatConfig::builder()
        .data_dir(&data_dir)
        .user_id("@alice:demo")
        .page_limit(20)
        .build();
    let source = Arc::new(InMemorySource::new(75));
    let sdk = MirrorchatSDK::initialize(config, Collaborators::new(source)).await?;

    let mut status = sdk.subscribe_sync_status();
    tokio::spawn(async move {
        while let Ok(changed) = status.recv().await {
            println!("sync [{}] -> {:?}", changed.scope, changed.status);
        }
    });

    sdk.sync("!demo", None, None)?;
    sdk.wait_sync_idle().await;
    // 管线异步消费变更通知
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    let scope = ScopeKey::conversation("!demo");
    let window = sdk.timeline(&scope);
    println!("timeline window: {} events", window.len());
    if let (Some(first), Some(last)) = (window.first(), window.last()) {
        println!("  oldest: {} {:?}", first.id, first.body());
        println!("  newest: {} {:?}", last.id, last.body());
    }
    if let Some(cursor) = sdk.cursor(&scope).await? {
        println!("cursor: last_event_id={:?}, complete={}", cursor.last_event_id, cursor.is_complete);
    }
    if let Some(bucket) = sdk.notification_bucket(&BucketKey::Scope(scope)) {
        println!("unread: total={}, highlight={}", bucket.total, bucket.highlight);
    }

    sdk.shutdown().await
}
