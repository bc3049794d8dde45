//! Queue listing.

use anyhow::Result;
use serde::Deserialize;

use super::http::{Target, get_json};

#[derive(Deserialize)]
struct QueueResponse {
    max_size: usize,
    entries: Vec<QueueEntry>,
}

#[derive(Deserialize)]
#[allow(dead_code)]
struct QueueEntry {
    client_id: u64,
    state: String,
    position: Option<usize>,
    origin: String,
    enqueued_at: u64,
    last_seen_at: u64,
    priority: Option<String>,
}

pub async fn cmd_queue(target: &Target) -> Result<()> {
    let resp: QueueResponse = get_json(target, "/queue").await?;

    if resp.entries.is_empty() {
        println!("Queue is empty (max {}).", resp.max_size);
        return Ok(());
    }

    println!("═══════════════════════════════════════");
    println!("  Queue ({}/{})", resp.entries.len(), resp.max_size);
    println!("═══════════════════════════════════════");

    for e in &resp.entries {
        let slot = match e.position {
            Some(p) => format!("#{}", p),
            None => "▶".to_string(),
        };
        let priority = e
            .priority
            .as_deref()
            .map(|p| format!(" [{}]", p))
            .unwrap_or_default();
        println!("  {:<4} c{:<6} {:<8} {}{}", slot, e.client_id, e.state, e.origin, priority);
    }

    Ok(())
}
