//! Session commands.

use anyhow::Result;
use serde::Deserialize;

use super::http::{Target, post_json};

pub async fn cmd_session_end(target: &Target) -> Result<()> {
    #[derive(Deserialize)]
    struct EndResponse {
        ended: Option<String>,
    }

    let resp: EndResponse = post_json(target, "/session/end").await?;
    match resp.ended {
        Some(id) => println!("✓ Session ending: {}...", &id[..16]),
        None => println!("No active session."),
    }
    Ok(())
}
