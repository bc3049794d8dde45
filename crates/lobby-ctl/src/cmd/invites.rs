//! Invite commands.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::http::{Target, get_json, post_json_body};

#[derive(Deserialize)]
struct InviteRecord {
    token_id: String,
    scope: String,
    issued_at: u64,
    expires_at: u64,
    consumed_at: Option<u64>,
}

pub async fn cmd_invite_issue(target: &Target, scope: &str, ttl: Option<&str>) -> Result<()> {
    #[derive(Serialize)]
    struct IssueRequest<'a> {
        scope: &'a str,
        ttl_secs: Option<u64>,
    }

    #[derive(Deserialize)]
    struct IssueResponse {
        token: String,
        token_id: String,
        expires_at: u64,
    }

    let ttl_secs = ttl
        .map(|t| t.parse::<u64>().context("ttl must be a number of seconds"))
        .transpose()?;

    let resp: IssueResponse =
        post_json_body(target, "/invites", &IssueRequest { scope, ttl_secs }).await?;

    println!("✓ Invite issued ({})", scope);
    println!("  id      : {}", resp.token_id);
    println!("  expires : {}", resp.expires_at);
    println!("  token   : {}", resp.token);
    Ok(())
}

pub async fn cmd_invite_list(target: &Target) -> Result<()> {
    #[derive(Deserialize)]
    struct ListResponse {
        invites: Vec<InviteRecord>,
    }

    let resp: ListResponse = get_json(target, "/invites").await?;

    if resp.invites.is_empty() {
        println!("No invites issued.");
        return Ok(());
    }

    println!("═══════════════════════════════════════");
    println!("  Invites ({})", resp.invites.len());
    println!("═══════════════════════════════════════");

    for inv in &resp.invites {
        let state = match inv.consumed_at {
            Some(at) => format!("consumed at {}", at),
            None => "unused".to_string(),
        };
        println!("  ┌─ {} ({})", &inv.token_id[..16], inv.scope);
        println!("  │  issued  : {}", inv.issued_at);
        println!("  │  expires : {}", inv.expires_at);
        println!("  └─ {}", state);
    }

    Ok(())
}
