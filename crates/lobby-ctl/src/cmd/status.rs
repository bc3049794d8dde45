//! Daemon health, status, shutdown commands.

use anyhow::Result;
use serde::Deserialize;

use super::http::{Target, get_json, post_json};

// ── Response types ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct HealthResponse {
    status: String,
    uptime_secs: u64,
}

#[derive(Deserialize)]
struct StatusResponse {
    active: Option<SessionInfo>,
    last_session: Option<SessionInfo>,
    queue_length: usize,
    max_queue_size: usize,
    idle_connections: usize,
    shutting_down: bool,
    telemetry: TelemetryInfo,
    uptime_secs: u64,
}

#[derive(Deserialize)]
#[allow(dead_code)]
struct SessionInfo {
    session_id: String,
    owner: u64,
    status: String,
    started_at: u64,
    deadline: u64,
    connection: Option<String>,
    end_reason: Option<String>,
    crashed: bool,
    ended_at: Option<u64>,
}

#[derive(Deserialize)]
#[allow(dead_code)]
struct TelemetryInfo {
    sessions_started: u64,
    sessions_ended: u64,
    sessions_timed_out: u64,
    sandbox_crashes: u64,
    spawn_failures: u64,
    enqueue_rejected: u64,
    last_spawn_ms: u64,
    last_teardown_ms: u64,
}

// ── Commands ──────────────────────────────────────────────────────────────────

pub async fn cmd_health(target: &Target) -> Result<()> {
    let resp: HealthResponse = get_json(target, "/health").await?;
    println!("{} (up {}s)", resp.status, resp.uptime_secs);
    Ok(())
}

pub async fn cmd_status(target: &Target) -> Result<()> {
    let resp: StatusResponse = get_json(target, "/status").await?;

    println!("═══════════════════════════════════════");
    println!("  Lobby Daemon Status");
    println!("═══════════════════════════════════════");
    println!("  Uptime           : {}s", resp.uptime_secs);
    println!("  Queue            : {}/{}", resp.queue_length, resp.max_queue_size);
    println!("  Idle connections : {}", resp.idle_connections);
    if resp.shutting_down {
        println!("  Shutting down    : yes");
    }

    match &resp.active {
        Some(s) => {
            println!("\n  Active session:");
            print_session(s);
        }
        None => println!("\n  No active session."),
    }
    if let Some(s) = &resp.last_session {
        println!("\n  Last session:");
        print_session(s);
    }

    let t = &resp.telemetry;
    println!("\n  Counters:");
    println!("  │  started      : {}", t.sessions_started);
    println!("  │  ended        : {}", t.sessions_ended);
    println!("  │  timed out    : {}", t.sessions_timed_out);
    println!("  │  crashes      : {}", t.sandbox_crashes);
    println!("  │  spawn fails  : {}", t.spawn_failures);
    println!("  │  rejected     : {}", t.enqueue_rejected);
    println!("  └─ last spawn  : {}ms", t.last_spawn_ms);

    Ok(())
}

fn print_session(s: &SessionInfo) {
    println!("  ┌─ {}", &s.session_id[..16]);
    println!("  │  owner      : c{}", s.owner);
    println!("  │  status     : {}", s.status);
    if let Some(conn) = &s.connection {
        println!("  │  connection : {}", conn);
    }
    if let Some(reason) = &s.end_reason {
        println!("  │  ended      : {}{}", reason, if s.crashed { " (crash)" } else { "" });
    }
    println!("  └─ deadline   : {}", s.deadline);
}

pub async fn cmd_shutdown(target: &Target) -> Result<()> {
    #[derive(Deserialize)]
    struct ShutdownResponse {
        message: String,
    }

    let resp: ShutdownResponse = post_json(target, "/daemon/shutdown").await?;
    println!("{}", resp.message);
    Ok(())
}
