//! lobby-ctl — command-line interface for the Lobby daemon.

use anyhow::{Context, Result};

mod cmd;

use cmd::http::Target;

const DEFAULT_PORT: u16 = 9011;

fn print_usage() {
    println!("Usage: lobby-ctl [--port <port>] [--token <token>] <command>");
    println!();
    println!("Commands:");
    println!("  status                        Show active session, queue size, counters");
    println!("  health                        Check the daemon is up");
    println!("  queue                         List connected clients in queue order");
    println!("  invite <bypass|direct> [ttl]  Issue an invite token (ttl in seconds)");
    println!("  invites                       List issued invites");
    println!("  end-session                   End the active session");
    println!("  shutdown                      Drain the queue and stop the daemon");
    println!();
    println!("Options:");
    println!("  --port <port>    Admin API port (default: {})", DEFAULT_PORT);
    println!("  --token <token>  Admin token (default: $LOBBY_ADMIN_TOKEN)");
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut port = DEFAULT_PORT;
    let mut token = std::env::var("LOBBY_ADMIN_TOKEN").ok();
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--port" => {
                i += 1;
                port = args
                    .get(i)
                    .context("--port requires a value")?
                    .parse()
                    .context("--port must be a number")?;
            }
            "--token" => {
                i += 1;
                token = Some(args.get(i).context("--token requires a value")?.clone());
            }
            other => remaining.push(other),
        }
        i += 1;
    }

    let target = Target { port, token };

    match remaining.as_slice() {
        ["status"] | [] => cmd::status::cmd_status(&target).await,
        ["health"] => cmd::status::cmd_health(&target).await,
        ["queue"] => cmd::queue::cmd_queue(&target).await,
        ["invite", scope] => cmd::invites::cmd_invite_issue(&target, scope, None).await,
        ["invite", scope, ttl] => cmd::invites::cmd_invite_issue(&target, scope, Some(*ttl)).await,
        ["invites"] => cmd::invites::cmd_invite_list(&target).await,
        ["end-session"] => cmd::session::cmd_session_end(&target).await,
        ["shutdown"] => cmd::status::cmd_shutdown(&target).await,
        ["help"] | ["--help"] | ["-h"] => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
