//! Lobby integration test harness.
//!
//! Each test starts a broker with an in-memory sandbox and a manual clock,
//! serves the real client and admin routers on ephemeral ports, and talks to
//! them over WebSocket and HTTP exactly as a browser or lobby-ctl would.
//!
//!   cargo test --test integration
//!
//! Nothing here touches docker or fixed ports, so tests run in parallel.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use lobby_core::crypto::SigningKey;
use lobby_core::ManualClock;
use lobby_services::testing::FakeSandbox;
use lobby_services::{
    Broker, BrokerHandle, BrokerParts, BrokerSettings, InviteTokenService, LifecycleSettings,
    RateLimiter, ResourceLimits, Telemetry,
};

mod admin;
mod admission;
mod sessions;

// ── Harness ───────────────────────────────────────────────────────────────────

/// How long any single expected event may take to arrive.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Options {
    pub max_queue_size: usize,
    pub max_session_secs: u64,
    pub heartbeat_grace_secs: u64,
    pub connect_ceiling: u32,
    pub admin_token: Option<&'static str>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_queue_size: 10,
            max_session_secs: 60,
            heartbeat_grace_secs: 600,
            connect_ceiling: 100,
            admin_token: None,
        }
    }
}

/// A running broker with both routers served on ephemeral ports.
pub struct Lobby {
    pub broker: BrokerHandle,
    pub fake: Arc<FakeSandbox>,
    pub clock: Arc<ManualClock>,
    pub ws_url: String,
    pub api_url: String,
    pub shutdown_rx: tokio::sync::broadcast::Receiver<()>,
    admin_token: Option<&'static str>,
}

pub async fn start_lobby(opts: Options) -> Result<Lobby> {
    let clock = ManualClock::new(1_000_000);
    let fake = Arc::new(FakeSandbox::new());
    let invites = InviteTokenService::new(SigningKey::generate(), clock.clone());

    let (broker, _join) = Broker::spawn(BrokerParts {
        settings: BrokerSettings {
            max_queue_size: opts.max_queue_size,
            heartbeat_grace: Duration::from_secs(opts.heartbeat_grace_secs),
            outbound_buffer: 64,
            lifecycle: LifecycleSettings {
                max_duration: Duration::from_secs(opts.max_session_secs),
                spawn_timeout: Duration::from_secs(5),
                limits: ResourceLimits {
                    memory_bytes: 1 << 28,
                    cpu_millis: 500,
                    max_pids: 32,
                },
            },
        },
        provider: fake.clone(),
        invites: invites.clone(),
        connect_limiter: Arc::new(RateLimiter::new(
            "connect",
            opts.connect_ceiling,
            60,
            clock.clone(),
        )),
        invite_limiter: Arc::new(RateLimiter::new("invite", 100, 60, clock.clone())),
        telemetry: Arc::new(Telemetry::new()),
        clock: clock.clone(),
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    let state = lobby_api::ApiState {
        broker: broker.clone(),
        invites,
        default_invite_ttl: Duration::from_secs(3600),
        admin_token: opts.admin_token.map(Arc::from),
        started_at: Instant::now(),
        shutdown_tx,
    };

    let public = TcpListener::bind("127.0.0.1:0").await?;
    let ws_url = format!("ws://{}/ws", public.local_addr()?);
    tokio::spawn(lobby_api::serve_public(public, state.clone()));

    let admin = TcpListener::bind("127.0.0.1:0").await?;
    let api_url = format!("http://{}/api", admin.local_addr()?);
    tokio::spawn(async move { axum::serve(admin, lobby_api::admin_router(state)).await });

    Ok(Lobby {
        broker,
        fake,
        clock,
        ws_url,
        api_url,
        shutdown_rx,
        admin_token: opts.admin_token,
    })
}

impl Lobby {
    pub async fn client(&self) -> Result<WsClient> {
        WsClient::connect(&self.ws_url).await
    }

    /// A socket whose first event has not been read yet.
    pub async fn raw_client(&self) -> Result<WsClient> {
        WsClient::open(&self.ws_url).await
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.admin_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    /// GET an admin path, returning status and parsed body.
    pub async fn api_get(&self, path: &str) -> Result<(u16, Value)> {
        let req = reqwest::Client::new().get(format!("{}{}", self.api_url, path));
        read(self.authed(req).send().await?).await
    }

    pub async fn api_post(&self, path: &str, body: Value) -> Result<(u16, Value)> {
        let req = reqwest::Client::new()
            .post(format!("{}{}", self.api_url, path))
            .json(&body);
        read(self.authed(req).send().await?).await
    }

    /// Mint an invite through the admin API and return the token string.
    pub async fn issue_invite(&self, scope: &str) -> Result<String> {
        let (status, body) = self.api_post("/invites", json!({ "scope": scope })).await?;
        if status != 200 {
            bail!("invite issue failed: {} {}", status, body);
        }
        body["token"]
            .as_str()
            .map(str::to_string)
            .context("missing token in response")
    }

    /// Poll the admin status until `check` passes.
    pub async fn wait_status(&self, check: impl Fn(&Value) -> bool) -> Result<Value> {
        let deadline = Instant::now() + EVENT_TIMEOUT;
        loop {
            let (_, status) = self.api_get("/status").await?;
            if check(&status) {
                return Ok(status);
            }
            if Instant::now() > deadline {
                bail!("status never reached the expected state: {}", status);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

async fn read(resp: reqwest::Response) -> Result<(u16, Value)> {
    let status = resp.status().as_u16();
    let text = resp.text().await?;
    let body = serde_json::from_str(&text).unwrap_or(Value::String(text));
    Ok((status, body))
}

// ── WebSocket client ──────────────────────────────────────────────────────────

pub struct WsClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    pub id: u64,
    last_seq: u64,
}

impl WsClient {
    pub async fn open(url: &str) -> Result<Self> {
        let (ws, _) = connect_async(url).await.context("websocket connect failed")?;
        Ok(Self {
            ws,
            id: 0,
            last_seq: 0,
        })
    }

    /// Connect and consume the `welcome` event.
    pub async fn connect(url: &str) -> Result<Self> {
        let mut client = Self::open(url).await?;
        let welcome = client.expect("welcome").await?;
        client.id = welcome["payload"]["client_id"]
            .as_u64()
            .context("welcome without client_id")?;
        Ok(client)
    }

    pub async fn send(&mut self, frame: Value) -> Result<()> {
        self.ws.send(Message::text(frame.to_string())).await?;
        Ok(())
    }

    pub async fn send_raw(&mut self, text: &str) -> Result<()> {
        self.ws.send(Message::text(text.to_string())).await?;
        Ok(())
    }

    pub async fn enqueue(&mut self, invite_token: Option<&str>) -> Result<()> {
        self.send(json!({ "type": "enqueue", "payload": { "invite_token": invite_token } }))
            .await
    }

    pub async fn heartbeat(&mut self) -> Result<()> {
        self.send(json!({ "type": "heartbeat" })).await
    }

    pub async fn end_session(&mut self) -> Result<()> {
        self.send(json!({ "type": "end_session" })).await
    }

    /// Next broker event. Sequence numbers must increase by exactly one.
    pub async fn next_event(&mut self) -> Result<Value> {
        loop {
            let frame = tokio::time::timeout(EVENT_TIMEOUT, self.ws.next())
                .await
                .context("timed out waiting for an event")?
                .context("socket closed")??;
            match frame {
                Message::Text(text) => {
                    let event: Value = serde_json::from_str(text.as_str())?;
                    let seq = event["seq"].as_u64().context("event without seq")?;
                    if seq != self.last_seq + 1 {
                        bail!("sequence gap: {} after {}", seq, self.last_seq);
                    }
                    self.last_seq = seq;
                    return Ok(event);
                }
                Message::Close(_) => bail!("socket closed"),
                _ => continue,
            }
        }
    }

    /// The next event must have this type.
    pub async fn expect(&mut self, kind: &str) -> Result<Value> {
        let event = self.next_event().await?;
        if event["type"] != kind {
            bail!("expected {}, got {}", kind, event);
        }
        Ok(event)
    }

    /// Skip events until one of this type arrives.
    pub async fn wait_for(&mut self, kind: &str) -> Result<Value> {
        loop {
            let event = self.next_event().await?;
            if event["type"] == kind {
                return Ok(event);
            }
        }
    }

    /// True once the server has closed the socket.
    pub async fn closed_by_server(&mut self) -> bool {
        loop {
            match tokio::time::timeout(EVENT_TIMEOUT, self.ws.next()).await {
                Err(_) => return false,
                Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Message::Close(_)))) => return true,
                Ok(Some(Ok(_))) => continue,
            }
        }
    }

    /// Nothing arrives within `quiet`.
    pub async fn assert_silent(&mut self, quiet: Duration) -> Result<()> {
        match tokio::time::timeout(quiet, self.ws.next()).await {
            Err(_) => Ok(()),
            Ok(frame) => bail!("unexpected frame: {:?}", frame),
        }
    }

    pub async fn close(mut self) -> Result<()> {
        self.ws.close(None).await?;
        Ok(())
    }
}
