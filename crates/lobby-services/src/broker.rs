//! Broker — the one task that owns the queue and the session.
//!
//! Every state change arrives as an `Intent` on a channel and is handled to
//! completion before the next one is read, so admissions, removals, sweeps
//! and token-priority decisions can never interleave. Handling an intent
//! never awaits: spawns and teardowns are started on their own tasks and
//! report back as further intents.
//!
//! Connections that are not enqueued live in `idle`, keyed by client id.
//! Enqueue moves a connection into the queue; when its turn ends (or it is
//! rejected) the connection comes back to `idle` so the client can try
//! again on the same socket.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use lobby_core::{ClientId, EndReason, ErrorKind, ServerEvent, SessionId, SharedClock};

use crate::invite::InviteTokenService;
use crate::lifecycle::{
    LifecycleSettings, SessionLifecycleManager, SessionView, SpawnReport, SpawnResolution,
    StopOutcome, StoppedSession, TeardownJob, TeardownReport,
};
use crate::notify::{ClientChannel, EventReceiver};
use crate::queue::{
    EnqueueRequest, Enqueued, Placement, QueueEntryView, QueueStateMachine, Removal,
};
use crate::rate_limit::RateLimiter;
use crate::sandbox::SandboxProvider;
use crate::telemetry::{Telemetry, TelemetrySnapshot};

const INTENT_BUFFER: usize = 1024;

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub max_queue_size: usize,
    pub heartbeat_grace: Duration,
    pub outbound_buffer: usize,
    pub lifecycle: LifecycleSettings,
}

/// Everything the broker is built from.
pub struct BrokerParts {
    pub settings: BrokerSettings,
    pub provider: Arc<dyn SandboxProvider>,
    pub invites: InviteTokenService,
    pub connect_limiter: Arc<RateLimiter>,
    pub invite_limiter: Arc<RateLimiter>,
    pub telemetry: Arc<Telemetry>,
    pub clock: SharedClock,
}

// ── Intents ───────────────────────────────────────────────────────────────────

pub enum Intent {
    Connect {
        origin: String,
        reply: oneshot::Sender<Connected>,
    },
    Enqueue {
        client: ClientId,
        invite_token: Option<String>,
        reply: Option<oneshot::Sender<Result<Placement, ErrorKind>>>,
    },
    Heartbeat {
        client: ClientId,
    },
    EndSession {
        client: ClientId,
    },
    Disconnect {
        client: ClientId,
    },
    Sweep {
        reply: Option<oneshot::Sender<SweepReport>>,
    },
    SpawnCompleted(SpawnReport),
    TeardownCompleted(TeardownReport),
    Snapshot {
        reply: oneshot::Sender<BrokerSnapshot>,
    },
    /// Operator ends the active session.
    ForceEnd {
        reply: oneshot::Sender<Option<SessionId>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// A new connection: its id and the events the broker will push to it.
///
/// A refused connection still gets its events: the error, then end of
/// stream. It is never tracked as idle.
pub struct Connected {
    pub client_id: ClientId,
    pub events: EventReceiver,
    pub refused: Option<ErrorKind>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub timed_out: bool,
    pub crashed: bool,
    pub stale_clients: Vec<ClientId>,
    pub pruned_buckets: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BrokerSnapshot {
    pub active: Option<SessionView>,
    pub last_session: Option<SessionView>,
    pub queue: Vec<QueueEntryView>,
    pub max_queue_size: usize,
    pub idle_connections: usize,
    pub shutting_down: bool,
    pub telemetry: TelemetrySnapshot,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker has stopped")]
    Closed,
}

// ── Handle ────────────────────────────────────────────────────────────────────

/// Cheap to clone. Every method submits one intent.
#[derive(Clone)]
pub struct BrokerHandle {
    tx: mpsc::Sender<Intent>,
}

impl BrokerHandle {
    async fn submit(&self, intent: Intent) -> Result<(), BrokerError> {
        self.tx.send(intent).await.map_err(|_| BrokerError::Closed)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Intent) -> Result<T, BrokerError> {
        let (reply, rx) = oneshot::channel();
        self.submit(make(reply)).await?;
        rx.await.map_err(|_| BrokerError::Closed)
    }

    pub async fn connect(&self, origin: impl Into<String>) -> Result<Connected, BrokerError> {
        let origin = origin.into();
        self.request(|reply| Intent::Connect { origin, reply }).await
    }

    /// Enqueue and wait for the decision. The client is also told through
    /// its event channel.
    pub async fn enqueue(
        &self,
        client: ClientId,
        invite_token: Option<String>,
    ) -> Result<Result<Placement, ErrorKind>, BrokerError> {
        self.request(|reply| Intent::Enqueue {
            client,
            invite_token,
            reply: Some(reply),
        })
        .await
    }

    pub async fn heartbeat(&self, client: ClientId) -> Result<(), BrokerError> {
        self.submit(Intent::Heartbeat { client }).await
    }

    pub async fn end_session(&self, client: ClientId) -> Result<(), BrokerError> {
        self.submit(Intent::EndSession { client }).await
    }

    pub async fn disconnect(&self, client: ClientId) -> Result<(), BrokerError> {
        self.submit(Intent::Disconnect { client }).await
    }

    pub async fn sweep(&self) -> Result<SweepReport, BrokerError> {
        self.request(|reply| Intent::Sweep { reply: Some(reply) }).await
    }

    pub async fn snapshot(&self) -> Result<BrokerSnapshot, BrokerError> {
        self.request(|reply| Intent::Snapshot { reply }).await
    }

    pub async fn force_end(&self) -> Result<Option<SessionId>, BrokerError> {
        self.request(|reply| Intent::ForceEnd { reply }).await
    }

    /// Abort the queue, stop the session, and wait for its teardown.
    pub async fn shutdown(&self) -> Result<(), BrokerError> {
        self.request(|reply| Intent::Shutdown { reply }).await
    }
}

// ── Broker ────────────────────────────────────────────────────────────────────

struct IdleConnection {
    channel: ClientChannel,
    origin: String,
    last_seen_at: u64,
}

pub struct Broker {
    queue: QueueStateMachine,
    connect_limiter: Arc<RateLimiter>,
    lifecycle: SessionLifecycleManager,
    idle: HashMap<ClientId, IdleConnection>,
    next_client: u64,
    settings: BrokerSettings,
    telemetry: Arc<Telemetry>,
    clock: SharedClock,
    tx: mpsc::Sender<Intent>,
    rx: mpsc::Receiver<Intent>,
    shutdown_waiters: Vec<oneshot::Sender<()>>,
    shutting_down: bool,
}

impl Broker {
    pub fn new(parts: BrokerParts) -> (Self, BrokerHandle) {
        let (tx, rx) = mpsc::channel(INTENT_BUFFER);
        let queue = QueueStateMachine::new(
            parts.settings.max_queue_size,
            parts.invite_limiter,
            parts.invites,
        );
        let lifecycle = SessionLifecycleManager::new(
            parts.provider,
            parts.settings.lifecycle.clone(),
            parts.clock.clone(),
        );
        let broker = Self {
            queue,
            connect_limiter: parts.connect_limiter,
            lifecycle,
            idle: HashMap::new(),
            next_client: 0,
            settings: parts.settings,
            telemetry: parts.telemetry,
            clock: parts.clock,
            tx: tx.clone(),
            rx,
            shutdown_waiters: Vec::new(),
            shutting_down: false,
        };
        (broker, BrokerHandle { tx })
    }

    /// Build and run on a new task.
    pub fn spawn(parts: BrokerParts) -> (BrokerHandle, tokio::task::JoinHandle<()>) {
        let (broker, handle) = Self::new(parts);
        let join = tokio::spawn(broker.run());
        (handle, join)
    }

    pub async fn run(mut self) {
        tracing::info!(max_queue = self.settings.max_queue_size, "broker started");
        while let Some(intent) = self.rx.recv().await {
            self.handle(intent);
            self.publish_gauges();
            if self.finished() {
                break;
            }
        }
        tracing::info!("broker stopped");
    }

    fn handle(&mut self, intent: Intent) {
        match intent {
            Intent::Connect { origin, reply } => {
                if self.shutting_down {
                    return;
                }
                let connected = self.on_connect(origin);
                if let Err(lost) = reply.send(connected) {
                    self.idle.remove(&lost.client_id);
                }
            }
            Intent::Enqueue {
                client,
                invite_token,
                reply,
            } => {
                let result = self.on_enqueue(client, invite_token);
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            Intent::Heartbeat { client } => self.on_heartbeat(client),
            Intent::EndSession { client } => self.on_end_session(client),
            Intent::Disconnect { client } => self.on_disconnect(client),
            Intent::Sweep { reply } => {
                let report = self.on_sweep();
                if let Some(reply) = reply {
                    let _ = reply.send(report);
                }
            }
            Intent::SpawnCompleted(report) => self.on_spawn_completed(report),
            Intent::TeardownCompleted(report) => self.on_teardown_completed(report),
            Intent::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Intent::ForceEnd { reply } => {
                let ended = self.stop_active(EndReason::QueueAborted, None);
                let _ = reply.send(ended);
            }
            Intent::Shutdown { reply } => {
                self.shutdown_waiters.push(reply);
                self.begin_shutdown();
            }
        }
        self.queue.notify_positions();
    }

    // ── Connections ───────────────────────────────────────────────────────────

    fn on_connect(&mut self, origin: String) -> Connected {
        self.next_client += 1;
        let client_id = ClientId(self.next_client);
        let (mut channel, events) = ClientChannel::pair(client_id, self.settings.outbound_buffer);
        if !self.connect_limiter.allow(&origin) {
            let kind = ErrorKind::RateLimited;
            tracing::info!(client = %client_id, origin = %origin, "connection refused");
            self.telemetry.enqueue_rejected(kind);
            channel.send(ServerEvent::error(kind, "too many connections from this origin"));
            return Connected {
                client_id,
                events,
                refused: Some(kind),
            };
        }
        channel.send(ServerEvent::Welcome { client_id });
        tracing::debug!(client = %client_id, origin = %origin, "client connected");
        self.idle.insert(
            client_id,
            IdleConnection {
                channel,
                origin,
                last_seen_at: self.clock.now_ms(),
            },
        );
        Connected {
            client_id,
            events,
            refused: None,
        }
    }

    fn on_enqueue(&mut self, client: ClientId, invite_token: Option<String>) -> Result<Placement, ErrorKind> {
        let span = tracing::info_span!("admission", client = %client);
        let _guard = span.enter();

        if let Some(placement) = self.queue.placement(client) {
            return Ok(placement);
        }
        let Some(conn) = self.idle.remove(&client) else {
            return Err(ErrorKind::ChannelDisconnected);
        };
        if self.shutting_down {
            return Err(self.refuse(client, conn, ErrorKind::QueueFull, "broker is shutting down"));
        }

        let origin = conn.origin.clone();
        let request = EnqueueRequest {
            id: client,
            origin: conn.origin,
            channel: conn.channel,
            invite_token,
        };
        match self.queue.enqueue(request, self.clock.now_ms()) {
            Ok(Enqueued::Queued { position }) => {
                self.admit_next();
                Ok(self.queue.placement(client).unwrap_or(Placement::Waiting { position }))
            }
            Ok(Enqueued::Existing { placement, channel }) => {
                // Unreachable after the check above; keep the connection anyway.
                self.return_to_idle(channel, origin);
                Ok(placement)
            }
            Err(rejected) => {
                let kind = rejected.error.kind();
                let message = rejected.error.to_string();
                tracing::info!(kind = kind.as_str(), "enqueue rejected");
                let conn = IdleConnection {
                    channel: rejected.channel,
                    origin,
                    last_seen_at: self.clock.now_ms(),
                };
                Err(self.refuse(client, conn, kind, &message))
            }
        }
    }

    fn refuse(&mut self, client: ClientId, mut conn: IdleConnection, kind: ErrorKind, message: &str) -> ErrorKind {
        self.telemetry.enqueue_rejected(kind);
        conn.channel.send(ServerEvent::error(kind, message));
        self.idle.insert(client, conn);
        kind
    }

    fn on_heartbeat(&mut self, client: ClientId) {
        let now = self.clock.now_ms();
        if !self.queue.heartbeat(client, now) {
            if let Some(conn) = self.idle.get_mut(&client) {
                conn.last_seen_at = now;
            }
        }
    }

    fn on_end_session(&mut self, client: ClientId) {
        match self.queue.remove_client(client) {
            Removal::TeardownRequired => {
                self.stop_active(EndReason::ClientEnded, None);
            }
            Removal::Left(entry) => self.return_to_idle(entry.connection, entry.origin),
            Removal::NotFound => {}
        }
    }

    fn on_disconnect(&mut self, client: ClientId) {
        if self.idle.remove(&client).is_some() {
            tracing::debug!(client = %client, "idle client disconnected");
            return;
        }
        match self.queue.remove_client(client) {
            Removal::TeardownRequired => {
                tracing::info!(client = %client, "active client disconnected");
                self.queue.mark_disconnected(client);
                self.stop_active(EndReason::ClientEnded, None);
            }
            Removal::Left(_) => {}
            Removal::NotFound => {}
        }
    }

    fn return_to_idle(&mut self, channel: ClientChannel, origin: String) {
        if self.shutting_down || channel.is_closed() {
            return;
        }
        self.idle.insert(
            channel.client_id(),
            IdleConnection {
                channel,
                origin,
                last_seen_at: self.clock.now_ms(),
            },
        );
    }

    // ── Admission and sessions ────────────────────────────────────────────────

    /// Hand the slot to the head of the line, if it is free.
    fn admit_next(&mut self) {
        if self.shutting_down || !self.lifecycle.is_idle() {
            return;
        }
        let Some(client) = self.queue.try_admit_next() else {
            return;
        };
        let now = self.clock.now_ms();
        if let Some(entry) = self.queue.entry(client) {
            self.telemetry
                .queue_wait(Duration::from_millis(now.saturating_sub(entry.enqueued_at)));
        }
        match self.lifecycle.start(client) {
            Ok(job) => {
                tracing::info!(client = %client, session = %job.session_id, "client admitted");
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let report = job.run().await;
                    let _ = tx.send(Intent::SpawnCompleted(report)).await;
                });
            }
            Err(e) => {
                // is_idle() was checked above, so this means a bookkeeping bug.
                tracing::error!(client = %client, error = %e, "admission without a free slot");
                if let Some(entry) = self.queue.finish_active() {
                    self.return_to_idle(entry.connection, entry.origin);
                }
            }
        }
    }

    fn on_spawn_completed(&mut self, report: SpawnReport) {
        self.telemetry.spawn_duration(report.elapsed);
        match self.lifecycle.spawn_completed(report.session_id, report.result) {
            SpawnResolution::Running {
                session_id,
                owner,
                connection,
                deadline,
            } => {
                self.telemetry.session_started();
                self.queue.send_to(
                    owner,
                    ServerEvent::SessionGranted {
                        session_id,
                        connection,
                        deadline_ms: deadline,
                    },
                );
            }
            SpawnResolution::Failed { stopped, error } => {
                self.telemetry.spawn_failed();
                self.queue.send_to(
                    stopped.owner,
                    ServerEvent::error(ErrorKind::SpawnFailed, error.to_string()),
                );
                self.release_slot(stopped);
            }
            SpawnResolution::Teardown(job) => self.start_teardown(job),
            SpawnResolution::Stopped(stopped) => self.release_slot(stopped),
            SpawnResolution::Stale(job) => {
                if let Some(job) = job {
                    tokio::spawn(job.run());
                }
            }
        }
    }

    fn on_teardown_completed(&mut self, report: TeardownReport) {
        self.telemetry.teardown_duration(report.elapsed);
        if let Some(stopped) = self.lifecycle.teardown_completed(report.session_id) {
            self.release_slot(stopped);
        }
    }

    /// Stop the current session. Returns its id if there was one.
    fn stop_active(&mut self, reason: EndReason, notice: Option<ErrorKind>) -> Option<SessionId> {
        let session_id = self.lifecycle.current().map(|s| s.id)?;
        let outcome = self.lifecycle.stop(session_id, reason);
        self.apply_stop(outcome, reason, notice);
        Some(session_id)
    }

    fn start_teardown(&self, job: TeardownJob) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let report = job.run().await;
            let _ = tx.send(Intent::TeardownCompleted(report)).await;
        });
    }

    /// The session is Stopped: end its owner, then admit the next client.
    fn release_slot(&mut self, stopped: StoppedSession) {
        self.telemetry.session_ended(stopped.reason, stopped.ran_for);
        if let Some(entry) = self.queue.finish_active() {
            debug_assert_eq!(entry.id, stopped.owner);
            if !entry.disconnected {
                self.return_to_idle(entry.connection, entry.origin);
            }
        }
        self.admit_next();
    }

    // ── Sweep ─────────────────────────────────────────────────────────────────

    fn on_sweep(&mut self) -> SweepReport {
        let now = self.clock.now_ms();
        let mut report = SweepReport::default();

        if let Some(outcome) = self.lifecycle.heartbeat_check(now) {
            report.timed_out = true;
            self.apply_stop(outcome, EndReason::Timeout, None);
        }
        if let Some(outcome) = self.lifecycle.probe() {
            report.crashed = true;
            self.telemetry.sandbox_crashed();
            self.apply_stop(outcome, EndReason::Error, Some(ErrorKind::SandboxCrash));
        }

        let grace = self.settings.heartbeat_grace.as_millis() as u64;
        for client in self.queue.stale_clients(now, grace) {
            tracing::info!(client = %client, "no heartbeat within grace period");
            report.stale_clients.push(client);
            self.on_disconnect(client);
        }
        let stale_idle: Vec<ClientId> = self
            .idle
            .iter()
            .filter(|(_, c)| now.saturating_sub(c.last_seen_at) > grace || c.channel.is_closed())
            .map(|(id, _)| *id)
            .collect();
        for client in stale_idle {
            report.stale_clients.push(client);
            self.idle.remove(&client);
        }

        report.pruned_buckets = self.connect_limiter.prune() + self.queue.invite_limiter().prune();
        self.admit_next();
        report
    }

    /// Notify the owner of a stop the lifecycle manager already decided on.
    fn apply_stop(&mut self, outcome: StopOutcome, reason: EndReason, notice: Option<ErrorKind>) {
        let Some((session_id, owner)) = self.lifecycle.current().map(|s| (s.id, s.owner)) else {
            return;
        };
        if matches!(outcome, StopOutcome::NoOp) {
            return;
        }
        if let Some(kind) = notice {
            self.queue
                .send_to(owner, ServerEvent::error(kind, format!("session ended: {}", kind.as_str())));
        }
        self.queue
            .send_to(owner, ServerEvent::SessionEnding { session_id, reason });
        if let StopOutcome::Teardown(job) = outcome {
            self.start_teardown(job);
        }
    }

    // ── Shutdown ──────────────────────────────────────────────────────────────

    /// Waiting and idle clients are told why before their channels drop.
    fn begin_shutdown(&mut self) {
        if !self.shutting_down {
            self.shutting_down = true;
            let notice = || ServerEvent::error(ErrorKind::QueueFull, "broker is shutting down");
            let drained = self.queue.drain_waiting();
            let waiting = drained.len();
            for mut entry in drained {
                entry.connection.send(notice());
            }
            let idle = self.idle.len();
            for (_, mut conn) in self.idle.drain() {
                conn.channel.send(notice());
            }
            tracing::info!(waiting, idle, "shutting down, queue aborted");
        }
        self.stop_active(EndReason::QueueAborted, None);
    }

    fn finished(&mut self) -> bool {
        if !self.shutting_down || !self.lifecycle.is_idle() {
            return false;
        }
        for waiter in self.shutdown_waiters.drain(..) {
            let _ = waiter.send(());
        }
        true
    }

    // ── Views ─────────────────────────────────────────────────────────────────

    fn publish_gauges(&self) {
        self.telemetry.set_queue_length(self.queue.waiting_len());
        self.telemetry
            .set_active_sessions(usize::from(!self.lifecycle.is_idle()));
    }

    fn snapshot(&self) -> BrokerSnapshot {
        BrokerSnapshot {
            active: self.lifecycle.current_view(),
            last_session: self.lifecycle.last_view(),
            queue: self.queue.view(),
            max_queue_size: self.queue.max_size(),
            idle_connections: self.idle.len(),
            shutting_down: self.shutting_down,
            telemetry: self.telemetry.snapshot(),
        }
    }
}
