//! Session lifecycle — the single active sandbox and its teardown.
//!
//! ```text
//!   Starting ──▶ Running ──▶ Stopping ──▶ Stopped
//!      │                        ▲
//!      ├── spawn failed ────────┼──────────▶ Stopped
//!      └── stop while spawning ─┘
//! ```
//!
//! State changes happen synchronously inside the broker. The slow halves
//! (provider spawn and terminate) are handed out as `SpawnJob` and
//! `TeardownJob`, run on their own tasks, and come back as
//! `spawn_completed` / `teardown_completed`. The manager never holds more
//! than one session that is not Stopped.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::Instrument;

use lobby_core::{ClientId, EndReason, SessionId, SharedClock};

use crate::sandbox::{ResourceLimits, SandboxError, SandboxHandle, SandboxProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub owner: ClientId,
    pub started_at: u64,
    pub deadline: u64,
    pub status: SessionStatus,
    pub connection: Option<String>,
    pub end_reason: Option<EndReason>,
    /// Stopped because the liveness probe failed.
    pub crashed: bool,
    sandbox: Option<SandboxHandle>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub session_id: SessionId,
    pub owner: ClientId,
    pub status: SessionStatus,
    pub started_at: u64,
    pub deadline: u64,
    pub connection: Option<String>,
    pub end_reason: Option<EndReason>,
    pub crashed: bool,
    pub ended_at: Option<u64>,
}

impl Session {
    fn view(&self, ended_at: Option<u64>) -> SessionView {
        SessionView {
            session_id: self.id,
            owner: self.owner,
            status: self.status,
            started_at: self.started_at,
            deadline: self.deadline,
            connection: self.connection.clone(),
            end_reason: self.end_reason,
            crashed: self.crashed,
            ended_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub max_duration: Duration,
    pub spawn_timeout: Duration,
    pub limits: ResourceLimits,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("session {0} is still {1:?}")]
    Busy(SessionId, SessionStatus),
}

// ── Jobs handed to the runtime ────────────────────────────────────────────────

pub struct SpawnJob {
    pub session_id: SessionId,
    pub owner: ClientId,
    provider: Arc<dyn SandboxProvider>,
    limits: ResourceLimits,
    timeout: Duration,
}

pub struct SpawnReport {
    pub session_id: SessionId,
    pub result: Result<SandboxHandle, SandboxError>,
    pub elapsed: Duration,
}

impl SpawnJob {
    pub async fn run(self) -> SpawnReport {
        let span = tracing::info_span!("sandbox_spawn", session = %self.session_id, client = %self.owner);
        async move {
            let start = Instant::now();
            let result =
                match tokio::time::timeout(self.timeout, self.provider.spawn(self.session_id, &self.limits)).await {
                    Ok(r) => r,
                    Err(_) => {
                        if let Err(e) = self.provider.reclaim(self.session_id).await {
                            tracing::warn!(error = %e, "reclaim after spawn timeout failed");
                        }
                        Err(SandboxError::Timeout(self.timeout))
                    }
                };
            let elapsed = start.elapsed();
            match &result {
                Ok(h) => tracing::info!(connection = %h.connection, elapsed_ms = elapsed.as_millis() as u64, "sandbox up"),
                Err(e) => tracing::warn!(error = %e, "sandbox spawn failed"),
            }
            SpawnReport {
                session_id: self.session_id,
                result,
                elapsed,
            }
        }
        .instrument(span)
        .await
    }
}

pub struct TeardownJob {
    pub session_id: SessionId,
    handle: SandboxHandle,
    provider: Arc<dyn SandboxProvider>,
}

pub struct TeardownReport {
    pub session_id: SessionId,
    pub elapsed: Duration,
}

impl TeardownJob {
    pub async fn run(self) -> TeardownReport {
        let span = tracing::info_span!("sandbox_teardown", session = %self.session_id);
        async move {
            let start = Instant::now();
            if let Err(e) = self.provider.terminate(self.handle).await {
                tracing::error!(error = %e, "sandbox teardown reported an error");
            }
            let elapsed = start.elapsed();
            tracing::info!(elapsed_ms = elapsed.as_millis() as u64, "sandbox released");
            TeardownReport {
                session_id: self.session_id,
                elapsed,
            }
        }
        .instrument(span)
        .await
    }
}

// ── Outcomes ──────────────────────────────────────────────────────────────────

/// A session that reached Stopped.
#[derive(Debug, Clone)]
pub struct StoppedSession {
    pub session_id: SessionId,
    pub owner: ClientId,
    pub reason: EndReason,
    pub crashed: bool,
    /// Time spent Running. Zero if it never got there.
    pub ran_for: Duration,
}

pub enum SpawnResolution {
    Running {
        session_id: SessionId,
        owner: ClientId,
        connection: String,
        deadline: u64,
    },
    /// Starting → Stopped. The slot is free again.
    Failed {
        stopped: StoppedSession,
        error: SandboxError,
    },
    /// A stop arrived while spawning; the new sandbox must go at once.
    Teardown(TeardownJob),
    /// A stop arrived while spawning and the spawn failed anyway.
    Stopped(StoppedSession),
    /// Report for a session that is no longer current.
    Stale(Option<TeardownJob>),
}

pub enum StopOutcome {
    Teardown(TeardownJob),
    /// Stop recorded; the teardown starts once the spawn reports back.
    AwaitingSpawn,
    /// Already Stopping or Stopped, or not the current session.
    NoOp,
}

// ── Manager ───────────────────────────────────────────────────────────────────

pub struct SessionLifecycleManager {
    provider: Arc<dyn SandboxProvider>,
    settings: LifecycleSettings,
    clock: SharedClock,
    current: Option<Session>,
    running_since: Option<u64>,
    last: Option<SessionView>,
}

impl SessionLifecycleManager {
    pub fn new(provider: Arc<dyn SandboxProvider>, settings: LifecycleSettings, clock: SharedClock) -> Self {
        Self {
            provider,
            settings,
            clock,
            current: None,
            running_since: None,
            last: None,
        }
    }

    /// Open a session for a client the queue has just made Active.
    pub fn start(&mut self, owner: ClientId) -> Result<SpawnJob, LifecycleError> {
        if let Some(s) = &self.current {
            return Err(LifecycleError::Busy(s.id, s.status));
        }
        let now = self.clock.now_ms();
        let session = Session {
            id: SessionId::generate(),
            owner,
            started_at: now,
            deadline: now + self.settings.max_duration.as_millis() as u64,
            status: SessionStatus::Starting,
            connection: None,
            end_reason: None,
            crashed: false,
            sandbox: None,
        };
        let job = SpawnJob {
            session_id: session.id,
            owner,
            provider: self.provider.clone(),
            limits: self.settings.limits,
            timeout: self.settings.spawn_timeout,
        };
        tracing::info!(session = %session.id, client = %owner, "session starting");
        self.current = Some(session);
        Ok(job)
    }

    pub fn spawn_completed(
        &mut self,
        session_id: SessionId,
        result: Result<SandboxHandle, SandboxError>,
    ) -> SpawnResolution {
        let Some(session) = self.current.as_mut().filter(|s| s.id == session_id) else {
            tracing::warn!(session = %session_id, "spawn report for a session that is gone");
            return SpawnResolution::Stale(result.ok().map(|handle| TeardownJob {
                session_id,
                handle,
                provider: self.provider.clone(),
            }));
        };

        match (session.status, result) {
            (SessionStatus::Starting, Ok(handle)) => {
                let now = self.clock.now_ms();
                session.status = SessionStatus::Running;
                session.started_at = now;
                session.deadline = now + self.settings.max_duration.as_millis() as u64;
                session.connection = Some(handle.connection.clone());
                session.sandbox = Some(handle);
                self.running_since = Some(now);
                tracing::info!(session = %session_id, deadline = session.deadline, "session running");
                SpawnResolution::Running {
                    session_id,
                    owner: session.owner,
                    connection: session.connection.clone().unwrap_or_default(),
                    deadline: session.deadline,
                }
            }
            (SessionStatus::Starting, Err(error)) => {
                session.status = SessionStatus::Stopped;
                session.end_reason = Some(EndReason::Error);
                match self.retire() {
                    Some(stopped) => SpawnResolution::Failed { stopped, error },
                    None => SpawnResolution::Stale(None),
                }
            }
            (SessionStatus::Stopping, Ok(handle)) => {
                tracing::info!(session = %session_id, "stopped while starting, releasing new sandbox");
                SpawnResolution::Teardown(TeardownJob {
                    session_id,
                    handle,
                    provider: self.provider.clone(),
                })
            }
            (SessionStatus::Stopping, Err(_)) => {
                session.status = SessionStatus::Stopped;
                match self.retire() {
                    Some(stopped) => SpawnResolution::Stopped(stopped),
                    None => SpawnResolution::Stale(None),
                }
            }
            (_, result) => SpawnResolution::Stale(result.ok().map(|handle| TeardownJob {
                session_id,
                handle,
                provider: self.provider.clone(),
            })),
        }
    }

    /// Idempotent. Only the first call for a session has any effect.
    pub fn stop(&mut self, session_id: SessionId, reason: EndReason) -> StopOutcome {
        let Some(session) = self.current.as_mut().filter(|s| s.id == session_id) else {
            return StopOutcome::NoOp;
        };
        match session.status {
            SessionStatus::Starting => {
                session.status = SessionStatus::Stopping;
                session.end_reason = Some(reason);
                tracing::info!(session = %session_id, reason = reason.as_str(), "stop requested during spawn");
                StopOutcome::AwaitingSpawn
            }
            SessionStatus::Running => {
                session.status = SessionStatus::Stopping;
                session.end_reason = Some(reason);
                tracing::info!(session = %session_id, reason = reason.as_str(), "session stopping");
                match session.sandbox.take() {
                    Some(handle) => StopOutcome::Teardown(TeardownJob {
                        session_id,
                        handle,
                        provider: self.provider.clone(),
                    }),
                    None => StopOutcome::AwaitingSpawn,
                }
            }
            SessionStatus::Stopping | SessionStatus::Stopped => StopOutcome::NoOp,
        }
    }

    /// The sandbox is gone. Stopping → Stopped.
    pub fn teardown_completed(&mut self, session_id: SessionId) -> Option<StoppedSession> {
        let session = self.current.as_mut().filter(|s| s.id == session_id)?;
        if session.status != SessionStatus::Stopping {
            return None;
        }
        session.status = SessionStatus::Stopped;
        self.retire()
    }

    /// Stop the Running session if its deadline has passed.
    pub fn heartbeat_check(&mut self, now: u64) -> Option<StopOutcome> {
        let session = self.current.as_ref()?;
        if session.status != SessionStatus::Running || now < session.deadline {
            return None;
        }
        let id = session.id;
        tracing::info!(session = %id, overdue_ms = now - session.deadline, "session deadline reached");
        Some(self.stop(id, EndReason::Timeout))
    }

    /// Liveness probe. A dead sandbox is stopped like any other end.
    pub fn probe(&mut self) -> Option<StopOutcome> {
        let session = self.current.as_mut()?;
        if session.status != SessionStatus::Running {
            return None;
        }
        let handle = session.sandbox.as_mut()?;
        if self.provider.is_alive(handle) {
            return None;
        }
        session.crashed = true;
        let id = session.id;
        tracing::warn!(session = %id, "sandbox died");
        Some(self.stop(id, EndReason::Error))
    }

    fn retire(&mut self) -> Option<StoppedSession> {
        let session = self.current.take()?;
        let now = self.clock.now_ms();
        let ran_for = self
            .running_since
            .take()
            .map(|since| Duration::from_millis(now.saturating_sub(since)))
            .unwrap_or_default();
        let stopped = StoppedSession {
            session_id: session.id,
            owner: session.owner,
            reason: session.end_reason.unwrap_or(EndReason::Error),
            crashed: session.crashed,
            ran_for,
        };
        tracing::info!(
            session = %session.id,
            client = %session.owner,
            reason = stopped.reason.as_str(),
            ran_ms = ran_for.as_millis() as u64,
            "session stopped"
        );
        self.last = Some(session.view(Some(now)));
        Some(stopped)
    }

    // ── Queries ───────────────────────────────────────────────────────────────

    /// True when no session exists, i.e. the next client may be admitted.
    pub fn is_idle(&self) -> bool {
        self.current.is_none()
    }

    pub fn current(&self) -> Option<&Session> {
        self.current.as_ref()
    }

    pub fn current_view(&self) -> Option<SessionView> {
        self.current.as_ref().map(|s| s.view(None))
    }

    pub fn last_view(&self) -> Option<SessionView> {
        self.last.clone()
    }

    pub fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }
}
