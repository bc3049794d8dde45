//! Telemetry — metrics for the broker, readable without asking the broker.
//!
//! Everything is recorded twice: into atomics that back `snapshot()` (the
//! admin API's pull view) and through the `metrics` facade for whatever
//! recorder the daemon installs. Nothing here feeds back into control flow.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use lobby_core::{EndReason, ErrorKind};

pub const QUEUE_LENGTH: &str = "lobby_queue_length";
pub const ACTIVE_SESSIONS: &str = "lobby_active_sessions";
pub const SESSIONS_STARTED: &str = "lobby_sessions_started_total";
pub const SESSIONS_ENDED: &str = "lobby_sessions_ended_total";
pub const ENQUEUE_REJECTED: &str = "lobby_enqueue_rejected_total";
pub const SESSION_DURATION: &str = "lobby_session_duration_seconds";
pub const QUEUE_WAIT: &str = "lobby_queue_wait_seconds";
pub const SPAWN_DURATION: &str = "lobby_sandbox_spawn_seconds";
pub const TEARDOWN_DURATION: &str = "lobby_sandbox_teardown_seconds";

/// Register descriptions with the installed recorder.
pub fn describe() {
    metrics::describe_gauge!(QUEUE_LENGTH, "Clients waiting for the sandbox");
    metrics::describe_gauge!(ACTIVE_SESSIONS, "Sessions not yet stopped (0 or 1)");
    metrics::describe_counter!(SESSIONS_STARTED, "Sessions that reached Running");
    metrics::describe_counter!(SESSIONS_ENDED, "Sessions that reached Stopped, by reason");
    metrics::describe_counter!(ENQUEUE_REJECTED, "Refused connections and enqueue attempts, by kind");
    metrics::describe_histogram!(SESSION_DURATION, metrics::Unit::Seconds, "Time spent Running");
    metrics::describe_histogram!(QUEUE_WAIT, metrics::Unit::Seconds, "Enqueue to admission");
    metrics::describe_histogram!(SPAWN_DURATION, metrics::Unit::Seconds, "Sandbox spawn latency");
    metrics::describe_histogram!(TEARDOWN_DURATION, metrics::Unit::Seconds, "Sandbox teardown latency");
}

#[derive(Default)]
pub struct Telemetry {
    queue_length: AtomicU64,
    active_sessions: AtomicU64,
    sessions_started: AtomicU64,
    sessions_ended: AtomicU64,
    sessions_timed_out: AtomicU64,
    sandbox_crashes: AtomicU64,
    spawn_failures: AtomicU64,
    enqueue_rejected: AtomicU64,
    last_spawn_ms: AtomicU64,
    last_teardown_ms: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TelemetrySnapshot {
    pub queue_length: u64,
    pub active_sessions: u64,
    pub sessions_started: u64,
    pub sessions_ended: u64,
    pub sessions_timed_out: u64,
    pub sandbox_crashes: u64,
    pub spawn_failures: u64,
    pub enqueue_rejected: u64,
    pub last_spawn_ms: u64,
    pub last_teardown_ms: u64,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_queue_length(&self, n: usize) {
        self.queue_length.store(n as u64, Ordering::Relaxed);
        metrics::gauge!(QUEUE_LENGTH).set(n as f64);
    }

    pub fn set_active_sessions(&self, n: usize) {
        self.active_sessions.store(n as u64, Ordering::Relaxed);
        metrics::gauge!(ACTIVE_SESSIONS).set(n as f64);
    }

    pub fn session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(SESSIONS_STARTED).increment(1);
    }

    pub fn session_ended(&self, reason: EndReason, ran_for: Duration) {
        self.sessions_ended.fetch_add(1, Ordering::Relaxed);
        if reason == EndReason::Timeout {
            self.sessions_timed_out.fetch_add(1, Ordering::Relaxed);
        }
        metrics::counter!(SESSIONS_ENDED, "reason" => reason.as_str()).increment(1);
        if !ran_for.is_zero() {
            metrics::histogram!(SESSION_DURATION).record(ran_for.as_secs_f64());
        }
    }

    pub fn sandbox_crashed(&self) {
        self.sandbox_crashes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn spawn_failed(&self) {
        self.spawn_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn enqueue_rejected(&self, kind: ErrorKind) {
        self.enqueue_rejected.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(ENQUEUE_REJECTED, "kind" => kind.as_str()).increment(1);
    }

    pub fn queue_wait(&self, waited: Duration) {
        metrics::histogram!(QUEUE_WAIT).record(waited.as_secs_f64());
    }

    pub fn spawn_duration(&self, elapsed: Duration) {
        self.last_spawn_ms.store(elapsed.as_millis() as u64, Ordering::Relaxed);
        metrics::histogram!(SPAWN_DURATION).record(elapsed.as_secs_f64());
    }

    pub fn teardown_duration(&self, elapsed: Duration) {
        self.last_teardown_ms.store(elapsed.as_millis() as u64, Ordering::Relaxed);
        metrics::histogram!(TEARDOWN_DURATION).record(elapsed.as_secs_f64());
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            queue_length: self.queue_length.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            sessions_ended: self.sessions_ended.load(Ordering::Relaxed),
            sessions_timed_out: self.sessions_timed_out.load(Ordering::Relaxed),
            sandbox_crashes: self.sandbox_crashes.load(Ordering::Relaxed),
            spawn_failures: self.spawn_failures.load(Ordering::Relaxed),
            enqueue_rejected: self.enqueue_rejected.load(Ordering::Relaxed),
            last_spawn_ms: self.last_spawn_ms.load(Ordering::Relaxed),
            last_teardown_ms: self.last_teardown_ms.load(Ordering::Relaxed),
        }
    }
}
