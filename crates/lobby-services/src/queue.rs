//! Queue state machine — FIFO admission with a single active slot.
//!
//! Owns every enqueued `ClientEntry` and the connection each one carries.
//! Waiting order lives in a `VecDeque` with a position index beside it, so
//! `position_of` is a map lookup; the index is rebuilt whenever the order
//! changes.
//!
//! Entry transitions:
//!   Waiting → Active → Ended
//!   Waiting → Ended
//!
//! An Active entry stays Active until the broker reports its sandbox is
//! gone (`finish_active`), so the slot cannot be handed to anyone else while
//! a teardown is still running.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use lobby_core::{ClientId, ErrorKind, InviteScope, ServerEvent};

use crate::invite::{InviteTokenService, TokenError};
use crate::notify::ClientChannel;
use crate::rate_limit::RateLimiter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientState {
    Waiting,
    Active,
    Ended,
}

#[derive(Debug)]
pub struct ClientEntry {
    pub id: ClientId,
    pub connection: ClientChannel,
    pub origin: String,
    pub enqueued_at: u64,
    pub state: ClientState,
    pub last_seen_at: u64,
    pub priority: Option<InviteScope>,
    /// The connection closed while the entry was Active.
    pub disconnected: bool,
    last_notified: Option<(usize, usize)>,
}

/// What `placement` reports for an enqueued client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Placement {
    Waiting { position: usize },
    Active,
}

pub struct EnqueueRequest {
    pub id: ClientId,
    pub origin: String,
    pub channel: ClientChannel,
    pub invite_token: Option<String>,
}

#[derive(Debug)]
pub enum Enqueued {
    /// Newly added, waiting at this 1-based position.
    Queued { position: usize },
    /// Already present; the offered channel is handed back untouched.
    Existing {
        placement: Placement,
        channel: ClientChannel,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("too many attempts from this origin")]
    RateLimited,
    #[error("invite token rejected: {0}")]
    InvalidToken(TokenError),
    #[error("queue is full ({0} clients)")]
    QueueFull(usize),
}

impl QueueError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RateLimited => ErrorKind::RateLimited,
            Self::InvalidToken(_) => ErrorKind::InvalidToken,
            Self::QueueFull(_) => ErrorKind::QueueFull,
        }
    }
}

/// A refused enqueue. The connection goes back to the caller.
#[derive(Debug)]
pub struct EnqueueRejected {
    pub error: QueueError,
    pub channel: ClientChannel,
}

#[derive(Debug)]
pub enum Removal {
    /// A Waiting entry, now Ended and out of the queue.
    Left(ClientEntry),
    /// The Active entry. It stays until `finish_active`.
    TeardownRequired,
    NotFound,
}

/// Read-only view for the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct QueueEntryView {
    pub client_id: ClientId,
    pub state: ClientState,
    pub position: Option<usize>,
    pub origin: String,
    pub enqueued_at: u64,
    pub last_seen_at: u64,
    pub priority: Option<InviteScope>,
}

pub struct QueueStateMachine {
    max_size: usize,
    entries: HashMap<ClientId, ClientEntry>,
    waiting: VecDeque<ClientId>,
    index: HashMap<ClientId, usize>,
    active: Option<ClientId>,
    invite_limiter: Arc<RateLimiter>,
    invites: InviteTokenService,
}

impl QueueStateMachine {
    pub fn new(
        max_size: usize,
        invite_limiter: Arc<RateLimiter>,
        invites: InviteTokenService,
    ) -> Self {
        Self {
            max_size,
            entries: HashMap::new(),
            waiting: VecDeque::new(),
            index: HashMap::new(),
            active: None,
            invite_limiter,
            invites,
        }
    }

    // ── Admission ─────────────────────────────────────────────────────────────

    /// Add a client in the Waiting state.
    ///
    /// Checks, in order: already present (no-op), invite rate, token
    /// validity, capacity. Connection rate is checked once, at connect. A valid token puts the client at the
    /// front of the waiting line, behind earlier token holders; a `direct`
    /// token also ignores the ceiling.
    /// The token is consumed only once every other check has passed.
    pub fn enqueue(&mut self, req: EnqueueRequest, now: u64) -> Result<Enqueued, EnqueueRejected> {
        if let Some(placement) = self.placement(req.id) {
            return Ok(Enqueued::Existing {
                placement,
                channel: req.channel,
            });
        }

        let reject = |error: QueueError, channel: ClientChannel| EnqueueRejected { error, channel };

        let mut priority = None;
        if let Some(token) = req.invite_token.as_deref() {
            if !self.invite_limiter.allow(&req.origin) {
                return Err(reject(QueueError::RateLimited, req.channel));
            }
            match self.invites.inspect(token) {
                Ok(claims) => priority = Some(claims.scope),
                Err(e) => return Err(reject(QueueError::InvalidToken(e), req.channel)),
            }
        }

        let occupied = self.waiting.len() + usize::from(self.active.is_some());
        if priority != Some(InviteScope::Direct) && occupied >= self.max_size {
            return Err(reject(QueueError::QueueFull(self.max_size), req.channel));
        }

        if let Some(token) = req.invite_token.as_deref() {
            if let Err(e) = self.invites.validate(token) {
                return Err(reject(QueueError::InvalidToken(e), req.channel));
            }
        }

        let entry = ClientEntry {
            id: req.id,
            connection: req.channel,
            origin: req.origin,
            enqueued_at: now,
            state: ClientState::Waiting,
            last_seen_at: now,
            priority,
            disconnected: false,
            last_notified: None,
        };
        self.entries.insert(req.id, entry);
        if priority.is_some() {
            // Behind earlier token holders, ahead of everyone else.
            let at = self
                .waiting
                .iter()
                .take_while(|id| self.entries.get(id).is_some_and(|e| e.priority.is_some()))
                .count();
            self.waiting.insert(at, req.id);
        } else {
            self.waiting.push_back(req.id);
        }
        self.rebuild_index();

        let position = self.index[&req.id] + 1;
        tracing::info!(
            client = %req.id,
            position,
            priority = priority.map(|p| p.as_str()),
            "client enqueued"
        );
        Ok(Enqueued::Queued { position })
    }

    /// Promote the head of the line if the slot is free.
    pub fn try_admit_next(&mut self) -> Option<ClientId> {
        if self.active.is_some() {
            return None;
        }
        let id = self.waiting.pop_front()?;
        self.rebuild_index();
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.state = ClientState::Active;
        }
        self.active = Some(id);
        debug_assert_eq!(
            self.entries
                .values()
                .filter(|e| e.state == ClientState::Active)
                .count(),
            1
        );
        Some(id)
    }

    /// Take a client out. Waiting entries leave at once; the Active entry
    /// waits for its teardown.
    pub fn remove_client(&mut self, id: ClientId) -> Removal {
        if self.active == Some(id) {
            return Removal::TeardownRequired;
        }
        if self.index.contains_key(&id) {
            self.waiting.retain(|w| *w != id);
            self.rebuild_index();
            if let Some(mut entry) = self.entries.remove(&id) {
                entry.state = ClientState::Ended;
                tracing::info!(client = %id, "client left queue");
                return Removal::Left(entry);
            }
        }
        Removal::NotFound
    }

    /// The active session has fully stopped: end its owner and free the slot.
    pub fn finish_active(&mut self) -> Option<ClientEntry> {
        let id = self.active.take()?;
        let mut entry = self.entries.remove(&id)?;
        entry.state = ClientState::Ended;
        Some(entry)
    }

    /// Remove every Waiting entry, front to back.
    pub fn drain_waiting(&mut self) -> Vec<ClientEntry> {
        let ids: Vec<ClientId> = self.waiting.drain(..).collect();
        self.index.clear();
        ids.into_iter()
            .filter_map(|id| self.entries.remove(&id))
            .map(|mut e| {
                e.state = ClientState::Ended;
                e
            })
            .collect()
    }

    // ── Liveness ──────────────────────────────────────────────────────────────

    pub fn heartbeat(&mut self, id: ClientId, now: u64) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) => {
                entry.last_seen_at = now;
                true
            }
            None => false,
        }
    }

    /// Entries silent for longer than `grace_ms`, or whose connection closed.
    pub fn stale_clients(&self, now: u64, grace_ms: u64) -> Vec<ClientId> {
        let mut stale: Vec<ClientId> = self
            .entries
            .values()
            .filter(|e| !e.disconnected)
            .filter(|e| now.saturating_sub(e.last_seen_at) > grace_ms || e.connection.is_closed())
            .map(|e| e.id)
            .collect();
        stale.sort();
        stale
    }

    pub fn mark_disconnected(&mut self, id: ClientId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.disconnected = true;
        }
    }

    // ── Notification ──────────────────────────────────────────────────────────

    /// Send `QueuePosition` to every Waiting client whose position or the
    /// queue length changed since its last update.
    pub fn notify_positions(&mut self) -> usize {
        let queue_length = self.waiting.len();
        let mut sent = 0;
        for (i, id) in self.waiting.iter().enumerate() {
            let Some(entry) = self.entries.get_mut(id) else {
                continue;
            };
            let current = (i + 1, queue_length);
            if entry.last_notified == Some(current) {
                continue;
            }
            entry.last_notified = Some(current);
            entry.connection.send(ServerEvent::QueuePosition {
                position: i + 1,
                queue_length,
            });
            sent += 1;
        }
        sent
    }

    /// Deliver an event to one enqueued client.
    pub fn send_to(&mut self, id: ClientId, event: ServerEvent) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) => entry.connection.send(event),
            None => false,
        }
    }

    // ── Queries ───────────────────────────────────────────────────────────────

    /// 1-based waiting position.
    pub fn position_of(&self, id: ClientId) -> Option<usize> {
        self.index.get(&id).map(|i| i + 1)
    }

    pub fn placement(&self, id: ClientId) -> Option<Placement> {
        if self.active == Some(id) {
            return Some(Placement::Active);
        }
        self.position_of(id)
            .map(|position| Placement::Waiting { position })
    }

    pub fn active(&self) -> Option<ClientId> {
        self.active
    }

    pub fn entry(&self, id: ClientId) -> Option<&ClientEntry> {
        self.entries.get(&id)
    }

    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn invite_limiter(&self) -> &RateLimiter {
        &self.invite_limiter
    }

    /// Active entry first, then the waiting line in order.
    pub fn view(&self) -> Vec<QueueEntryView> {
        self.active
            .iter()
            .chain(self.waiting.iter())
            .filter_map(|id| self.entries.get(id))
            .map(|e| QueueEntryView {
                client_id: e.id,
                state: e.state,
                position: self.position_of(e.id),
                origin: e.origin.clone(),
                enqueued_at: e.enqueued_at,
                last_seen_at: e.last_seen_at,
                priority: e.priority,
            })
            .collect()
    }

    fn rebuild_index(&mut self) {
        self.index.clear();
        for (i, id) in self.waiting.iter().enumerate() {
            self.index.insert(*id, i);
        }
    }
}
