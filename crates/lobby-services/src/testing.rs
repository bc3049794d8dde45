//! In-memory sandbox provider for broker tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use lobby_core::SessionId;

use crate::sandbox::{ResourceLimits, SandboxError, SandboxHandle, SandboxProvider};

/// Records every spawn and teardown. Never touches the OS.
#[derive(Default)]
pub struct FakeSandbox {
    next_tag: AtomicU64,
    live: Mutex<HashSet<u64>>,
    crashed: Mutex<HashSet<u64>>,
    peak_live: AtomicUsize,
    spawned: AtomicUsize,
    terminated: AtomicUsize,
    failures_pending: AtomicUsize,
    spawn_delay: Mutex<Duration>,
    teardown_delay: Mutex<Duration>,
    reclaimed: Mutex<Vec<SessionId>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl FakeSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` spawns fail.
    pub fn fail_next(&self, n: usize) {
        self.failures_pending.store(n, Ordering::SeqCst);
    }

    pub fn set_spawn_delay(&self, delay: Duration) {
        *lock(&self.spawn_delay) = delay;
    }

    pub fn set_teardown_delay(&self, delay: Duration) {
        *lock(&self.teardown_delay) = delay;
    }

    /// Make every live sandbox fail its next probe.
    pub fn crash_all(&self) {
        let live = lock(&self.live).clone();
        lock(&self.crashed).extend(live);
    }

    pub fn live_count(&self) -> usize {
        lock(&self.live).len()
    }

    /// Most sandboxes ever live at once.
    pub fn peak_live(&self) -> usize {
        self.peak_live.load(Ordering::SeqCst)
    }

    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    pub fn terminated(&self) -> usize {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Sessions whose spawn was abandoned, in order.
    pub fn reclaimed(&self) -> Vec<SessionId> {
        lock(&self.reclaimed).clone()
    }
}

#[async_trait]
impl SandboxProvider for FakeSandbox {
    async fn spawn(
        &self,
        session_id: SessionId,
        _limits: &ResourceLimits,
    ) -> Result<SandboxHandle, SandboxError> {
        let delay = *lock(&self.spawn_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let fail = self
            .failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(SandboxError::Spawn("injected failure".into()));
        }

        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
        let live = {
            let mut live = lock(&self.live);
            live.insert(tag);
            live.len()
        };
        self.peak_live.fetch_max(live, Ordering::SeqCst);
        self.spawned.fetch_add(1, Ordering::SeqCst);
        Ok(SandboxHandle::tagged(session_id, format!("fake:{}", tag), tag))
    }

    async fn terminate(&self, handle: SandboxHandle) -> Result<(), SandboxError> {
        let delay = *lock(&self.teardown_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        lock(&self.live).remove(&handle.tag());
        self.terminated.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_alive(&self, handle: &mut SandboxHandle) -> bool {
        let tag = handle.tag();
        lock(&self.live).contains(&tag) && !lock(&self.crashed).contains(&tag)
    }

    async fn reclaim(&self, session_id: SessionId) -> Result<(), SandboxError> {
        lock(&self.reclaimed).push(session_id);
        Ok(())
    }
}
