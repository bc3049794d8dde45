//! Sandbox providers — the external environment each session drives.
//!
//! The broker treats a sandbox as opaque: `spawn` returns a handle,
//! `terminate` consumes it, `is_alive` is a non-blocking probe used by the
//! sweep. `CommandSandbox` runs a configured program (normally `docker run`)
//! in its own process group and kills the whole group on teardown, and on
//! any spawn that does not end in a handle.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::{Child, Command};

use lobby_core::config::SandboxConfig;
use lobby_core::SessionId;

/// Hard ceilings applied to every sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub memory_bytes: u64,
    /// Thousandths of a CPU core.
    pub cpu_millis: u32,
    pub max_pids: u32,
}

impl ResourceLimits {
    pub fn from_config(cfg: &SandboxConfig) -> Self {
        Self {
            memory_bytes: cfg.memory_bytes,
            cpu_millis: cfg.cpu_millis,
            max_pids: cfg.max_pids,
        }
    }
}

/// A live sandbox. Owned by the lifecycle manager from spawn to terminate.
#[derive(Debug)]
pub struct SandboxHandle {
    pub session_id: SessionId,
    /// What the client is told to connect to.
    pub connection: String,
    child: Option<Child>,
    tag: u64,
}

impl SandboxHandle {
    /// Handle for a provider that tracks sandboxes by number rather than process.
    pub fn tagged(session_id: SessionId, connection: String, tag: u64) -> Self {
        Self {
            session_id,
            connection,
            child: None,
            tag,
        }
    }

    fn process(session_id: SessionId, connection: String, child: Child) -> Self {
        Self {
            session_id,
            connection,
            child: Some(child),
            tag: 0,
        }
    }

    pub fn tag(&self) -> u64 {
        self.tag
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to start sandbox: {0}")]
    Spawn(String),
    #[error("sandbox exited during startup ({0})")]
    ExitedEarly(String),
    #[error("sandbox did not start within {0:?}")]
    Timeout(Duration),
    #[error("sandbox cleanup failed: {0}")]
    Cleanup(String),
    #[error("no free port for sandbox: {0}")]
    NoPort(std::io::Error),
}

#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn spawn(
        &self,
        session_id: SessionId,
        limits: &ResourceLimits,
    ) -> Result<SandboxHandle, SandboxError>;

    /// Release everything the sandbox holds. Errors are reported but the
    /// handle is gone either way.
    async fn terminate(&self, handle: SandboxHandle) -> Result<(), SandboxError>;

    /// Non-blocking liveness probe.
    fn is_alive(&self, handle: &mut SandboxHandle) -> bool;

    /// Release whatever an abandoned spawn of `session_id` may have left
    /// behind. Called when `spawn` is cut off by a timeout.
    async fn reclaim(&self, _session_id: SessionId) -> Result<(), SandboxError> {
        Ok(())
    }
}

// ── Command sandbox ───────────────────────────────────────────────────────────

pub struct CommandSandbox {
    program: String,
    args: Vec<String>,
    cleanup_program: String,
    cleanup_args: Vec<String>,
    public_host: String,
    settle: Duration,
}

impl CommandSandbox {
    pub fn from_config(cfg: &SandboxConfig, public_host: &str) -> Self {
        Self {
            program: cfg.program.clone(),
            args: cfg.args.clone(),
            cleanup_program: cfg.cleanup_program.clone(),
            cleanup_args: cfg.cleanup_args.clone(),
            public_host: public_host.to_string(),
            settle: Duration::from_millis(250),
        }
    }

    /// How long a fresh process must survive before spawn reports success.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    async fn cleanup(&self, vars: &[(&str, String)]) -> Result<(), SandboxError> {
        if self.cleanup_program.is_empty() {
            return Ok(());
        }
        let args = render_all(&self.cleanup_args, vars);
        let status = Command::new(&self.cleanup_program)
            .args(&args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await
            .map_err(|e| SandboxError::Cleanup(format!("{}: {}", self.cleanup_program, e)))?;
        if !status.success() {
            return Err(SandboxError::Cleanup(format!(
                "{} exited with {}",
                self.cleanup_program, status
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl SandboxProvider for CommandSandbox {
    async fn spawn(
        &self,
        session_id: SessionId,
        limits: &ResourceLimits,
    ) -> Result<SandboxHandle, SandboxError> {
        let port = free_port().map_err(SandboxError::NoPort)?;
        let vars = placeholders(session_id, port, limits);
        let args = render_all(&self.args, &vars);

        let mut child = Command::new(&self.program)
            .args(&args)
            .process_group(0)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::Spawn(format!("'{}': {}", self.program, e)))?;
        // Dropped with this future unless the child makes it into a handle.
        let group = GroupGuard(child.id());

        tokio::time::sleep(self.settle).await;
        if let Ok(Some(status)) = child.try_wait() {
            drop(group);
            let _ = self.cleanup(&vars).await;
            return Err(SandboxError::ExitedEarly(status.to_string()));
        }

        group.release();
        tracing::debug!(session = %session_id, pid = child.id(), port, "sandbox process started");
        let connection = format!("{}:{}", self.public_host, port);
        Ok(SandboxHandle::process(session_id, connection, child))
    }

    async fn terminate(&self, mut handle: SandboxHandle) -> Result<(), SandboxError> {
        if let Some(mut child) = handle.child.take() {
            if let Some(pid) = child.id() {
                kill_group(pid);
            }
            let _ = child.start_kill();
            if tokio::time::timeout(Duration::from_secs(5), child.wait())
                .await
                .is_err()
            {
                tracing::warn!(session = %handle.session_id, "sandbox process did not exit after SIGKILL");
            }
        }

        let port = handle
            .connection
            .rsplit_once(':')
            .and_then(|(_, p)| p.parse().ok())
            .unwrap_or(0);
        self.cleanup(&teardown_vars(handle.session_id, port)).await
    }

    fn is_alive(&self, handle: &mut SandboxHandle) -> bool {
        match handle.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    async fn reclaim(&self, session_id: SessionId) -> Result<(), SandboxError> {
        tracing::info!(session = %session_id, "reclaiming abandoned sandbox");
        self.cleanup(&teardown_vars(session_id, 0)).await
    }
}

/// Kills the process group on drop unless released.
struct GroupGuard(Option<u32>);

impl GroupGuard {
    fn release(mut self) {
        self.0 = None;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if let Some(pid) = self.0.take() {
            kill_group(pid);
        }
    }
}

fn kill_group(pid: u32) {
    // Negative pid: signal the whole process group.
    unsafe {
        libc::kill(-(pid as i32), libc::SIGKILL);
    }
}

/// Cleanup only needs the session and port; limits are zeroed.
fn teardown_vars(session_id: SessionId, port: u16) -> Vec<(&'static str, String)> {
    let none = ResourceLimits {
        memory_bytes: 0,
        cpu_millis: 0,
        max_pids: 0,
    };
    placeholders(session_id, port, &none)
}

fn placeholders(session_id: SessionId, port: u16, limits: &ResourceLimits) -> Vec<(&'static str, String)> {
    vec![
        ("{session_id}", session_id.to_hex()),
        ("{port}", port.to_string()),
        ("{memory_bytes}", limits.memory_bytes.to_string()),
        ("{memory_mb}", (limits.memory_bytes / (1024 * 1024)).to_string()),
        ("{cpu_millis}", limits.cpu_millis.to_string()),
        ("{cpus}", format!("{:.3}", limits.cpu_millis as f64 / 1000.0)),
        ("{max_pids}", limits.max_pids.to_string()),
    ]
}

fn render(template: &str, vars: &[(&str, String)]) -> String {
    vars.iter()
        .fold(template.to_string(), |acc, (key, value)| acc.replace(key, value))
}

fn render_all(templates: &[String], vars: &[(&str, String)]) -> Vec<String> {
    templates.iter().map(|t| render(t, vars)).collect()
}

/// Ask the OS for an unused TCP port.
fn free_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind("0.0.0.0:0")?;
    Ok(listener.local_addr()?.port())
}
