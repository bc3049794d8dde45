//! lobbyd — single-session demo admission broker.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use lobby_core::config::LobbyConfig;
use lobby_core::crypto::SigningKey;
use lobby_core::SystemClock;

use lobby_services::{
    telemetry, Broker, BrokerHandle, BrokerParts, BrokerSettings, CommandSandbox,
    InviteTokenService, LifecycleSettings, RateLimiter, ResourceLimits, SandboxProvider,
    Telemetry,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = LobbyConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = LobbyConfig::load().context("failed to load config")?;
    tracing::info!(
        listen = %config.network.listen_addr,
        api_port = config.network.api_port,
        max_queue = config.queue.max_size,
        max_duration_secs = config.session.max_duration_secs,
        sandbox = %config.sandbox.program,
        "lobbyd starting"
    );

    telemetry::describe();
    let clock = SystemClock::shared();

    // Invite signing key
    let key = if config.invite.secret_hex.is_empty() {
        tracing::warn!("no invite secret configured, tokens will not survive a restart");
        SigningKey::generate()
    } else {
        SigningKey::from_hex(&config.invite.secret_hex).context("invalid invite secret")?
    };
    let invites = InviteTokenService::new(key, clock.clone());

    // Rate limiters
    let rl = &config.rate_limit;
    let connect_limiter = Arc::new(RateLimiter::new(
        "connect",
        rl.connect_ceiling,
        rl.connect_window_secs,
        clock.clone(),
    ));
    let invite_limiter = Arc::new(RateLimiter::new(
        "invite",
        rl.invite_ceiling,
        rl.invite_window_secs,
        clock.clone(),
    ));

    // Sandbox provider
    let provider: Arc<dyn SandboxProvider> = Arc::new(CommandSandbox::from_config(
        &config.sandbox,
        &config.network.public_host,
    ));

    let settings = BrokerSettings {
        max_queue_size: config.queue.max_size,
        heartbeat_grace: config.queue.heartbeat_grace(),
        outbound_buffer: config.queue.outbound_buffer,
        lifecycle: LifecycleSettings {
            max_duration: config.session.max_duration(),
            spawn_timeout: Duration::from_secs(config.sandbox.spawn_timeout_secs),
            limits: ResourceLimits::from_config(&config.sandbox),
        },
    };

    let (broker, broker_task) = Broker::spawn(BrokerParts {
        settings,
        provider,
        invites: invites.clone(),
        connect_limiter,
        invite_limiter,
        telemetry: Arc::new(Telemetry::new()),
        clock,
    });

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let sweep_task = tokio::spawn(sweep_loop(broker.clone(), config.queue.sweep_interval()));

    let state = lobby_api::ApiState {
        broker: broker.clone(),
        invites,
        default_invite_ttl: Duration::from_secs(config.invite.default_ttl_secs),
        admin_token: (!config.invite.admin_token.is_empty())
            .then(|| Arc::from(config.invite.admin_token.as_str())),
        started_at: Instant::now(),
        shutdown_tx: shutdown_tx.clone(),
    };
    if state.admin_token.is_none() {
        tracing::warn!("admin API has no token configured");
    }

    let listener = TcpListener::bind(&config.network.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.network.listen_addr))?;
    let public_server = {
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = lobby_api::serve_public(listener, state).await {
                tracing::error!(error = %e, "client endpoint failed");
            }
        })
    };

    let api_port = config.network.api_port;
    let admin_server = tokio::spawn(async move {
        if let Err(e) = lobby_api::serve_admin(state, api_port).await {
            tracing::error!(error = %e, "status server failed");
        }
    });

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv()       => tracing::info!("shutting down"),
        r = sweep_task               => tracing::error!("sweep task exited: {:?}", r),
        r = public_server            => tracing::error!("client endpoint exited: {:?}", r),
        r = admin_server             => tracing::error!("admin server exited: {:?}", r),
    }

    // Drain the queue and tear down the active sandbox before exiting.
    if let Err(e) = broker.shutdown().await {
        tracing::warn!(error = %e, "broker already stopped");
    }
    drop(broker);
    if let Err(e) = tokio::time::timeout(Duration::from_secs(10), broker_task).await {
        tracing::warn!(error = %e, "broker did not stop in time");
    }

    Ok(())
}

/// Periodic deadline, crash and heartbeat check.
async fn sweep_loop(broker: BrokerHandle, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        match broker.sweep().await {
            Ok(report) => {
                if report.timed_out || report.crashed || !report.stale_clients.is_empty() {
                    tracing::info!(
                        timed_out = report.timed_out,
                        crashed = report.crashed,
                        stale = report.stale_clients.len(),
                        pruned = report.pruned_buckets,
                        "sweep"
                    );
                }
            }
            Err(_) => return,
        }
    }
}
