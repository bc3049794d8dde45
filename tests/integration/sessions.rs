use crate::*;

use lobby_core::ClientId;

#[tokio::test]
async fn test_session_times_out_and_next_is_admitted() -> Result<()> {
    let lobby = start_lobby(Options {
        max_session_secs: 60,
        ..Options::default()
    })
    .await?;
    let mut a = lobby.client().await?;
    let mut b = lobby.client().await?;

    a.enqueue(None).await?;
    a.expect("session_granted").await?;
    b.enqueue(None).await?;
    b.expect("queue_position").await?;

    lobby.clock.advance_secs(59);
    assert!(!lobby.broker.sweep().await?.timed_out);

    lobby.clock.advance_secs(1);
    let report = lobby.broker.sweep().await?;
    assert!(report.timed_out);

    let ending = a.expect("session_ending").await?;
    assert_eq!(ending["payload"]["reason"], "timeout");
    b.expect("session_granted").await?;
    assert_eq!(lobby.fake.peak_live(), 1);

    let status = lobby.wait_status(|s| s["active"]["owner"] == b.id).await?;
    assert_eq!(status["last_session"]["end_reason"], "timeout");
    assert_eq!(status["telemetry"]["sessions_timed_out"], 1);
    Ok(())
}

#[tokio::test]
async fn test_sandbox_crash_ends_session() -> Result<()> {
    let lobby = start_lobby(Options::default()).await?;
    let mut a = lobby.client().await?;
    a.enqueue(None).await?;
    a.expect("session_granted").await?;

    lobby.fake.crash_all();
    let report = lobby.broker.sweep().await?;
    assert!(report.crashed);

    let err = a.expect("error").await?;
    assert_eq!(err["payload"]["kind"], "sandbox_crash");
    let ending = a.expect("session_ending").await?;
    assert_eq!(ending["payload"]["reason"], "error");

    let status = lobby.wait_status(|s| s["active"].is_null()).await?;
    assert_eq!(status["last_session"]["crashed"], true);
    assert_eq!(lobby.fake.live_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_spawn_failure_moves_on() -> Result<()> {
    let lobby = start_lobby(Options::default()).await?;
    lobby.fake.set_spawn_delay(Duration::from_millis(200));
    lobby.fake.fail_next(1);
    let mut a = lobby.client().await?;
    let mut b = lobby.client().await?;

    a.enqueue(None).await?;
    lobby.wait_status(|s| s["active"]["status"] == "starting").await?;
    b.enqueue(None).await?;
    b.expect("queue_position").await?;

    let err = a.expect("error").await?;
    assert_eq!(err["payload"]["kind"], "spawn_failed");
    b.expect("session_granted").await?;

    let (_, status) = lobby.api_get("/status").await?;
    assert_eq!(status["telemetry"]["spawn_failures"], 1);
    Ok(())
}

#[tokio::test]
async fn test_active_disconnect_frees_slot() -> Result<()> {
    let lobby = start_lobby(Options::default()).await?;
    let mut a = lobby.client().await?;
    let mut b = lobby.client().await?;

    a.enqueue(None).await?;
    a.expect("session_granted").await?;
    b.enqueue(None).await?;
    b.expect("queue_position").await?;

    a.close().await?;
    b.expect("session_granted").await?;
    assert_eq!(lobby.fake.terminated(), 1);
    assert_eq!(lobby.fake.peak_live(), 1);
    Ok(())
}

#[tokio::test]
async fn test_leaving_the_line_closes_gap() -> Result<()> {
    let lobby = start_lobby(Options::default()).await?;
    let mut a = lobby.client().await?;
    let mut b = lobby.client().await?;
    let mut c = lobby.client().await?;

    a.enqueue(None).await?;
    a.expect("session_granted").await?;
    b.enqueue(None).await?;
    b.expect("queue_position").await?;
    c.enqueue(None).await?;
    c.expect("queue_position").await?;
    b.expect("queue_position").await?;

    b.end_session().await?;
    let pos = c.expect("queue_position").await?;
    assert_eq!(pos["payload"], json!({ "position": 1, "queue_length": 1 }));

    // The active session is untouched.
    a.assert_silent(Duration::from_millis(100)).await?;
    assert_eq!(lobby.fake.terminated(), 0);
    Ok(())
}

#[tokio::test]
async fn test_silent_clients_are_dropped() -> Result<()> {
    let lobby = start_lobby(Options {
        heartbeat_grace_secs: 30,
        ..Options::default()
    })
    .await?;
    let mut a = lobby.client().await?;
    let mut b = lobby.client().await?;
    let mut idle = lobby.client().await?;

    a.enqueue(None).await?;
    a.expect("session_granted").await?;
    b.enqueue(None).await?;
    b.expect("queue_position").await?;

    lobby.clock.advance_secs(31);
    // Only the active client is still heartbeating.
    lobby.broker.heartbeat(ClientId(a.id)).await?;
    let report = lobby.broker.sweep().await?;

    let mut stale = report.stale_clients.clone();
    stale.sort();
    assert_eq!(stale, vec![ClientId(b.id), ClientId(idle.id)]);
    assert!(b.closed_by_server().await);
    assert!(idle.closed_by_server().await);
    a.assert_silent(Duration::from_millis(100)).await?;
    Ok(())
}

#[tokio::test]
async fn test_heartbeats_keep_waiting_client() -> Result<()> {
    let lobby = start_lobby(Options {
        heartbeat_grace_secs: 30,
        max_session_secs: 600,
        ..Options::default()
    })
    .await?;
    let mut a = lobby.client().await?;
    let mut b = lobby.client().await?;

    a.enqueue(None).await?;
    a.expect("session_granted").await?;
    b.enqueue(None).await?;
    b.expect("queue_position").await?;

    for _ in 0..3 {
        lobby.clock.advance_secs(20);
        lobby.broker.heartbeat(ClientId(a.id)).await?;
        lobby.broker.heartbeat(ClientId(b.id)).await?;
        assert!(lobby.broker.sweep().await?.stale_clients.is_empty());
    }
    let (_, queue) = lobby.api_get("/queue").await?;
    assert_eq!(queue["entries"][1]["client_id"], b.id);
    Ok(())
}
