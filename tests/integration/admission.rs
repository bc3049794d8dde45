use crate::*;

/// First client into an empty lobby gets the sandbox straight away.
#[tokio::test]
async fn test_first_client_is_granted() -> Result<()> {
    let lobby = start_lobby(Options::default()).await?;
    let mut a = lobby.client().await?;

    a.enqueue(None).await?;
    let granted = a.expect("session_granted").await?;
    assert_eq!(granted["payload"]["connection"], "fake:1");
    assert!(granted["payload"]["deadline_ms"].as_u64().unwrap() > 1_000_000);

    let status = lobby.wait_status(|s| !s["active"].is_null()).await?;
    assert_eq!(status["active"]["owner"], a.id);
    assert_eq!(status["active"]["status"], "running");
    assert_eq!(lobby.fake.live_count(), 1);
    Ok(())
}

/// Waiting clients hear their position whenever it changes, and the head of
/// the line is admitted when the active client ends.
#[tokio::test]
async fn test_positions_advance_in_fifo_order() -> Result<()> {
    let lobby = start_lobby(Options::default()).await?;
    let mut a = lobby.client().await?;
    let mut b = lobby.client().await?;
    let mut c = lobby.client().await?;

    a.enqueue(None).await?;
    a.expect("session_granted").await?;

    b.enqueue(None).await?;
    let pos = b.expect("queue_position").await?;
    assert_eq!(pos["payload"], json!({ "position": 1, "queue_length": 1 }));

    c.enqueue(None).await?;
    let pos = c.expect("queue_position").await?;
    assert_eq!(pos["payload"], json!({ "position": 2, "queue_length": 2 }));
    let pos = b.expect("queue_position").await?;
    assert_eq!(pos["payload"], json!({ "position": 1, "queue_length": 2 }));

    a.end_session().await?;
    let ending = a.expect("session_ending").await?;
    assert_eq!(ending["payload"]["reason"], "client_ended");

    b.expect("session_granted").await?;
    let pos = c.expect("queue_position").await?;
    assert_eq!(pos["payload"], json!({ "position": 1, "queue_length": 1 }));

    // Never more than one sandbox alive.
    assert_eq!(lobby.fake.peak_live(), 1);
    assert_eq!(lobby.fake.terminated(), 1);
    Ok(())
}

#[tokio::test]
async fn test_full_queue_rejects_then_recovers() -> Result<()> {
    let lobby = start_lobby(Options {
        max_queue_size: 2,
        ..Options::default()
    })
    .await?;
    let mut a = lobby.client().await?;
    let mut b = lobby.client().await?;
    let mut c = lobby.client().await?;

    a.enqueue(None).await?;
    a.expect("session_granted").await?;
    b.enqueue(None).await?;
    b.expect("queue_position").await?;

    c.enqueue(None).await?;
    let err = c.expect("error").await?;
    assert_eq!(err["payload"]["kind"], "queue_full");

    // The rejected connection stays open and may retry once there is room.
    a.end_session().await?;
    a.expect("session_ending").await?;
    b.expect("session_granted").await?;
    c.enqueue(None).await?;
    let pos = c.expect("queue_position").await?;
    assert_eq!(pos["payload"]["position"], 1);
    Ok(())
}

#[tokio::test]
async fn test_bypass_invite_goes_to_front() -> Result<()> {
    let lobby = start_lobby(Options::default()).await?;
    let token = lobby.issue_invite("bypass").await?;
    let mut a = lobby.client().await?;
    let mut b = lobby.client().await?;
    let mut vip = lobby.client().await?;

    a.enqueue(None).await?;
    a.expect("session_granted").await?;
    b.enqueue(None).await?;
    b.expect("queue_position").await?;

    vip.enqueue(Some(&token)).await?;
    let pos = vip.expect("queue_position").await?;
    assert_eq!(pos["payload"]["position"], 1);
    let pos = b.expect("queue_position").await?;
    assert_eq!(pos["payload"]["position"], 2);

    // The running session is not preempted.
    a.assert_silent(Duration::from_millis(100)).await?;

    // Single use.
    let mut late = lobby.client().await?;
    late.enqueue(Some(&token)).await?;
    let err = late.expect("error").await?;
    assert_eq!(err["payload"]["kind"], "invalid_token");
    Ok(())
}

#[tokio::test]
async fn test_direct_invite_ignores_ceiling() -> Result<()> {
    let lobby = start_lobby(Options {
        max_queue_size: 1,
        ..Options::default()
    })
    .await?;
    let token = lobby.issue_invite("direct").await?;
    let mut a = lobby.client().await?;
    let mut b = lobby.client().await?;
    let mut guest = lobby.client().await?;

    a.enqueue(None).await?;
    a.expect("session_granted").await?;
    b.enqueue(None).await?;
    assert_eq!(b.expect("error").await?["payload"]["kind"], "queue_full");

    guest.enqueue(Some(&token)).await?;
    let pos = guest.expect("queue_position").await?;
    assert_eq!(pos["payload"], json!({ "position": 1, "queue_length": 1 }));
    Ok(())
}

#[tokio::test]
async fn test_forged_token_is_rejected() -> Result<()> {
    let lobby = start_lobby(Options::default()).await?;
    let mut a = lobby.client().await?;
    a.enqueue(Some("not-a-real-token")).await?;
    let err = a.expect("error").await?;
    assert_eq!(err["payload"]["kind"], "invalid_token");

    // A bad token does not cost the client its connection.
    a.enqueue(None).await?;
    a.expect("session_granted").await?;
    Ok(())
}

#[tokio::test]
async fn test_connections_are_rate_limited() -> Result<()> {
    let lobby = start_lobby(Options {
        connect_ceiling: 2,
        ..Options::default()
    })
    .await?;
    let mut a = lobby.client().await?;
    let mut b = lobby.client().await?;

    // Past the ceiling: one error, then the server closes the socket.
    for _ in 0..3 {
        let mut refused = lobby.raw_client().await?;
        let err = refused.expect("error").await?;
        assert_eq!(err["payload"]["kind"], "rate_limited");
        assert!(refused.closed_by_server().await);
    }
    let status = lobby.api_get("/status").await?.1;
    assert_eq!(status["idle_connections"], 2);

    // Connections already admitted enqueue normally.
    a.enqueue(None).await?;
    a.expect("session_granted").await?;
    b.enqueue(None).await?;
    b.expect("queue_position").await?;

    // A new window lets the origin in again.
    lobby.clock.advance_secs(61);
    let mut c = lobby.client().await?;
    c.enqueue(None).await?;
    c.expect("queue_position").await?;
    Ok(())
}

#[tokio::test]
async fn test_malformed_frames_are_ignored() -> Result<()> {
    let lobby = start_lobby(Options::default()).await?;
    let mut a = lobby.client().await?;

    a.send_raw("not json").await?;
    a.send(json!({ "type": "become_admin" })).await?;
    a.assert_silent(Duration::from_millis(100)).await?;

    a.enqueue(None).await?;
    a.expect("session_granted").await?;
    Ok(())
}

/// A second enqueue while already queued changes nothing.
#[tokio::test]
async fn test_duplicate_enqueue_is_noop() -> Result<()> {
    let lobby = start_lobby(Options::default()).await?;
    let mut a = lobby.client().await?;
    let mut b = lobby.client().await?;

    a.enqueue(None).await?;
    a.expect("session_granted").await?;
    b.enqueue(None).await?;
    b.expect("queue_position").await?;
    b.enqueue(None).await?;
    a.enqueue(None).await?;
    b.assert_silent(Duration::from_millis(100)).await?;

    let (_, queue) = lobby.api_get("/queue").await?;
    assert_eq!(queue["entries"].as_array().map(Vec::len), Some(2));
    assert_eq!(lobby.fake.spawned(), 1);
    Ok(())
}
