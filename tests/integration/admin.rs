use crate::*;

const TOKEN: &str = "operator-secret";

async fn guarded() -> Result<Lobby> {
    start_lobby(Options {
        admin_token: Some(TOKEN),
        ..Options::default()
    })
    .await
}

#[tokio::test]
async fn test_admin_token_required() -> Result<()> {
    let lobby = guarded().await?;
    let http = reqwest::Client::new();

    let health = http.get(format!("{}/health", lobby.api_url)).send().await?;
    assert_eq!(health.status().as_u16(), 200);

    let status = http.get(format!("{}/status", lobby.api_url)).send().await?;
    assert_eq!(status.status().as_u16(), 401);

    let wrong = http
        .get(format!("{}/status", lobby.api_url))
        .bearer_auth("guess")
        .send()
        .await?;
    assert_eq!(wrong.status().as_u16(), 401);

    let (code, body) = lobby.api_get("/status").await?;
    assert_eq!(code, 200);
    assert_eq!(body["max_queue_size"], 10);
    assert_eq!(body["queue_length"], 0);
    Ok(())
}

#[tokio::test]
async fn test_invites_issue_and_audit() -> Result<()> {
    let lobby = guarded().await?;

    let (code, issued) = lobby
        .api_post("/invites", json!({ "scope": "bypass", "ttl_secs": 120 }))
        .await?;
    assert_eq!(code, 200);
    assert_eq!(issued["scope"], "bypass");
    assert_eq!(issued["expires_at"], 1_000_000 + 120_000);
    let token = issued["token"].as_str().context("token")?.to_string();

    let (_, list) = lobby.api_get("/invites").await?;
    assert_eq!(list["invites"].as_array().map(Vec::len), Some(1));
    assert!(list["invites"][0]["consumed_at"].is_null());

    let mut a = lobby.client().await?;
    a.enqueue(Some(&token)).await?;
    a.expect("session_granted").await?;

    let (_, list) = lobby.api_get("/invites").await?;
    assert_eq!(list["invites"][0]["token_id"], issued["token_id"]);
    assert!(list["invites"][0]["consumed_at"].is_u64());
    Ok(())
}

#[tokio::test]
async fn test_invite_request_validation() -> Result<()> {
    let lobby = guarded().await?;
    let (code, _) = lobby.api_post("/invites", json!({ "scope": "vip" })).await?;
    assert_eq!(code, 400);
    let (code, _) = lobby
        .api_post("/invites", json!({ "scope": "direct", "ttl_secs": 0 }))
        .await?;
    assert_eq!(code, 400);
    Ok(())
}

#[tokio::test]
async fn test_expired_invite_is_rejected() -> Result<()> {
    let lobby = guarded().await?;
    let (_, issued) = lobby
        .api_post("/invites", json!({ "scope": "bypass", "ttl_secs": 10 }))
        .await?;
    let token = issued["token"].as_str().context("token")?.to_string();

    lobby.clock.advance_secs(11);
    let mut a = lobby.client().await?;
    a.enqueue(Some(&token)).await?;
    assert_eq!(a.expect("error").await?["payload"]["kind"], "invalid_token");
    Ok(())
}

#[tokio::test]
async fn test_queue_view_lists_active_then_waiting() -> Result<()> {
    let lobby = guarded().await?;
    let mut a = lobby.client().await?;
    let mut b = lobby.client().await?;
    a.enqueue(None).await?;
    a.expect("session_granted").await?;
    b.enqueue(None).await?;
    b.expect("queue_position").await?;

    let (code, queue) = lobby.api_get("/queue").await?;
    assert_eq!(code, 200);
    let entries = &queue["entries"];
    assert_eq!(entries[0]["client_id"], a.id);
    assert_eq!(entries[0]["state"], "active");
    assert!(entries[0]["position"].is_null());
    assert_eq!(entries[1]["client_id"], b.id);
    assert_eq!(entries[1]["state"], "waiting");
    assert_eq!(entries[1]["position"], 1);
    assert_eq!(entries[1]["origin"], "127.0.0.1");
    Ok(())
}

#[tokio::test]
async fn test_operator_ends_session() -> Result<()> {
    let lobby = guarded().await?;
    let (_, ended) = lobby.api_post("/session/end", json!({})).await?;
    assert!(ended["ended"].is_null());

    let mut a = lobby.client().await?;
    let mut b = lobby.client().await?;
    a.enqueue(None).await?;
    let granted = a.expect("session_granted").await?;
    b.enqueue(None).await?;
    b.expect("queue_position").await?;

    let (code, ended) = lobby.api_post("/session/end", json!({})).await?;
    assert_eq!(code, 200);
    assert_eq!(ended["ended"], granted["payload"]["session_id"]);

    let ending = a.expect("session_ending").await?;
    assert_eq!(ending["payload"]["reason"], "queue_aborted");
    b.expect("session_granted").await?;
    Ok(())
}

#[tokio::test]
async fn test_shutdown_drains_everything() -> Result<()> {
    let mut lobby = guarded().await?;
    let mut a = lobby.client().await?;
    let mut b = lobby.client().await?;
    let mut idle = lobby.client().await?;
    a.enqueue(None).await?;
    a.expect("session_granted").await?;
    b.enqueue(None).await?;
    b.expect("queue_position").await?;

    let (code, body) = lobby.api_post("/daemon/shutdown", json!({})).await?;
    assert_eq!(code, 200);
    assert_eq!(body["message"], "Shutdown initiated");
    tokio::time::timeout(EVENT_TIMEOUT, lobby.shutdown_rx.recv()).await??;

    // What the daemon does once the signal arrives.
    lobby.broker.shutdown().await?;

    let ending = a.expect("session_ending").await?;
    assert_eq!(ending["payload"]["reason"], "queue_aborted");
    // Waiting and idle clients are told why before the socket closes.
    for client in [&mut b, &mut idle] {
        let notice = client.wait_for("error").await?;
        assert_eq!(notice["payload"]["kind"], "queue_full");
        assert!(client.closed_by_server().await);
    }
    assert_eq!(lobby.fake.live_count(), 0);

    // The broker is gone; the admin API says so.
    let (code, _) = lobby.api_get("/status").await?;
    assert_eq!(code, 503);
    Ok(())
}
