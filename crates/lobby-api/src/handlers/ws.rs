//! /ws — one WebSocket per client.
//!
//! The socket is split: a writer task drains the broker's event channel
//! into text frames, the reader loop turns inbound frames into intents.
//! When the broker drops the channel the writer closes the socket; when the
//! socket goes away the reader reports a disconnect. A refused connection
//! only ever runs the writer.

use std::net::SocketAddr;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};

use lobby_core::wire::{decode_client, encode_server};
use lobby_core::{ClientId, ClientMessage};
use lobby_services::{BrokerError, BrokerHandle};

use super::ApiState;

pub async fn handle_ws(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<ApiState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_connection(socket, addr.ip().to_string(), state.broker))
}

async fn run_connection(socket: WebSocket, origin: String, broker: BrokerHandle) {
    let connected = match broker.connect(origin.clone()).await {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error = %e, "refusing connection");
            return;
        }
    };
    let client = connected.client_id;
    let mut events = connected.events;
    let (mut sink, mut stream) = socket.split();

    let mut writer = tokio::spawn(async move {
        while let Some(envelope) = events.recv().await {
            let text = match encode_server(&envelope) {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!(error = %e, "event serialize error");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                return;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    if let Some(kind) = connected.refused {
        tracing::info!(client = %client, origin = %origin, kind = kind.as_str(), "websocket refused");
        // The writer delivers the error, then closes.
        let _ = writer.await;
        return;
    }
    tracing::info!(client = %client, origin = %origin, "websocket open");

    loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            // The broker dropped this client and the writer has closed the socket.
            _ = &mut writer => break,
        };
        let Some(Ok(frame)) = frame else { break };
        let result = match frame {
            Message::Text(text) => match decode_client(text.as_str()) {
                Ok(envelope) => dispatch(&broker, client, envelope.body).await,
                Err(e) => {
                    tracing::debug!(client = %client, error = %e, "ignoring malformed frame");
                    Ok(())
                }
            },
            Message::Close(_) => break,
            Message::Binary(_) | Message::Ping(_) | Message::Pong(_) => Ok(()),
        };
        if result.is_err() {
            break;
        }
    }

    let _ = broker.disconnect(client).await;
    writer.abort();
    tracing::info!(client = %client, "websocket closed");
}

async fn dispatch(broker: &BrokerHandle, client: ClientId, message: ClientMessage) -> Result<(), BrokerError> {
    match message {
        ClientMessage::Enqueue { invite_token } => broker.enqueue(client, invite_token).await.map(|_| ()),
        ClientMessage::Heartbeat => broker.heartbeat(client).await,
        ClientMessage::EndSession => broker.end_session(client).await,
    }
}
