//! Notification channel — the broker's half of one client connection.
//!
//! Every event gets the next per-connection sequence number, whether or not
//! it is delivered. Delivery is `try_send` into a bounded buffer drained by
//! the connection's writer task: a full or closed buffer drops the event, so
//! the client sees a gap in `seq` and the broker never waits on a slow peer.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use lobby_core::{ClientId, Envelope, ServerEvent};

pub type EventReceiver = mpsc::Receiver<Envelope<ServerEvent>>;

#[derive(Debug)]
pub struct ClientChannel {
    client_id: ClientId,
    tx: mpsc::Sender<Envelope<ServerEvent>>,
    seq: u64,
    dropped: u64,
}

impl ClientChannel {
    /// New channel plus the receiver the connection's writer drains.
    pub fn pair(client_id: ClientId, buffer: usize) -> (Self, EventReceiver) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (
            Self {
                client_id,
                tx,
                seq: 0,
                dropped: 0,
            },
            rx,
        )
    }

    /// Queue an event for delivery. Returns false if it was dropped.
    pub fn send(&mut self, event: ServerEvent) -> bool {
        self.seq += 1;
        let kind = event.kind();
        match self.tx.try_send(Envelope::new(self.seq, event)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped += 1;
                tracing::debug!(client = %self.client_id, seq = self.seq, kind, "outbound buffer full, event dropped");
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.dropped += 1;
                false
            }
        }
    }

    /// The writer side has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn last_seq(&self) -> u64 {
        self.seq
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
