//! Outbound half of a client connection
//!
//! Anything that wants to talk to a client (its own session, a group
//! broadcast triggered by a peer, the inactivity supervisor) goes through a
//! cloneable [`Connection`]. Sends never block: they enqueue into a bounded
//! queue drained by a writer task, so a slow client only ever hurts itself.

use std::sync::Arc;

use futures_util::{Sink, SinkExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::TransportError;
use crate::messages::ServerMessage;

/// Handle used to send to, and close, one client
#[derive(Clone, Debug)]
pub struct Connection {
    tx: mpsc::Sender<ServerMessage>,
    closed: CancellationToken,
    close_reason: Arc<Mutex<Option<String>>>,
}

/// Receiving end of a [`Connection`], owned by the writer task
#[derive(Debug)]
pub struct Outbox {
    rx: mpsc::Receiver<ServerMessage>,
    closed: CancellationToken,
    close_reason: Arc<Mutex<Option<String>>>,
}

/// Next thing the writer should put on the wire
#[derive(Debug, PartialEq)]
pub enum Outgoing {
    Message(ServerMessage),
    Close(Option<String>),
}

impl Connection {
    /// Create a connection with room for `capacity` queued messages
    pub fn channel(capacity: usize) -> (Connection, Outbox) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let closed = CancellationToken::new();
        let close_reason = Arc::new(Mutex::new(None));

        (
            Connection {
                tx,
                closed: closed.clone(),
                close_reason: close_reason.clone(),
            },
            Outbox {
                rx,
                closed,
                close_reason,
            },
        )
    }

    /// Queue a message for delivery
    pub fn send(&self, msg: ServerMessage) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    /// Close the connection after already-queued messages are flushed.
    ///
    /// Only the first close records its reason; later calls are no-ops.
    pub fn close(&self, reason: Option<&str>) {
        let mut slot = self.close_reason.lock();
        if self.closed.is_cancelled() {
            return;
        }
        *slot = reason.map(str::to_string);
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection has been closed from any side
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

impl Outbox {
    /// Wait for the next queued message, or the close marker once the
    /// connection is closed and the queue is drained
    pub async fn next(&mut self) -> Outgoing {
        tokio::select! {
            biased;
            msg = self.rx.recv() => match msg {
                Some(msg) => Outgoing::Message(msg),
                None => Outgoing::Close(self.close_reason.lock().clone()),
            },
            _ = self.closed.cancelled() => match self.rx.try_recv() {
                Ok(msg) => Outgoing::Message(msg),
                Err(_) => Outgoing::Close(self.close_reason.lock().clone()),
            },
        }
    }

    /// Mark the connection dead after a write failure
    fn fail(&self) {
        self.closed.cancel();
    }
}

/// Drain an outbox into a WebSocket sink until the connection closes
pub async fn write_outgoing<S>(mut outbox: Outbox, mut sink: S)
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Debug,
{
    loop {
        match outbox.next().await {
            Outgoing::Message(msg) => {
                if let Err(e) = sink.send(Message::Text(msg.to_json())).await {
                    debug!("WebSocket write failed: {:?}", e);
                    outbox.fail();
                    break;
                }
            }
            Outgoing::Close(reason) => {
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: reason.unwrap_or_default().into(),
                };
                let _ = sink.send(Message::Close(Some(frame))).await;
                break;
            }
        }
    }
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_messages_flush_before_close() {
        let (conn, mut outbox) = Connection::channel(8);
        conn.send(ServerMessage::Connected).unwrap();
        conn.send(ServerMessage::Disconnected).unwrap();
        conn.close(Some("bye"));

        assert_eq!(outbox.next().await, Outgoing::Message(ServerMessage::Connected));
        assert_eq!(outbox.next().await, Outgoing::Message(ServerMessage::Disconnected));
        assert_eq!(outbox.next().await, Outgoing::Close(Some("bye".into())));
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (conn, _outbox) = Connection::channel(8);
        conn.close(None);
        assert!(conn.is_closed());
        assert_eq!(conn.send(ServerMessage::Connected), Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn test_first_close_reason_wins() {
        let (conn, mut outbox) = Connection::channel(8);
        conn.close(Some("first"));
        conn.close(Some("second"));
        assert_eq!(outbox.next().await, Outgoing::Close(Some("first".into())));
    }

    #[test]
    fn test_full_queue_is_backpressure() {
        let (conn, _outbox) = Connection::channel(1);
        conn.send(ServerMessage::Connected).unwrap();
        assert_eq!(
            conn.send(ServerMessage::Connected),
            Err(TransportError::Backpressure)
        );
    }

    #[test]
    fn test_dropped_outbox_is_closed() {
        let (conn, outbox) = Connection::channel(4);
        drop(outbox);
        assert_eq!(conn.send(ServerMessage::Connected), Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn test_closed_resolves() {
        let (conn, _outbox) = Connection::channel(4);
        let waiter = conn.clone();
        let task = tokio::spawn(async move { waiter.closed().await });
        conn.close(None);
        task.await.unwrap();
    }
}
