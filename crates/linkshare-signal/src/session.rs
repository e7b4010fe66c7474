//! Per-connection protocol handler
//!
//! One task per admitted connection reads inbound frames strictly in order
//! and drives the broker. Whatever ends the loop (client disconnect, forced
//! close from a peer's disposal or the inactivity timer, a protocol
//! violation) the endpoint is torn down exactly once on the way out.

use std::fmt::Display;
use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::error::ProtocolError;
use crate::messages::{ClientMessage, ServerMessage};
use crate::registry::Endpoint;

enum Flow {
    Continue,
    Stop,
}

/// Run the protocol for an admitted endpoint until it closes
pub async fn run_session<S, E>(broker: Arc<Broker>, endpoint: Arc<Endpoint>, mut inbound: S)
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let token = endpoint.token().to_string();
    let connection = endpoint.connection().clone();

    if endpoint
        .send(ServerMessage::Refresh {
            token: token.clone(),
        })
        .is_ok()
    {
        broker.touch(&endpoint);

        loop {
            let frame = tokio::select! {
                _ = connection.closed() => {
                    debug!("Connection {} closed by server", token);
                    break;
                }
                frame = inbound.next() => frame,
            };

            let text = match frame {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(e) => {
                        reject(&endpoint, ProtocolError::InvalidJson(e.to_string()));
                        break;
                    }
                },
                Some(Ok(Message::Close(_))) | None => {
                    debug!("Client {} hung up", token);
                    break;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    debug!("WebSocket error from {}: {}", token, e);
                    break;
                }
            };

            let flow = match ClientMessage::parse(&text) {
                Ok(msg) => handle_message(&broker, &endpoint, msg),
                Err(e) => {
                    reject(&endpoint, e);
                    Flow::Stop
                }
            };

            if let Flow::Stop = flow {
                break;
            }
        }
    }

    broker.teardown(&endpoint);
}

/// Handle a single message
fn handle_message(broker: &Arc<Broker>, endpoint: &Arc<Endpoint>, msg: ClientMessage) -> Flow {
    // A rejected message closes the connection, and teardown drops the timer
    if msg.is_activity() {
        broker.touch(endpoint);
    }

    match msg {
        ClientMessage::Pair { target } => {
            info!("{} requested pairing with {}", endpoint.token(), target);
            broker.pair(endpoint, &target);
            Flow::Continue
        }
        ClientMessage::Content { content } => match broker.relay(endpoint, content) {
            Ok(delivered) => {
                debug!("{} relayed content to {} peers", endpoint.token(), delivered);
                Flow::Continue
            }
            Err(e) => {
                reject(endpoint, e);
                Flow::Stop
            }
        },
        ClientMessage::Unknown(kind) => {
            info!("Unknown type received from {}: {}", endpoint.token(), kind);
            Flow::Continue
        }
    }
}

/// Tell the client it broke the protocol, then close
fn reject(endpoint: &Endpoint, error: ProtocolError) {
    warn!("Client {} sent invalid data: {}", endpoint.token(), error);
    let _ = endpoint.send(ServerMessage::Disconnect);
    endpoint.connection().close(Some("protocol violation"));
}
