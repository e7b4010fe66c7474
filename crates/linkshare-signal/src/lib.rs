//! LinkShare Signal Server
//!
//! Pairs two anonymous WebSocket connections through a short token and
//! relays payloads between them until either side leaves.
//!
//! # Protocol
//!
//! 1. A client connects to [`WS_PATH`] and receives a `refresh` message
//!    carrying its token
//! 2. It shares the token out-of-band (QR code, link, read aloud)
//! 3. The peer sends `pair` with that token; both sides get `connected`
//! 4. `content` messages are relayed to the other member, tagged with the
//!    sender's token
//! 5. When either side disconnects or goes quiet for too long, the other
//!    side receives `disconnected` and is closed as well

pub mod broker;
pub mod connection;
pub mod error;
pub mod group;
pub mod limiter;
pub mod messages;
pub mod registry;
pub mod server;
pub mod session;
pub mod supervisor;

pub use broker::{Broker, BrokerStats, PairOutcome};
pub use connection::Connection;
pub use error::{AdmissionError, ProtocolError, ServerError, TransportError};
pub use group::{Group, GroupId, GroupIndex, GroupState};
pub use limiter::AdmissionLimiter;
pub use messages::{ClientMessage, ServerMessage};
pub use registry::{Endpoint, Registry};
pub use server::SignalServer;
pub use supervisor::InactivitySupervisor;

/// Path clients open their WebSocket on
pub const WS_PATH: &str = "/ws/new";
