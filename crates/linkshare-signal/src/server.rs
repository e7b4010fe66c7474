//! WebSocket signal server implementation

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, info, warn};

use linkshare_core::{Config, Environment, ServerConfig};

use crate::broker::Broker;
use crate::connection::{write_outgoing, Connection};
use crate::error::ServerError;
use crate::session::run_session;
use crate::WS_PATH;

/// Signal server state
pub struct SignalServer {
    broker: Arc<Broker>,
    config: Config,
}

impl SignalServer {
    /// Create a server; fails if `config` does not validate
    pub fn new(config: Config) -> Result<Self, ServerError> {
        Ok(Self {
            broker: Arc::new(Broker::new(&config)?),
            config,
        })
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// Bind and serve until the listener fails
    pub async fn serve(&self) -> Result<(), ServerError> {
        let addr = SocketAddr::new(self.config.server.bind, self.config.server.port);
        let listener = TcpListener::bind(addr).await?;
        self.run(listener).await
    }

    /// Serve connections from an already-bound listener
    pub async fn run(&self, listener: TcpListener) -> Result<(), ServerError> {
        info!("Signal server listening on {}", listener.local_addr()?);

        // Start limiter cleanup task
        let broker = Arc::downgrade(&self.broker);
        let interval = self.config.limits.cleanup_interval();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match broker.upgrade() {
                    Some(broker) => broker.limiter().cleanup_expired(),
                    None => break,
                }
            }
        });

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let broker = Arc::clone(&self.broker);
            let server = self.config.server.clone();
            let outbound_buffer = self.config.session.outbound_buffer;

            tokio::spawn(async move {
                if let Err(e) =
                    handle_connection(stream, peer_addr, broker, server, outbound_buffer).await
                {
                    debug!("Connection error from {}: {:?}", peer_addr, e);
                }
            });
        }
    }

    /// Get connection count (for monitoring)
    pub fn connection_count(&self) -> usize {
        self.broker.registry().len()
    }

    /// Get group count (for monitoring)
    pub fn group_count(&self) -> usize {
        self.broker.groups().len()
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Handle a single connection (HTTP or WebSocket)
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    broker: Arc<Broker>,
    server: ServerConfig,
    outbound_buffer: usize,
) -> Result<(), BoxError> {
    // Peek at the request line to route plain HTTP away from the WebSocket
    let mut peek_buf = [0u8; 512];
    let n = stream.peek(&mut peek_buf).await?;
    let path = request_path(&peek_buf[..n]);

    if path.as_deref() != Some(WS_PATH) {
        return handle_http_request(&mut stream, &broker, server.environment).await;
    }

    let mut forwarded_for: Option<String> = None;
    let ws_stream = accept_hdr_async(stream, |req: &Request, resp: Response| {
        if req.uri().path() != WS_PATH {
            let mut err = ErrorResponse::new(Some("not found".into()));
            *err.status_mut() = StatusCode::NOT_FOUND;
            return Err(err);
        }
        forwarded_for = req
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Ok(resp)
    })
    .await?;

    let origin = if server.trust_forwarded_for {
        forwarded_for.as_deref().and_then(parse_forwarded_for)
    } else {
        Some(peer_addr.ip())
    };

    let (connection, outbox) = Connection::channel(outbound_buffer);
    let endpoint = match broker.admit(origin, connection) {
        Ok(endpoint) => endpoint,
        Err(e) => {
            warn!("Refusing connection from {}: {}", peer_addr, e);
            refuse(ws_stream, e.close_reason()).await;
            return Ok(());
        }
    };

    info!("Client {} connected as {}", peer_addr, endpoint.token());

    let (ws_sender, ws_receiver) = ws_stream.split();
    let writer = tokio::spawn(write_outgoing(outbox, ws_sender));

    run_session(broker, endpoint, ws_receiver).await;

    let _ = writer.await;
    debug!("Connection closed: {}", peer_addr);
    Ok(())
}

/// Close a not-yet-admitted WebSocket with a reason
async fn refuse(mut ws: WebSocketStream<TcpStream>, reason: &'static str) {
    let frame = CloseFrame {
        code: CloseCode::Policy,
        reason: reason.into(),
    };
    if let Err(e) = ws.close(Some(frame)).await {
        debug!("Ignoring error while refusing connection: {:?}", e);
    }
}

/// Extract the path from an HTTP request line
fn request_path(head: &[u8]) -> Option<String> {
    let head = String::from_utf8_lossy(head);
    let line = head.lines().next()?;
    let mut parts = line.split_whitespace();
    let _method = parts.next()?;
    let target = parts.next()?;
    Some(target.split('?').next().unwrap_or(target).to_string())
}

/// First address of an `X-Forwarded-For` header
fn parse_forwarded_for(header: &str) -> Option<IpAddr> {
    header.split(',').next()?.trim().parse().ok()
}

/// Handle an HTTP request (health, stats and protocol docs)
async fn handle_http_request(
    stream: &mut TcpStream,
    broker: &Broker,
    environment: Environment,
) -> Result<(), BoxError> {
    // Read the HTTP request
    let mut buf = vec![0u8; 1024];
    let n = stream.read(&mut buf).await?;
    let path = request_path(&buf[..n]).unwrap_or_else(|| "/".to_string());

    let stats = broker.stats();
    let (status, body) = match path.as_str() {
        "/health" => (
            "200 OK",
            json!({
                "status": "healthy",
                "connections": stats.connections,
                "groups": stats.groups,
            }),
        ),
        "/stats" => (
            "200 OK",
            json!({
                "connections": stats.connections,
                "groups": stats.groups,
                "timers": stats.timers,
                "origins_tracked": stats.limiter.tracked,
                "origins_limited": stats.limiter.limited,
            }),
        ),
        "/docs" if environment.shows_docs() => ("200 OK", protocol_docs()),
        _ => ("404 Not Found", json!({"error": "not found"})),
    };

    let body = body.to_string();
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );

    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

/// Machine-readable description of the WebSocket protocol
fn protocol_docs() -> serde_json::Value {
    json!({
        "title": "LinkShare",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoint": WS_PATH,
        "discriminator": crate::messages::TYPE_FIELD,
        "client": {
            "pair": {"target": "string"},
            "content": {"content": "any"},
        },
        "server": {
            "refresh": {"token": "string"},
            "connected": {},
            "code-not-found": {"code": "string"},
            "content": {"content": "any", "sender": "string"},
            "disconnected": {},
            "disconnect": {},
        },
    })
}
