//! Per-connection WebSocket handling.
//!
//! ```text
//! TCP accept
//!   │  per-IP permit               (429 on the upgrade response)
//!   ▼
//! HTTP upgrade  {path}/{room_id}?token=..&type=..
//!   │  route + room id check       (404 / 400)
//!   ▼
//! Authenticator ─► per-user permit ─► RoomManager::join_room
//!   │                                   (CONTROL.error + close on failure)
//!   ▼
//! select! loop
//!   ├── inbound text  ─► rate limit ─► decode ─► dispatch
//!   ├── outbox frame  ─► socket
//!   └── liveness deadline (reset by PING)
//!   │
//!   ▼
//! RoomManager::leave_room
//! ```

use futures_util::{Sink, SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};

use crate::auth::{Authenticator, Credentials};
use crate::config::CollabConfig;
use crate::limits::{ConnectionLimiter, MessageRateLimiter, RateDecision};
use crate::outbox::Outbox;
use crate::protocol::{
    is_valid_room_id, now_millis, ErrorCode, Message, ProtocolError, SyncMessage,
};
use crate::room::{ClientConnection, RoomManager, DEFAULT_ROOM_TYPE};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// What the upgrade request asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub room_id: String,
    pub room_type: String,
    pub token: Option<String>,
}

/// Why an upgrade request was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub status: StatusCode,
    pub reason: String,
}

impl Rejection {
    fn new(status: StatusCode, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
        }
    }

    fn into_response(self) -> ErrorResponse {
        let mut response = ErrorResponse::new(Some(self.reason));
        *response.status_mut() = self.status;
        response
    }
}

fn query_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    query.split('&').find_map(|pair| {
        let mut it = pair.splitn(2, '=');
        (it.next() == Some(key)).then(|| it.next().unwrap_or(""))
    })
}

/// Extract room, room type and bearer token from an upgrade request.
///
/// The token is taken from `?token=` or, failing that, from an
/// `Authorization: Bearer` header.
pub fn parse_request(prefix: &str, request: &Request) -> Result<Handshake, Rejection> {
    let uri = request.uri();
    let room_id = uri
        .path()
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('/'))
        .ok_or_else(|| Rejection::new(StatusCode::NOT_FOUND, "unknown path"))?;

    if !is_valid_room_id(room_id) {
        return Err(Rejection::new(StatusCode::BAD_REQUEST, "invalid room id"));
    }

    let query = uri.query().unwrap_or("");
    let room_type = query_param(query, "type")
        .filter(|t| !t.is_empty())
        .unwrap_or(DEFAULT_ROOM_TYPE)
        .to_string();
    let token = query_param(query, "token")
        .map(str::to_string)
        .or_else(|| {
            request
                .headers()
                .get("authorization")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.strip_prefix("Bearer "))
                .map(|token| token.trim().to_string())
        });

    Ok(Handshake {
        room_id: room_id.to_string(),
        room_type,
        token,
    })
}

/// Close code matching a CONTROL error.
fn close_code(code: ErrorCode) -> CloseCode {
    match code {
        ErrorCode::CapacityExceeded | ErrorCode::RoomFull | ErrorCode::RoomUnavailable => {
            CloseCode::Again
        }
        ErrorCode::InternalError => CloseCode::Error,
        ErrorCode::ProtocolError => CloseCode::Protocol,
        _ => CloseCode::Policy,
    }
}

async fn send_now<S>(sink: &mut S, message: &Message) -> Result<(), GatewayError>
where
    S: Sink<WsMessage, Error = tungstenite::Error> + Unpin,
{
    sink.send(WsMessage::text(message.encode()?)).await?;
    Ok(())
}

/// Send `CONTROL.error` followed by a close frame, bypassing the outbox.
async fn refuse<S>(sink: &mut S, code: ErrorCode, reason: String) -> Result<(), GatewayError>
where
    S: Sink<WsMessage, Error = tungstenite::Error> + Unpin,
{
    send_now(sink, &Message::error(code, reason.clone())).await?;
    sink.send(WsMessage::Close(Some(CloseFrame {
        code: close_code(code),
        reason: reason.into(),
    })))
    .await?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    /// A PING arrived; push the liveness deadline out.
    Heartbeat,
    Close,
}

#[derive(Default)]
struct Counters {
    connections_total: AtomicU64,
    connections_active: AtomicU64,
    handshakes_rejected: AtomicU64,
    messages_received: AtomicU64,
    messages_rejected: AtomicU64,
    liveness_timeouts: AtomicU64,
}

/// Gateway statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatewayStats {
    pub connections_total: u64,
    pub connections_active: u64,
    pub handshakes_rejected: u64,
    pub messages_received: u64,
    pub messages_rejected: u64,
    pub liveness_timeouts: u64,
}

/// Turns accepted TCP streams into room participants.
pub struct Gateway {
    config: Arc<CollabConfig>,
    rooms: Arc<RoomManager>,
    authenticator: Arc<dyn Authenticator>,
    limiter: Arc<ConnectionLimiter>,
    counters: Counters,
}

impl Gateway {
    pub fn new(
        config: Arc<CollabConfig>,
        rooms: Arc<RoomManager>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        let limiter = Arc::new(ConnectionLimiter::from_config(&config.rate_limiting));
        Self {
            config,
            rooms,
            authenticator,
            limiter,
            counters: Counters::default(),
        }
    }

    pub fn limiter(&self) -> &Arc<ConnectionLimiter> {
        &self.limiter
    }

    pub fn stats(&self) -> GatewayStats {
        GatewayStats {
            connections_total: self.counters.connections_total.load(Ordering::Relaxed),
            connections_active: self.counters.connections_active.load(Ordering::Relaxed),
            handshakes_rejected: self.counters.handshakes_rejected.load(Ordering::Relaxed),
            messages_received: self.counters.messages_received.load(Ordering::Relaxed),
            messages_rejected: self.counters.messages_rejected.load(Ordering::Relaxed),
            liveness_timeouts: self.counters.liveness_timeouts.load(Ordering::Relaxed),
        }
    }

    /// Drive one client connection from upgrade to leave.
    pub async fn handle_connection(
        &self,
        stream: TcpStream,
        remote_addr: SocketAddr,
    ) -> Result<(), GatewayError> {
        self.counters.connections_total.fetch_add(1, Ordering::Relaxed);

        let ip_permit = self.limiter.acquire_ip(remote_addr.ip());
        let prefix = self.config.route_prefix();
        let mut handshake = None;

        let accepted = accept_hdr_async(stream, |request: &Request, response: Response| {
            if let Err(e) = &ip_permit {
                log::warn!("Rejecting {remote_addr}: {e}");
                return Err(Rejection::new(StatusCode::TOO_MANY_REQUESTS, e.to_string())
                    .into_response());
            }
            match parse_request(prefix, request) {
                Ok(parsed) => {
                    handshake = Some(parsed);
                    Ok(response)
                }
                Err(rejection) => {
                    log::debug!(
                        "Rejecting upgrade from {remote_addr} for {}: {}",
                        request.uri().path(),
                        rejection.reason
                    );
                    Err(rejection.into_response())
                }
            }
        })
        .await;

        let (mut ws, handshake) = match (accepted, handshake) {
            (Ok(ws), Some(handshake)) => (ws, handshake),
            (Err(tungstenite::Error::Http(_)), _) => {
                self.counters.handshakes_rejected.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            (Err(e), _) => return Err(e.into()),
            (Ok(mut ws), None) => {
                // Unreachable in practice: the callback records a handshake
                // before accepting.
                ws.close(None).await?;
                return Ok(());
            }
        };
        let _ip_permit = ip_permit;

        let credentials = Credentials {
            token: handshake.token.clone(),
            room_id: handshake.room_id.clone(),
            remote_addr,
        };
        let identity = match self.authenticator.authenticate(&credentials).await {
            Ok(identity) => identity,
            Err(e) => {
                log::warn!(
                    "Authentication failed for {remote_addr} on room {}: {e}",
                    handshake.room_id
                );
                return refuse(&mut ws, e.code(), e.to_string()).await;
            }
        };

        let _user_permit = match self.limiter.acquire_user(&identity.user_id) {
            Ok(permit) => permit,
            Err(e) => {
                log::warn!("Rejecting {remote_addr}: {e}");
                return refuse(&mut ws, e.code(), e.to_string()).await;
            }
        };

        let outbox = Arc::new(Outbox::new(
            self.config.outbound.queue_capacity,
            self.config.outbound.max_pending_sync,
        ));
        let connection = Arc::new(ClientConnection::new(
            identity,
            handshake.room_id.as_str(),
            outbox,
        ));

        if let Err(e) = self
            .rooms
            .join_room(&handshake.room_id, &handshake.room_type, connection.clone())
            .await
        {
            log::warn!(
                "{} could not join room {}: {e}",
                connection.user_id,
                handshake.room_id
            );
            return refuse(&mut ws, e.code(), e.to_string()).await;
        }

        self.counters.connections_active.fetch_add(1, Ordering::Relaxed);
        let result = self.run_connection(ws, &connection).await;
        self.counters.connections_active.fetch_sub(1, Ordering::Relaxed);

        self.rooms.leave_room(&connection.room_id, &connection.id).await;
        result
    }

    async fn run_connection(
        &self,
        ws: tokio_tungstenite::WebSocketStream<TcpStream>,
        connection: &ClientConnection,
    ) -> Result<(), GatewayError> {
        let (mut sink, mut stream) = ws.split();
        let mut rate = MessageRateLimiter::new(self.config.rate_limiting.messages_per_second);
        let liveness = self.config.liveness_timeout();
        let mut last_ping = Instant::now();

        loop {
            tokio::select! {
                inbound = stream.next() => {
                    let flow = match inbound {
                        Some(Ok(WsMessage::Text(text))) => {
                            self.handle_frame(connection, &mut rate, Some(text.as_str())).await
                        }
                        Some(Ok(WsMessage::Binary(_))) => {
                            self.handle_frame(connection, &mut rate, None).await
                        }
                        Some(Ok(WsMessage::Ping(_))) => {
                            // tungstenite queues the pong; flush it out.
                            sink.flush().await?;
                            Flow::Heartbeat
                        }
                        Some(Ok(WsMessage::Close(_))) | None => {
                            log::info!("Connection {} closed by client", connection.id);
                            Flow::Close
                        }
                        Some(Ok(_)) => Flow::Continue,
                        Some(Err(e)) => {
                            log::warn!("WebSocket error on {}: {e}", connection.id);
                            Flow::Close
                        }
                    };
                    match flow {
                        Flow::Continue => {}
                        Flow::Heartbeat => last_ping = Instant::now(),
                        Flow::Close => break,
                    }
                }

                outbound = connection.outbox().recv() => {
                    match outbound {
                        Some(frame) => sink.send(WsMessage::text(frame.to_string())).await?,
                        None => {
                            if connection.outbox().was_evicted() {
                                log::warn!(
                                    "Closing {} ({}): outbound backlog exceeded",
                                    connection.id,
                                    connection.user_id
                                );
                                let _ = sink
                                    .send(WsMessage::Close(Some(CloseFrame {
                                        code: CloseCode::Again,
                                        reason: "outbound backlog exceeded".into(),
                                    })))
                                    .await;
                            }
                            break;
                        }
                    }
                }

                _ = tokio::time::sleep_until(last_ping + liveness) => {
                    self.counters.liveness_timeouts.fetch_add(1, Ordering::Relaxed);
                    log::info!(
                        "Closing {} ({}): no PING within {liveness:?}",
                        connection.id,
                        connection.user_id
                    );
                    let _ = sink
                        .send(WsMessage::Close(Some(CloseFrame {
                            code: CloseCode::Policy,
                            reason: "heartbeat timeout".into(),
                        })))
                        .await;
                    break;
                }
            }
        }
        Ok(())
    }

    /// Rate-limit, decode and dispatch one inbound data frame. `None` is a
    /// binary frame.
    async fn handle_frame(
        &self,
        connection: &ClientConnection,
        rate: &mut MessageRateLimiter,
        text: Option<&str>,
    ) -> Flow {
        self.counters.messages_received.fetch_add(1, Ordering::Relaxed);
        connection.touch();

        match rate.check() {
            RateDecision::Allow => {}
            RateDecision::Reject => {
                self.counters.messages_rejected.fetch_add(1, Ordering::Relaxed);
                connection.send(&Message::error(
                    ErrorCode::RateLimitExceeded,
                    "message rate limit exceeded",
                ));
                return Flow::Continue;
            }
            RateDecision::Disconnect => {
                self.counters.messages_rejected.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "Disconnecting {} ({}): sustained rate limit violations",
                    connection.id,
                    connection.user_id
                );
                return Flow::Close;
            }
        }

        let decoded = match text {
            Some(text) => Message::decode(text),
            None => Err(ProtocolError::BinaryFrame),
        };
        let message = match decoded {
            Ok(message) => message,
            Err(e) => {
                log::debug!("Bad frame from {}: {e}", connection.id);
                connection.send(&Message::error(e.code(), e.to_string()));
                return Flow::Continue;
            }
        };

        self.dispatch(connection, message).await
    }

    async fn dispatch(&self, connection: &ClientConnection, message: Message) -> Flow {
        let result = match message {
            Message::Sync(SyncMessage {
                update: Some(update),
                ..
            }) => self.rooms.apply_update(connection, update).await.map(|_| ()),
            Message::Sync(_) => self.rooms.resync(connection).await.map(|_| ()),
            Message::Presence(presence) => self.rooms.update_presence(connection, &presence).await,
            Message::Ping(_) => {
                connection.send(&Message::pong(now_millis()));
                return Flow::Heartbeat;
            }
            Message::Pong(_) => return Flow::Continue,
            Message::Control(_) => {
                connection.send(&Message::error(
                    ErrorCode::ProtocolError,
                    "CONTROL messages are server-originated",
                ));
                return Flow::Continue;
            }
        };

        if let Err(e) = result {
            log::debug!("Rejected message from {}: {e}", connection.id);
            connection.send(&Message::error(e.code(), e.to_string()));
        }
        Flow::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str) -> Request {
        Request::builder().uri(uri).body(()).unwrap()
    }

    #[test]
    fn test_parse_room_and_token() {
        let handshake = parse_request("/collab", &request("/collab/r1?token=abc&type=notes")).unwrap();
        assert_eq!(
            handshake,
            Handshake {
                room_id: "r1".into(),
                room_type: "notes".into(),
                token: Some("abc".into()),
            }
        );
    }

    #[test]
    fn test_defaults_without_query() {
        let handshake = parse_request("/collab", &request("/collab/r1")).unwrap();
        assert_eq!(handshake.room_type, DEFAULT_ROOM_TYPE);
        assert_eq!(handshake.token, None);
    }

    #[test]
    fn test_bearer_header() {
        let request = Request::builder()
            .uri("/collab/r1")
            .header("Authorization", "Bearer secret")
            .body(())
            .unwrap();
        let handshake = parse_request("/collab", &request).unwrap();
        assert_eq!(handshake.token.as_deref(), Some("secret"));
    }

    #[test]
    fn test_rejections() {
        let wrong_prefix = parse_request("/collab", &request("/other/r1")).unwrap_err();
        assert_eq!(wrong_prefix.status, StatusCode::NOT_FOUND);

        let no_room = parse_request("/collab", &request("/collab")).unwrap_err();
        assert_eq!(no_room.status, StatusCode::NOT_FOUND);

        let nested = parse_request("/collab", &request("/collab/a/b")).unwrap_err();
        assert_eq!(nested.status, StatusCode::BAD_REQUEST);

        let dots = parse_request("/collab", &request("/collab/..")).unwrap_err();
        assert_eq!(dots.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_root_prefix() {
        let handshake = parse_request("", &request("/r9")).unwrap();
        assert_eq!(handshake.room_id, "r9");
    }

    #[test]
    fn test_close_codes() {
        assert_eq!(close_code(ErrorCode::RoomFull), CloseCode::Again);
        assert_eq!(close_code(ErrorCode::Unauthenticated), CloseCode::Policy);
        assert_eq!(close_code(ErrorCode::ProtocolError), CloseCode::Protocol);
    }

    #[test]
    fn test_query_param() {
        assert_eq!(query_param("a=1&token=x", "token"), Some("x"));
        assert_eq!(query_param("token", "token"), Some(""));
        assert_eq!(query_param("tokens=1", "token"), None);
    }
}
