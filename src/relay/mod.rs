//! Session relay between an authenticated client and the upstream.
//!
//! # Session lifecycle
//!
//! 1. Dial the upstream with a bounded handshake timeout.
//! 2. Send the `auth_init` handshake before anything else.
//! 3. Pump frames in both directions until either side closes, errors or
//!    sends an oversized message. The first terminal outcome wins and the
//!    other direction is dropped mid-flight.
//! 4. Send best-effort close frames to both peers, bounded by a short
//!    timeout, then let both connections drop.
//!
//! Messages are forwarded unmodified with their text/binary type intact.

pub mod frame;

pub use frame::{CloseReason, Frame, FrameSocket, WireMessage};

use std::fmt;
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite};
use tracing::{debug, warn};
use url::Url;

use crate::auth::Identity;
use crate::config::UpstreamConfig;

/// How long teardown waits for each peer to accept a close frame.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Headroom the transport allows above the relay's own size limit.
const TRANSPORT_HEADROOM: usize = 64 * 1024;

/// Largest message the client transport should buffer for a relay limit of
/// `max_message_size`.
///
/// Messages between the two limits still reach the relay and end the session
/// with 1009; anything larger is refused by the transport while reading.
#[must_use]
pub fn transport_message_limit(max_message_size: usize) -> usize {
    max_message_size.saturating_add(TRANSPORT_HEADROOM)
}

/// Upstream connection adapted to [`Frame`]s.
pub type UpstreamSocket =
    FrameSocket<WebSocketStream<MaybeTlsStream<TcpStream>>, tungstenite::Message>;

/// One end of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Peer {
    /// The authenticated client
    Client,
    /// The upstream service
    Upstream,
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => f.write_str("client"),
            Self::Upstream => f.write_str("upstream"),
        }
    }
}

/// Why a session ended.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// The upstream URL could not be parsed.
    #[error("upstream url invalid: {0}")]
    UpstreamInvalid(String),

    /// The upstream refused or failed the WebSocket handshake.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The upstream handshake did not finish in time.
    #[error("upstream handshake timed out after {0:?}")]
    UpstreamTimeout(Duration),

    /// A peer sent a message above the size limit.
    #[error("{peer} sent a {size} byte message (limit {limit})")]
    MessageTooLarge {
        /// Who sent it
        peer: Peer,
        /// Payload size
        size: usize,
        /// Configured limit
        limit: usize,
    },

    /// A peer closed the connection.
    #[error("{0} closed the connection")]
    PeerClosed(Peer),

    /// Client-side socket error.
    #[error("client socket: {0}")]
    Client(#[from] axum::Error),

    /// Upstream-side socket error.
    #[error("websocket: {0}")]
    WebSocket(#[from] tungstenite::Error),
}

impl RelayError {
    /// Close code sent to peers when a session ends this way.
    pub fn close_code(&self) -> u16 {
        match self {
            Self::PeerClosed(_) => 1000,
            Self::MessageTooLarge { .. } => 1009,
            _ => 1011,
        }
    }

    /// Close reason sent to peers when a session ends this way.
    pub fn close_reason(&self) -> &'static str {
        match self {
            Self::PeerClosed(_) => "session closed",
            Self::MessageTooLarge { .. } => "message too large",
            Self::UpstreamInvalid(_) => "upstream invalid",
            Self::UpstreamUnavailable(_) | Self::UpstreamTimeout(_) => "upstream unavailable",
            Self::Client(_) | Self::WebSocket(_) => "relay error",
        }
    }

    /// Whether the session ended without a fault.
    pub fn is_normal(&self) -> bool {
        matches!(self, Self::PeerClosed(_))
    }
}

/// Open the upstream connection.
pub async fn dial(config: &UpstreamConfig) -> Result<UpstreamSocket, RelayError> {
    let url = Url::parse(&config.url).map_err(|e| RelayError::UpstreamInvalid(e.to_string()))?;

    match tokio::time::timeout(config.handshake_timeout, connect_async(url.as_str())).await {
        Ok(Ok((stream, _response))) => {
            debug!(upstream = %url, "Upstream connected");
            Ok(FrameSocket::new(stream))
        }
        Ok(Err(e)) => Err(RelayError::UpstreamUnavailable(e.to_string())),
        Err(_) => Err(RelayError::UpstreamTimeout(config.handshake_timeout)),
    }
}

/// Run a whole session for an already-upgraded client: dial, handshake, relay.
///
/// Returns the outcome that ended the session.
pub async fn run<C>(mut client: C, config: &UpstreamConfig, identity: &Identity) -> RelayError
where
    C: Stream<Item = Result<Frame, RelayError>> + Sink<Frame, Error = RelayError> + Unpin,
{
    let upstream = match dial(config).await {
        Ok(upstream) => upstream,
        Err(e) => {
            warn!(error = %e, "Dial upstream failed");
            close_peer(&mut client, &e).await;
            return e;
        }
    };
    relay(client, upstream, identity, config.max_message_size).await
}

/// Relay frames between `client` and `upstream` after sending the handshake.
pub async fn relay<C, U>(
    client: C,
    upstream: U,
    identity: &Identity,
    max_message_size: usize,
) -> RelayError
where
    C: Stream<Item = Result<Frame, RelayError>> + Sink<Frame, Error = RelayError> + Unpin,
    U: Stream<Item = Result<Frame, RelayError>> + Sink<Frame, Error = RelayError> + Unpin,
{
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let handshake = Frame::Text(identity.handshake().to_string());
    let outcome = match upstream_tx.send(handshake).await {
        Ok(()) => {
            tokio::select! {
                outcome = pump(&mut client_rx, &mut upstream_tx, Peer::Client, max_message_size) => outcome,
                outcome = pump(&mut upstream_rx, &mut client_tx, Peer::Upstream, max_message_size) => outcome,
            }
        }
        Err(e) => {
            warn!(error = %e, "Failed to send auth_init to upstream");
            RelayError::UpstreamUnavailable(format!("auth_init not delivered: {e}"))
        }
    };

    tokio::join!(
        close_peer(&mut client_tx, &outcome),
        close_peer(&mut upstream_tx, &outcome)
    );
    outcome
}

/// Forward frames from `source` to `sink` until something ends the session.
async fn pump<S, K>(source: &mut S, sink: &mut K, from: Peer, max_message_size: usize) -> RelayError
where
    S: Stream<Item = Result<Frame, RelayError>> + Unpin,
    K: Sink<Frame, Error = RelayError> + Unpin,
{
    loop {
        let frame = match source.next().await {
            Some(Ok(Frame::Close(_))) | None => return RelayError::PeerClosed(from),
            Some(Ok(frame)) => frame,
            Some(Err(e)) => return e,
        };

        let size = frame.len();
        if size > max_message_size {
            return RelayError::MessageTooLarge {
                peer: from,
                size,
                limit: max_message_size,
            };
        }

        if let Err(e) = sink.send(frame).await {
            return e;
        }
    }
}

/// Best-effort close: errors are ignored, the wait is bounded.
async fn close_peer<K>(sink: &mut K, outcome: &RelayError)
where
    K: Sink<Frame, Error = RelayError> + Unpin,
{
    let close = Frame::Close(Some(CloseReason::new(
        outcome.close_code(),
        outcome.close_reason(),
    )));
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, async {
        let _ = sink.send(close).await;
        let _ = sink.close().await;
    })
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::tungstenite::protocol::Role;

    const LIMIT: usize = 1 << 20;

    type TestSocket = FrameSocket<WebSocketStream<DuplexStream>, Message>;

    /// An in-memory WebSocket: the gateway's end plus the remote peer's end.
    async fn socket_pair(gateway: Role, peer: Role) -> (TestSocket, WebSocketStream<DuplexStream>) {
        let (a, b) = tokio::io::duplex(4 << 20);
        let gateway_end = WebSocketStream::from_raw_socket(a, gateway, None).await;
        let peer_end = WebSocketStream::from_raw_socket(b, peer, None).await;
        (FrameSocket::new(gateway_end), peer_end)
    }

    fn close_code(message: &Message) -> Option<u16> {
        match message {
            Message::Close(Some(frame)) => Some(u16::from(frame.code)),
            _ => None,
        }
    }

    #[tokio::test]
    async fn handshake_precedes_client_traffic() {
        let (client_gw, mut client) = socket_pair(Role::Server, Role::Client).await;
        let (upstream_gw, mut upstream) = socket_pair(Role::Client, Role::Server).await;

        // Queued before the relay even starts
        client.send(Message::text("hello")).await.unwrap();

        let session = tokio::spawn(async move {
            let identity = Identity::new("user-1", "alice");
            relay(client_gw, upstream_gw, &identity, LIMIT).await
        });

        let first = upstream.next().await.unwrap().unwrap();
        let handshake: Value = serde_json::from_str(first.to_text().unwrap()).unwrap();
        assert_eq!(
            handshake,
            json!({"t": "auth_init", "sub": "user-1", "username": "alice"})
        );
        assert_eq!(upstream.next().await.unwrap().unwrap(), Message::text("hello"));

        upstream.send(Message::text("welcome")).await.unwrap();
        assert_eq!(client.next().await.unwrap().unwrap(), Message::text("welcome"));

        client.close(None).await.unwrap();
        let outcome = session.await.unwrap();
        assert!(matches!(outcome, RelayError::PeerClosed(Peer::Client)));
        assert_eq!(close_code(&upstream.next().await.unwrap().unwrap()), Some(1000));
    }

    #[tokio::test]
    async fn oversized_message_closes_both_sides() {
        let (client_gw, mut client) = socket_pair(Role::Server, Role::Client).await;
        let (upstream_gw, mut upstream) = socket_pair(Role::Client, Role::Server).await;

        let session = tokio::spawn(async move {
            relay(client_gw, upstream_gw, &Identity::default(), LIMIT).await
        });

        let handshake = upstream.next().await.unwrap().unwrap();
        assert_eq!(handshake, Message::text(r#"{"t":"auth_init"}"#));

        client
            .send(Message::binary(vec![0u8; 2 << 20]))
            .await
            .unwrap();

        let outcome = session.await.unwrap();
        assert!(matches!(
            outcome,
            RelayError::MessageTooLarge { peer: Peer::Client, size, .. } if size == 2 << 20
        ));

        // The oversized message is never forwarded: the next upstream frame is the close
        assert_eq!(close_code(&upstream.next().await.unwrap().unwrap()), Some(1009));
        assert_eq!(close_code(&client.next().await.unwrap().unwrap()), Some(1009));
    }

    #[tokio::test]
    async fn messages_below_limit_pass_intact() {
        let (client_gw, mut client) = socket_pair(Role::Server, Role::Client).await;
        let (upstream_gw, mut upstream) = socket_pair(Role::Client, Role::Server).await;

        let session = tokio::spawn(async move {
            relay(client_gw, upstream_gw, &Identity::default(), LIMIT).await
        });
        upstream.next().await.unwrap().unwrap();

        let text = "x".repeat(LIMIT - 1);
        client.send(Message::text(text.clone())).await.unwrap();
        assert_eq!(upstream.next().await.unwrap().unwrap(), Message::text(text));

        let blob: Vec<u8> = (0..LIMIT - 1).map(|i| (i % 251) as u8).collect();
        upstream.send(Message::binary(blob.clone())).await.unwrap();
        assert_eq!(client.next().await.unwrap().unwrap(), Message::binary(blob));

        upstream.close(None).await.unwrap();
        let outcome = session.await.unwrap();
        assert!(matches!(outcome, RelayError::PeerClosed(Peer::Upstream)));
    }

    #[tokio::test]
    async fn oversized_upstream_message_closes_both_sides() {
        let (client_gw, mut client) = socket_pair(Role::Server, Role::Client).await;
        let (upstream_gw, mut upstream) = socket_pair(Role::Client, Role::Server).await;

        let session = tokio::spawn(async move {
            relay(client_gw, upstream_gw, &Identity::default(), LIMIT).await
        });
        upstream.next().await.unwrap().unwrap();

        upstream
            .send(Message::text("y".repeat(LIMIT + 1)))
            .await
            .unwrap();

        let outcome = session.await.unwrap();
        assert!(matches!(
            outcome,
            RelayError::MessageTooLarge { peer: Peer::Upstream, size, limit: LIMIT } if size == LIMIT + 1
        ));
        assert_eq!(outcome.to_string(), format!("upstream sent a {} byte message (limit {LIMIT})", LIMIT + 1));

        // Nothing reaches the client but the close
        assert_eq!(close_code(&client.next().await.unwrap().unwrap()), Some(1009));
        assert_eq!(close_code(&upstream.next().await.unwrap().unwrap()), Some(1009));
    }

    fn assert_upstream_unavailable_close(close: &Message) {
        match close {
            Message::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), 1011);
                assert_eq!(frame.reason.as_str(), "upstream unavailable");
            }
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn refused_upstream_closes_client_as_unavailable() {
        let (client_gw, mut client) = socket_pair(Role::Server, Role::Client).await;
        let config = UpstreamConfig {
            url: "ws://127.0.0.1:1/ws".to_string(),
            handshake_timeout: Duration::from_secs(2),
            ..UpstreamConfig::default()
        };

        let outcome = run(client_gw, &config, &Identity::default()).await;

        assert!(matches!(outcome, RelayError::UpstreamUnavailable(_)));
        assert_upstream_unavailable_close(&client.next().await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn silent_upstream_times_out_as_unavailable() {
        // Accepts TCP but never answers the WebSocket handshake
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let silent = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(stream);
        });

        let (client_gw, mut client) = socket_pair(Role::Server, Role::Client).await;
        let config = UpstreamConfig {
            url: format!("ws://{addr}/ws"),
            handshake_timeout: Duration::from_millis(300),
            ..UpstreamConfig::default()
        };

        let started = tokio::time::Instant::now();
        let outcome = run(client_gw, &config, &Identity::default()).await;

        assert!(matches!(outcome, RelayError::UpstreamTimeout(d) if d == Duration::from_millis(300)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_upstream_unavailable_close(&client.next().await.unwrap().unwrap());
        silent.abort();
    }

    #[tokio::test]
    async fn undeliverable_handshake_is_upstream_unavailable() {
        let (client_gw, mut client) = socket_pair(Role::Server, Role::Client).await;
        let (upstream_gw, upstream) = socket_pair(Role::Client, Role::Server).await;
        drop(upstream);

        let outcome = relay(client_gw, upstream_gw, &Identity::default(), LIMIT).await;

        assert!(matches!(outcome, RelayError::UpstreamUnavailable(_)));
        assert_upstream_unavailable_close(&client.next().await.unwrap().unwrap());
    }

    #[test]
    fn transport_limit_leaves_headroom() {
        assert_eq!(transport_message_limit(LIMIT), LIMIT + 64 * 1024);
        assert_eq!(transport_message_limit(usize::MAX), usize::MAX);
    }

    #[test]
    fn close_codes_by_outcome() {
        assert_eq!(RelayError::PeerClosed(Peer::Upstream).close_code(), 1000);
        assert_eq!(
            RelayError::MessageTooLarge {
                peer: Peer::Client,
                size: 2,
                limit: 1
            }
            .close_code(),
            1009
        );
        assert_eq!(
            RelayError::UpstreamUnavailable("refused".to_string()).close_code(),
            1011
        );
    }
}
