//! Transport-neutral frames.
//!
//! The client leg (axum) and the upstream leg (tungstenite) use different
//! message types. Both are adapted to [`Frame`] so the relay logic is
//! written once and can be tested over in-memory sockets.

use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use futures::{Sink, Stream};
use pin_project_lite::pin_project;
use tokio_tungstenite::tungstenite;

use super::RelayError;

/// Close code and reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// RFC 6455 status code
    pub code: u16,
    /// Human-readable reason
    pub reason: String,
}

impl CloseReason {
    /// Create a close reason.
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// A relayed application message. Ping and pong never surface here: each
/// WebSocket library answers them on its own leg.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 text
    Text(String),
    /// Opaque bytes
    Binary(Bytes),
    /// Close handshake
    Close(Option<CloseReason>),
}

impl Frame {
    /// Payload size in bytes. Close frames count as empty.
    pub fn len(&self) -> usize {
        match self {
            Self::Text(t) => t.len(),
            Self::Binary(b) => b.len(),
            Self::Close(_) => 0,
        }
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A library message type that maps to and from [`Frame`].
pub trait WireMessage: Sized {
    /// Convert to a frame; `None` for control messages the relay ignores.
    fn into_frame(self) -> Option<Frame>;

    /// Convert from a frame.
    fn from_frame(frame: Frame) -> Self;
}

impl WireMessage for axum::extract::ws::Message {
    fn into_frame(self) -> Option<Frame> {
        match self {
            Self::Text(text) => Some(Frame::Text(text.as_str().to_owned())),
            Self::Binary(data) => Some(Frame::Binary(data)),
            Self::Close(close) => Some(Frame::Close(
                close.map(|c| CloseReason::new(c.code, c.reason.as_str())),
            )),
            Self::Ping(_) | Self::Pong(_) => None,
        }
    }

    fn from_frame(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => Self::Text(text.into()),
            Frame::Binary(data) => Self::Binary(data),
            Frame::Close(close) => Self::Close(close.map(|c| axum::extract::ws::CloseFrame {
                code: c.code,
                reason: c.reason.into(),
            })),
        }
    }
}

impl WireMessage for tungstenite::Message {
    fn into_frame(self) -> Option<Frame> {
        match self {
            Self::Text(text) => Some(Frame::Text(text.as_str().to_owned())),
            Self::Binary(data) => Some(Frame::Binary(data)),
            Self::Close(close) => Some(Frame::Close(
                close.map(|c| CloseReason::new(u16::from(c.code), c.reason.as_str())),
            )),
            Self::Ping(_) | Self::Pong(_) | Self::Frame(_) => None,
        }
    }

    fn from_frame(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => Self::Text(text.into()),
            Frame::Binary(data) => Self::Binary(data),
            Frame::Close(close) => Self::Close(close.map(|c| {
                tungstenite::protocol::CloseFrame {
                    code: c.code.into(),
                    reason: c.reason.into(),
                }
            })),
        }
    }
}

pin_project! {
    /// Adapts a WebSocket of message type `M` into a stream and sink of [`Frame`]s.
    pub struct FrameSocket<S, M> {
        #[pin]
        inner: S,
        _message: PhantomData<fn() -> M>,
    }
}

impl<S, M> FrameSocket<S, M> {
    /// Wrap a socket.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            _message: PhantomData,
        }
    }
}

impl<S, M, E> Stream for FrameSocket<S, M>
where
    S: Stream<Item = Result<M, E>>,
    M: WireMessage,
    RelayError: From<E>,
{
    type Item = Result<Frame, RelayError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut inner = self.project().inner;
        loop {
            match ready!(inner.as_mut().poll_next(cx)) {
                Some(Ok(message)) => {
                    if let Some(frame) = message.into_frame() {
                        return Poll::Ready(Some(Ok(frame)));
                    }
                }
                Some(Err(e)) => return Poll::Ready(Some(Err(e.into()))),
                None => return Poll::Ready(None),
            }
        }
    }
}

impl<S, M> Sink<Frame> for FrameSocket<S, M>
where
    S: Sink<M>,
    M: WireMessage,
    RelayError: From<S::Error>,
{
    type Error = RelayError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().inner.poll_ready(cx).map_err(Into::into)
    }

    fn start_send(self: Pin<&mut Self>, frame: Frame) -> Result<(), Self::Error> {
        self.project()
            .inner
            .start_send(M::from_frame(frame))
            .map_err(Into::into)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().inner.poll_flush(cx).map_err(Into::into)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().inner.poll_close(cx).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_messages_are_dropped() {
        assert!(tungstenite::Message::Ping(Bytes::new()).into_frame().is_none());
        assert!(axum::extract::ws::Message::Pong(Bytes::new()).into_frame().is_none());
    }

    #[test]
    fn close_code_survives_both_libraries() {
        let frame = Frame::Close(Some(CloseReason::new(1009, "message too large")));

        let upstream = tungstenite::Message::from_frame(frame.clone());
        assert_eq!(upstream.into_frame(), Some(frame.clone()));

        let client = axum::extract::ws::Message::from_frame(frame.clone());
        assert_eq!(client.into_frame(), Some(frame));
    }

    #[test]
    fn length_counts_payload_bytes() {
        assert_eq!(Frame::Text("héllo".to_string()).len(), 6);
        assert_eq!(Frame::Binary(Bytes::from_static(&[1, 2, 3])).len(), 3);
        assert!(Frame::Close(None).is_empty());
    }
}
