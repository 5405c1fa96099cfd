//! WebSocket transport, shared by the server (axum) and client (tungstenite)
//! sides.

pub mod transport;

pub use transport::WebSocketTransport;

use axum::extract::ws::{CloseFrame as AxumCloseFrame, Message as AxumMessage};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as WsCloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

/// Close code sent when a transport is closed locally.
pub const LOCAL_CLOSE_CODE: u16 = 4000;
/// Close reason sent when a transport is closed locally.
pub const LOCAL_CLOSE_REASON: &str = "closed by protoo-server";

/// What an inbound frame means to the transport.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum FrameKind {
    Text(String),
    Binary(usize),
    Close,
    Control,
}

/// The frame operations the transport needs from a WebSocket library.
pub(crate) trait WsFrame: Send + 'static {
    fn text_frame(text: String) -> Self;
    fn ping_frame() -> Self;
    fn close_frame(code: u16, reason: &str) -> Self;
    fn kind(self) -> FrameKind;
}

impl WsFrame for AxumMessage {
    fn text_frame(text: String) -> Self {
        Self::Text(text.into())
    }

    fn ping_frame() -> Self {
        Self::Ping(Default::default())
    }

    fn close_frame(code: u16, reason: &str) -> Self {
        Self::Close(Some(AxumCloseFrame {
            code,
            reason: reason.to_owned().into(),
        }))
    }

    fn kind(self) -> FrameKind {
        match self {
            Self::Text(t) => FrameKind::Text(t.as_str().to_owned()),
            Self::Binary(b) => FrameKind::Binary(b.len()),
            Self::Close(_) => FrameKind::Close,
            Self::Ping(_) | Self::Pong(_) => FrameKind::Control,
        }
    }
}

impl WsFrame for WsMessage {
    fn text_frame(text: String) -> Self {
        Self::Text(text.into())
    }

    fn ping_frame() -> Self {
        Self::Ping(Default::default())
    }

    fn close_frame(code: u16, reason: &str) -> Self {
        Self::Close(Some(WsCloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_owned().into(),
        }))
    }

    fn kind(self) -> FrameKind {
        match self {
            Self::Text(t) => FrameKind::Text(t.as_str().to_owned()),
            Self::Binary(b) => FrameKind::Binary(b.len()),
            Self::Close(_) => FrameKind::Close,
            Self::Ping(_) | Self::Pong(_) | Self::Frame(_) => FrameKind::Control,
        }
    }
}
