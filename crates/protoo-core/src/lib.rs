//! # protoo-core
//!
//! Transport-agnostic core of the protoo signaling protocol.
//!
//! - [`message`]: wire model (request / response / notification) and parser
//! - [`transport`]: the channel contract plus in-memory and length-delimited
//!   stream implementations
//! - [`peer`]: request/response correlation, timeouts and inbound dispatch
//! - [`room`]: keyed registry of peers with cascading close

#![deny(unsafe_code)]

pub mod errors;
pub mod message;
pub mod peer;
pub mod room;
pub mod transport;

pub use errors::{ParseError, PeerError, RoomError, TransportError};
pub use message::{Message, Notification, Request, Response};
pub use peer::{
    NotificationHandler, Peer, PeerOptions, RequestHandler, RequestIdSource, Responder,
};
pub use room::Room;
pub use transport::{Transport, TransportChannel, TransportEvent};
