//! # protoo-server
//!
//! WebSocket edge of the protoo signaling protocol.
//!
//! - [`server::ProtooServer`]: axum endpoint that checks the `protoo`
//!   sub-protocol and hands each attempt to an [`admission::AdmissionHandler`]
//! - [`websocket`]: transport implementation shared by server and client
//! - [`client::connect`]: open a connection from the client side
//! - [`config`]: layered configuration (defaults, JSON file, `PROTOO_*` env)

#![deny(unsafe_code)]

pub mod admission;
pub mod client;
pub mod config;
pub mod errors;
pub mod server;
pub mod shutdown;
pub mod telemetry;
pub mod websocket;

pub use admission::{Admission, AdmissionHandler, RequestInfo};
pub use client::{ClientOptions, connect, connect_with};
pub use config::ServerConfig;
pub use errors::{AdmissionError, ClientError, ConfigError, ServerError};
pub use server::ProtooServer;
