//! Client side: open a protoo WebSocket connection.

use std::time::Duration;

use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use protoo_core::TransportChannel;

use crate::errors::ClientError;
use crate::websocket::WebSocketTransport;
use crate::websocket::transport::WsSettings;

/// Client connection settings.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Sub-protocol to request.
    pub subprotocol: String,
    /// Ping interval; `None` disables pings.
    pub heartbeat: Option<Duration>,
    /// Outbound messages buffered before `send` waits.
    pub send_queue_capacity: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            subprotocol: "protoo".into(),
            heartbeat: Some(Duration::from_secs(30)),
            send_queue_capacity: 256,
        }
    }
}

/// Connect to `url` with default options.
pub async fn connect(url: &str) -> Result<TransportChannel, ClientError> {
    connect_with(url, &ClientOptions::default()).await
}

/// Connect to `url`, offering `options.subprotocol`.
pub async fn connect_with(
    url: &str,
    options: &ClientOptions,
) -> Result<TransportChannel, ClientError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| ClientError::InvalidRequest(e.to_string()))?;
    let protocol = HeaderValue::from_str(&options.subprotocol)
        .map_err(|e| ClientError::InvalidRequest(e.to_string()))?;
    let _ = request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, protocol);

    let (socket, response) = match tokio_tungstenite::connect_async(request).await {
        Ok(connected) => connected,
        Err(tungstenite::Error::Http(response)) => {
            let status = response.status().as_u16();
            let reason = response
                .body()
                .as_deref()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default();
            return Err(ClientError::Rejected { status, reason });
        }
        Err(e) => return Err(ClientError::WebSocket(Box::new(e))),
    };

    let selected = response
        .headers()
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok());
    if selected != Some(options.subprotocol.as_str()) {
        return Err(ClientError::SubprotocolMismatch(options.subprotocol.clone()));
    }
    debug!(url, "connected");

    let settings = WsSettings {
        remote: url.to_owned(),
        heartbeat: options.heartbeat,
        send_queue_capacity: options.send_queue_capacity,
    };
    Ok(WebSocketTransport::spawn(
        socket,
        settings,
        &CancellationToken::new(),
    ))
}
