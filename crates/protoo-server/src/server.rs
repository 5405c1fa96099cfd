//! `ProtooServer`: axum WebSocket endpoint with connection admission.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::http::{Extensions, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use parking_lot::RwLock;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::admission::{Admission, AdmissionHandler, Decision, RequestInfo, offered_subprotocols};
use crate::config::ServerConfig;
use crate::errors::ServerError;
use crate::shutdown::StopSignal;
use crate::websocket::WebSocketTransport;
use crate::websocket::transport::WsSettings;

type HandlerSlot = Arc<RwLock<Option<Arc<dyn AdmissionHandler>>>>;

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    config: Arc<ServerConfig>,
    handler: HandlerSlot,
    stop: StopSignal,
}

/// The protoo WebSocket server.
pub struct ProtooServer {
    config: Arc<ServerConfig>,
    handler: HandlerSlot,
    stop: StopSignal,
}

impl ProtooServer {
    /// Create a server. Nothing is bound until [`listen`](Self::listen).
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config: Arc::new(config),
            handler: Arc::new(RwLock::new(None)),
            stop: StopSignal::new(),
        }
    }

    /// Install the admission handler, replacing any previous one.
    pub fn set_admission_handler(&self, handler: impl AdmissionHandler) {
        *self.handler.write() = Some(Arc::new(handler));
    }

    /// Build the axum router.
    pub fn router(&self) -> Router {
        let state = AppState {
            config: Arc::clone(&self.config),
            handler: Arc::clone(&self.handler),
            stop: self.stop.clone(),
        };
        Router::new()
            .route(&self.config.path, get(ws_handler))
            .with_state(state)
    }

    /// Bind the configured address and serve until stopped.
    pub async fn listen(&self) -> Result<(SocketAddr, JoinHandle<()>), ServerError> {
        if self.stop.is_stopped() {
            return Err(ServerError::Stopped);
        }
        let addr = self.config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local = listener.local_addr()?;

        let app = self.router();
        let token = self.stop.token().clone();
        let handle = tokio::spawn(async move {
            let service = app.into_make_service_with_connect_info::<SocketAddr>();
            if let Err(e) = axum::serve(listener, service)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
            {
                error!(error = %e, "server error");
            }
            info!("server stopped");
        });

        info!(%local, path = %self.config.path, "protoo server listening");
        Ok((local, handle))
    }

    /// Stop accepting connections and close every WebSocket transport.
    /// Idempotent.
    pub fn stop(&self) {
        if self.stop.stop() {
            info!("stop()");
        }
    }

    /// Whether [`stop`](Self::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        self.stop.is_stopped()
    }

    /// Stop signal, for draining the server task.
    pub fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

#[instrument(skip_all, fields(path = %uri.path()))]
async fn ws_handler(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    extensions: Extensions,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if state.stop.is_stopped() {
        return (StatusCode::SERVICE_UNAVAILABLE, "server stopped").into_response();
    }

    let expected = state.config.subprotocol.as_str();
    if !offered_subprotocols(&headers).contains(&expected) {
        warn!("invalid/missing Sec-WebSocket-Protocol");
        return (
            StatusCode::FORBIDDEN,
            "invalid/missing Sec-WebSocket-Protocol",
        )
            .into_response();
    }

    let handler = state.handler.read().clone();
    let Some(handler) = handler else {
        warn!("no admission handler, rejecting connection request");
        return (StatusCode::INTERNAL_SERVER_ERROR, "no admission handler").into_response();
    };

    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => {
            debug!(error = %rejection, "not a websocket upgrade");
            return rejection.into_response();
        }
    };

    let remote = extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let info = RequestInfo::new(uri, headers, remote);
    let (admission, decision) = Admission::new();
    drop(tokio::spawn(run_admission_handler(handler, info, admission)));

    match decision.await {
        Ok(Decision::Accept(upgraded)) => {
            let settings = WsSettings {
                remote: remote.map_or_else(|| "unknown".to_owned(), |a| a.to_string()),
                heartbeat: state.config.heartbeat_interval(),
                send_queue_capacity: state.config.send_queue_capacity,
            };
            let shutdown = state.stop.token().clone();
            upgrade
                .protocols([state.config.subprotocol.clone()])
                .max_message_size(state.config.max_message_size)
                .on_failed_upgrade(|e| warn!(error = %e, "websocket upgrade failed"))
                .on_upgrade(move |socket| async move {
                    let channel = WebSocketTransport::spawn(socket, settings, &shutdown);
                    if let Err(channel) = upgraded.send(channel) {
                        debug!("admission handler gone, closing transport");
                        channel.close().await;
                    }
                })
        }
        Ok(Decision::Reject { code, reason }) => {
            let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, reason).into_response()
        }
        Err(_) => {
            warn!("admission handler ended without a decision");
            (StatusCode::INTERNAL_SERVER_ERROR, "admission handler failed").into_response()
        }
    }
}

async fn run_admission_handler(
    handler: Arc<dyn AdmissionHandler>,
    info: RequestInfo,
    admission: Admission,
) {
    match handler.on_connection(info, admission.clone()).await {
        Ok(()) if !admission.is_replied() => {
            warn!("admission handler returned without replying");
            admission.reject_if_pending("connection request not replied");
        }
        Ok(()) => {}
        Err(e) => {
            let reason = format!("{e:#}");
            warn!(%reason, "admission handler failed");
            admission.reject_if_pending(&reason);
        }
    }
}
