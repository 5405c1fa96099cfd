//! Connection admission.
//!
//! Every WebSocket upgrade request that passes the sub-protocol check is
//! handed to the registered [`AdmissionHandler`] together with an
//! [`Admission`]. The handler decides exactly once: [`Admission::accept`]
//! completes the upgrade and yields a [`TransportChannel`] to build a peer
//! from, [`Admission::reject`] answers the HTTP request with an error status.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use axum::extract::Query;
use axum::http::{HeaderMap, Uri, header};
use parking_lot::Mutex;
use protoo_core::TransportChannel;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::errors::AdmissionError;

/// What the server knows about a connection attempt.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    /// Request URI.
    pub uri: Uri,
    /// Request headers.
    pub headers: HeaderMap,
    /// Remote socket address, when the server was started with connect info.
    pub remote_addr: Option<SocketAddr>,
    query: HashMap<String, String>,
}

impl RequestInfo {
    /// Build from the pieces of an HTTP request.
    pub fn new(uri: Uri, headers: HeaderMap, remote_addr: Option<SocketAddr>) -> Self {
        let query = Query::<HashMap<String, String>>::try_from_uri(&uri)
            .map(|Query(q)| q)
            .unwrap_or_default();
        Self {
            uri,
            headers,
            remote_addr,
            query,
        }
    }

    /// URI path.
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// One query parameter.
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }

    /// All query parameters.
    pub fn query(&self) -> &HashMap<String, String> {
        &self.query
    }

    /// `Origin` header, if present and valid UTF-8.
    pub fn origin(&self) -> Option<&str> {
        self.headers
            .get(header::ORIGIN)
            .and_then(|v| v.to_str().ok())
    }

    /// Sub-protocols offered in `Sec-WebSocket-Protocol`.
    pub fn subprotocols(&self) -> Vec<&str> {
        offered_subprotocols(&self.headers)
    }
}

/// Sub-protocols listed across all `Sec-WebSocket-Protocol` headers.
pub fn offered_subprotocols(headers: &HeaderMap) -> Vec<&str> {
    headers
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect()
}

/// Decides whether a connection attempt becomes a transport.
///
/// Returning an error, or returning without calling `accept` or `reject`,
/// rejects the attempt with `500`.
#[async_trait]
pub trait AdmissionHandler: Send + Sync + 'static {
    /// Handle one connection attempt.
    async fn on_connection(&self, info: RequestInfo, admission: Admission) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> AdmissionHandler for F
where
    F: Fn(RequestInfo, Admission) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn on_connection(&self, info: RequestInfo, admission: Admission) -> anyhow::Result<()> {
        self(info, admission).await
    }
}

/// The decision delivered to the HTTP side.
#[derive(Debug)]
pub(crate) enum Decision {
    /// Upgrade, then hand the transport back through the sender.
    Accept(oneshot::Sender<TransportChannel>),
    /// Answer with this status and body.
    Reject { code: u16, reason: String },
}

struct AdmissionInner {
    replied: AtomicBool,
    decision: Mutex<Option<oneshot::Sender<Decision>>>,
}

/// One-shot reply handle for a connection attempt. Clones share the reply.
#[derive(Clone)]
pub struct Admission {
    inner: Arc<AdmissionInner>,
}

impl Admission {
    pub(crate) fn new() -> (Self, oneshot::Receiver<Decision>) {
        let (tx, rx) = oneshot::channel();
        let admission = Self {
            inner: Arc::new(AdmissionInner {
                replied: AtomicBool::new(false),
                decision: Mutex::new(Some(tx)),
            }),
        };
        (admission, rx)
    }

    /// Accept the connection and wait for the upgraded transport.
    pub async fn accept(&self) -> Result<TransportChannel, AdmissionError> {
        if self.inner.replied.swap(true, Ordering::SeqCst) {
            warn!("accept() called on an already replied connection request");
            return Err(AdmissionError::AlreadyReplied);
        }
        debug!("accept()");
        let (tx, rx) = oneshot::channel();
        self.decide(Decision::Accept(tx))?;
        rx.await.map_err(|_| AdmissionError::UpgradeFailed)
    }

    /// Reject the connection with an HTTP status and reason.
    pub fn reject(&self, code: u16, reason: impl Into<String>) -> Result<(), AdmissionError> {
        if self.inner.replied.swap(true, Ordering::SeqCst) {
            warn!("reject() called on an already replied connection request");
            return Err(AdmissionError::AlreadyReplied);
        }
        let reason = reason.into();
        debug!(code, %reason, "reject()");
        self.decide(Decision::Reject { code, reason })
    }

    /// Whether `accept` or `reject` has been called.
    pub fn is_replied(&self) -> bool {
        self.inner.replied.load(Ordering::SeqCst)
    }

    /// Reject with `500` unless a reply was already sent.
    pub(crate) fn reject_if_pending(&self, reason: &str) {
        if !self.is_replied() {
            let _ = self.reject(500, reason);
        }
    }

    fn decide(&self, decision: Decision) -> Result<(), AdmissionError> {
        let sender = self.inner.decision.lock().take();
        match sender {
            Some(tx) => tx.send(decision).map_err(|_| AdmissionError::Abandoned),
            None => Err(AdmissionError::AlreadyReplied),
        }
    }
}

impl fmt::Debug for Admission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Admission")
            .field("replied", &self.is_replied())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use axum::http::HeaderValue;
    use protoo_core::transport::MemoryTransport;

    fn headers_with_protocols(values: &[&'static str]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for v in values {
            let _ = headers.append(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(v));
        }
        headers
    }

    #[test]
    fn parses_subprotocol_lists() {
        let headers = headers_with_protocols(&["chat, protoo", "other"]);
        assert_eq!(offered_subprotocols(&headers), ["chat", "protoo", "other"]);
        assert!(offered_subprotocols(&HeaderMap::new()).is_empty());
    }

    #[test]
    fn request_info_exposes_query_and_origin() {
        let mut headers = headers_with_protocols(&["protoo"]);
        let _ = headers.insert(header::ORIGIN, HeaderValue::from_static("https://example.org"));
        let info = RequestInfo::new(
            "/room?peerId=alice&roomId=r1".parse().unwrap(),
            headers,
            Some("10.0.0.1:5000".parse().unwrap()),
        );

        assert_eq!(info.path(), "/room");
        assert_eq!(info.query_param("peerId"), Some("alice"));
        assert_eq!(info.query_param("missing"), None);
        assert_eq!(info.query().len(), 2);
        assert_eq!(info.origin(), Some("https://example.org"));
        assert_eq!(info.subprotocols(), ["protoo"]);
    }

    #[test]
    fn reject_is_delivered_once() {
        let (admission, mut rx) = Admission::new();
        admission.reject(403, "Sorry!").unwrap();
        assert!(admission.is_replied());
        assert_matches!(
            admission.reject(500, "again"),
            Err(AdmissionError::AlreadyReplied)
        );
        assert_matches!(
            rx.try_recv(),
            Ok(Decision::Reject { code: 403, reason }) if reason == "Sorry!"
        );
    }

    #[tokio::test]
    async fn accept_after_reject_fails() {
        let (admission, _rx) = Admission::new();
        admission.reject(403, "no").unwrap();
        assert_matches!(
            admission.accept().await,
            Err(AdmissionError::AlreadyReplied)
        );
    }

    #[tokio::test]
    async fn accept_yields_the_upgraded_transport() {
        let (admission, rx) = Admission::new();
        let waiting = tokio::spawn({
            let admission = admission.clone();
            async move { admission.accept().await }
        });

        let Ok(Decision::Accept(upgraded)) = rx.await else {
            panic!("expected accept decision");
        };
        let (local, _remote) = MemoryTransport::pair();
        upgraded.send(local).unwrap();

        let channel = waiting.await.unwrap().unwrap();
        assert!(!channel.transport().is_closed());
        assert!(admission.reject(500, "late").is_err());
    }

    #[tokio::test]
    async fn failed_upgrade_is_reported() {
        let (admission, rx) = Admission::new();
        let waiting = tokio::spawn({
            let admission = admission.clone();
            async move { admission.accept().await }
        });
        let Ok(Decision::Accept(upgraded)) = rx.await else {
            panic!("expected accept decision");
        };
        drop(upgraded);
        assert_matches!(waiting.await.unwrap(), Err(AdmissionError::UpgradeFailed));
    }

    #[test]
    fn abandoned_request_is_reported() {
        let (admission, rx) = Admission::new();
        drop(rx);
        assert_matches!(admission.reject(403, "x"), Err(AdmissionError::Abandoned));
    }

    #[test]
    fn reject_if_pending_only_replies_once() {
        let (admission, mut rx) = Admission::new();
        admission.reject_if_pending("handler failed");
        admission.reject_if_pending("second");
        assert_matches!(rx.try_recv(), Ok(Decision::Reject { code: 500, .. }));
    }
}
