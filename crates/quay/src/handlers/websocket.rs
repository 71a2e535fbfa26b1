//! WebSocket endpoints
//!
//! Endpoints are registered by path. Each accepted connection gets a fresh
//! endpoint instance from its registration's factory; framing is handled by
//! tokio-tungstenite.
//!
//! ```
//! use quay::websocket::{Endpoint, ServerEndpoint, Session, WebSocketMessage, WebSocketRegistration};
//!
//! #[derive(Default)]
//! struct Echo;
//!
//! impl Endpoint for Echo {
//!     fn on_message(&mut self, session: &mut Session, msg: WebSocketMessage) {
//!         if let WebSocketMessage::Text(text) = msg {
//!             session.send_text(format!("Echo: {}", text));
//!         }
//!     }
//! }
//!
//! impl ServerEndpoint for Echo {
//!     const PATH: &'static str = "/echo";
//! }
//!
//! let registration = WebSocketRegistration::of::<Echo>();
//! assert_eq!(registration.id().path(), "/echo");
//! ```

use crate::{Error, HandlerError, Response, ResponseBuilder, Result, StatusCode};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame as WsCloseFrame, Role};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

/// WebSocket message types
#[derive(Debug, Clone, PartialEq)]
pub enum WebSocketMessage {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(Option<CloseFrame>),
}

/// WebSocket close frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: u16,
    pub reason: String,
}

impl CloseFrame {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn normal() -> Self {
        Self::new(1000, "Normal closure")
    }

    pub fn going_away() -> Self {
        Self::new(1001, "Going away")
    }
}

impl From<CloseFrame> for WsCloseFrame<'static> {
    fn from(frame: CloseFrame) -> Self {
        WsCloseFrame {
            code: CloseCode::from(frame.code),
            reason: frame.reason.into(),
        }
    }
}

impl From<WsCloseFrame<'_>> for CloseFrame {
    fn from(frame: WsCloseFrame<'_>) -> Self {
        CloseFrame::new(u16::from(frame.code), frame.reason.into_owned())
    }
}

/// One open websocket connection, as seen by its endpoint
///
/// Outgoing messages are queued and flushed after each callback returns.
#[derive(Debug)]
pub struct Session {
    id: u64,
    path: String,
    subprotocol: Option<String>,
    headers: Vec<(String, String)>,
    outbox: Vec<WebSocketMessage>,
    close_frame: Option<CloseFrame>,
}

impl Session {
    pub(crate) fn new(
        id: u64,
        path: impl Into<String>,
        subprotocol: Option<String>,
        headers: Vec<(String, String)>,
    ) -> Self {
        Self {
            id,
            path: path.into(),
            subprotocol,
            headers,
            outbox: Vec::new(),
            close_frame: None,
        }
    }

    /// Connection ID
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Endpoint path the session was opened on
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Negotiated subprotocol
    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    /// Header from the opening handshake (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Send text message
    pub fn send_text(&mut self, data: impl Into<String>) {
        self.push(WebSocketMessage::Text(data.into()));
    }

    /// Send binary message
    pub fn send_binary(&mut self, data: impl Into<Vec<u8>>) {
        self.push(WebSocketMessage::Binary(data.into()));
    }

    /// Send ping
    pub fn ping(&mut self, data: impl Into<Vec<u8>>) {
        self.push(WebSocketMessage::Ping(data.into()));
    }

    /// Close connection after pending messages are sent
    pub fn close(&mut self, frame: CloseFrame) {
        if self.close_frame.is_none() {
            self.close_frame = Some(frame.clone());
            self.outbox.push(WebSocketMessage::Close(Some(frame)));
        }
    }

    pub fn is_closing(&self) -> bool {
        self.close_frame.is_some()
    }

    fn push(&mut self, msg: WebSocketMessage) {
        // Nothing may follow a close frame
        if self.close_frame.is_none() {
            self.outbox.push(msg);
        }
    }

    /// Take pending messages
    pub(crate) fn take_messages(&mut self) -> Vec<WebSocketMessage> {
        std::mem::take(&mut self.outbox)
    }
}

/// Access to an endpoint's concrete type
///
/// Implemented for every sized `'static` type.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn endpoint_type_name(&self) -> &'static str;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn endpoint_type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// WebSocket endpoint callbacks
///
/// A new instance serves each connection. `on_message` receives text and
/// binary messages; pings are answered by the protocol layer.
pub trait Endpoint: AsAny + Send {
    fn on_open(&mut self, _session: &mut Session) {}

    fn on_message(&mut self, session: &mut Session, msg: WebSocketMessage);

    fn on_close(&mut self, _session: &mut Session, _frame: Option<CloseFrame>) {}

    fn on_error(&mut self, session: &mut Session, error: &str) {
        tracing::debug!(session = session.id(), path = session.path(), error, "websocket error");
    }
}

/// An endpoint type bound to a path
pub trait ServerEndpoint: Endpoint + Sized {
    const PATH: &'static str;
}

/// Produces endpoint instances of one declared type
///
/// Implemented for closures `Fn() -> E`.
pub trait EndpointFactory: Send + Sync + 'static {
    type Endpoint: ServerEndpoint;

    fn create(&self) -> Self::Endpoint;
}

impl<F, E> EndpointFactory for F
where
    F: Fn() -> E + Send + Sync + 'static,
    E: ServerEndpoint,
{
    type Endpoint = E;

    fn create(&self) -> E {
        self()
    }
}

/// Declared identity of a registration: path plus concrete endpoint type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointId {
    path: String,
    type_id: TypeId,
    type_name: &'static str,
}

impl EndpointId {
    /// Identity of a path-bound endpoint type
    pub fn of<E: ServerEndpoint>() -> Self {
        Self::new::<E>(E::PATH)
    }

    /// Identity of an endpoint type at an explicit path
    pub fn new<E: Endpoint>(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            type_id: TypeId::of::<E>(),
            type_name: std::any::type_name::<E>(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

/// A factory produced an endpoint of a different type than it declared
#[derive(Debug, Clone, thiserror::Error)]
#[error("websocket factory for {path} declared {declared} but produced {produced}")]
pub struct EndpointMismatch {
    pub path: String,
    pub declared: &'static str,
    pub produced: &'static str,
}

type MakeEndpoint = dyn Fn() -> Box<dyn Endpoint> + Send + Sync;

/// A websocket endpoint registration
#[derive(Clone)]
pub struct WebSocketRegistration {
    id: EndpointId,
    factory: Arc<MakeEndpoint>,
}

impl WebSocketRegistration {
    /// Register a typed factory; its path comes from the endpoint type
    pub fn new<F: EndpointFactory>(factory: F) -> Self {
        Self {
            id: EndpointId::of::<F::Endpoint>(),
            factory: Arc::new(move || Box::new(factory.create()) as Box<dyn Endpoint>),
        }
    }

    /// Register a default-constructed endpoint type
    pub fn of<E: ServerEndpoint + Default>() -> Self {
        Self::new(E::default)
    }

    /// Register a factory whose products are checked against `id` when each
    /// connection opens
    pub fn dynamic<F>(id: EndpointId, factory: F) -> Self
    where
        F: Fn() -> Box<dyn Endpoint> + Send + Sync + 'static,
    {
        Self {
            id,
            factory: Arc::new(factory),
        }
    }

    pub fn id(&self) -> &EndpointId {
        &self.id
    }

    pub(crate) fn instantiate(&self) -> std::result::Result<Box<dyn Endpoint>, EndpointMismatch> {
        let endpoint = (self.factory)();
        // Deref to `dyn Endpoint` so the vtable reports the concrete type
        let concrete: &dyn Endpoint = &*endpoint;
        if concrete.as_any().type_id() != self.id.type_id {
            return Err(EndpointMismatch {
                path: self.id.path.clone(),
                declared: self.id.type_name,
                produced: concrete.endpoint_type_name(),
            });
        }
        Ok(endpoint)
    }
}

impl std::fmt::Debug for WebSocketRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketRegistration").field("id", &self.id).finish()
    }
}

/// Endpoint configuration passed to the handshake hook
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub path: String,
    pub endpoint_type: &'static str,
    /// Subprotocols the server supports
    pub subprotocols: Vec<String>,
}

/// The client's opening handshake
#[derive(Debug, Clone)]
pub struct HandshakeRequest {
    pub path: String,
    pub query: Option<String>,
    pub headers: Vec<(String, String)>,
}

impl HandshakeRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Extra headers for the server's handshake response
#[derive(Debug, Clone, Default)]
pub struct HandshakeResponse {
    pub headers: Vec<(String, String)>,
}

impl HandshakeResponse {
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }
}

/// Hook invoked before the upgrade completes
///
/// Implemented for closures with the same signature.
pub trait HandshakeModifier: Send + Sync + 'static {
    fn modify_handshake(&self, config: &EndpointConfig, request: &HandshakeRequest, response: &mut HandshakeResponse);
}

impl<F> HandshakeModifier for F
where
    F: Fn(&EndpointConfig, &HandshakeRequest, &mut HandshakeResponse) + Send + Sync + 'static,
{
    fn modify_handshake(&self, config: &EndpointConfig, request: &HandshakeRequest, response: &mut HandshakeResponse) {
        self(config, request, response)
    }
}

/// Check if request is WebSocket upgrade
pub fn is_websocket_upgrade(headers: &http::HeaderMap) -> bool {
    let header = |name: http::header::HeaderName| {
        headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect::<Vec<_>>()
            .join(",")
    };

    let upgrade = header(http::header::UPGRADE);
    let connection = header(http::header::CONNECTION);

    upgrade.split(',').any(|t| t.trim().eq_ignore_ascii_case("websocket"))
        && connection.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade"))
        && headers.contains_key(http::header::SEC_WEBSOCKET_KEY)
}

/// Subprotocols offered by the client, in preference order
fn offered_subprotocols(headers: &http::HeaderMap) -> Vec<String> {
    headers
        .get_all(http::header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

/// First client-offered protocol the server supports
pub fn negotiate_subprotocol(offered: &[String], supported: &[String]) -> Option<String> {
    offered.iter().find(|p| supported.contains(p)).cloned()
}

/// Registered endpoints plus handshake settings
pub(crate) struct WebSocketRoutes {
    endpoints: HashMap<String, WebSocketRegistration>,
    subprotocols: Vec<String>,
    modifier: Option<Arc<dyn HandshakeModifier>>,
    next_session: AtomicU64,
}

impl WebSocketRoutes {
    pub(crate) fn new(
        registrations: Vec<WebSocketRegistration>,
        subprotocols: Vec<String>,
        modifier: Option<Arc<dyn HandshakeModifier>>,
    ) -> Result<Self> {
        let mut endpoints = HashMap::with_capacity(registrations.len());
        for registration in registrations {
            let path = registration.id.path.clone();
            if endpoints.insert(path.clone(), registration).is_some() {
                return Err(Error::InvalidPattern(format!(
                    "websocket path '{}' is registered more than once",
                    path
                )));
            }
        }
        Ok(Self {
            endpoints,
            subprotocols,
            modifier,
            next_session: AtomicU64::new(1),
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub(crate) fn get(&self, path: &str) -> Option<&WebSocketRegistration> {
        self.endpoints.get(path)
    }

    /// Answer an upgrade request and spawn the session
    ///
    /// Must be called from within the server runtime.
    pub(crate) fn upgrade(
        &self,
        registration: &WebSocketRegistration,
        req: &mut hyper::Request<hyper::body::Incoming>,
        shutdown: watch::Receiver<bool>,
    ) -> std::result::Result<Response, HandlerError> {
        let version = req
            .headers()
            .get(http::header::SEC_WEBSOCKET_VERSION)
            .and_then(|v| v.to_str().ok());
        if version != Some("13") {
            return Err(HandlerError::bad_request("Unsupported websocket version")
                .with_header("Sec-WebSocket-Version", "13"));
        }
        let key = req
            .headers()
            .get(http::header::SEC_WEBSOCKET_KEY)
            .map(|k| derive_accept_key(k.as_bytes()))
            .ok_or_else(|| HandlerError::bad_request("Missing Sec-WebSocket-Key"))?;

        let endpoint = registration.instantiate().map_err(|e| {
            tracing::warn!(error = %e, "websocket handshake failed");
            HandlerError::internal(e.to_string())
        })?;

        let negotiated = negotiate_subprotocol(&offered_subprotocols(req.headers()), &self.subprotocols);

        let handshake = HandshakeRequest {
            path: registration.id.path.clone(),
            query: req.uri().query().map(str::to_string),
            headers: req
                .headers()
                .iter()
                .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
                .collect(),
        };
        let mut extra = HandshakeResponse::default();
        if let Some(modifier) = &self.modifier {
            let config = EndpointConfig {
                path: registration.id.path.clone(),
                endpoint_type: registration.id.type_name,
                subprotocols: self.subprotocols.clone(),
            };
            modifier.modify_handshake(&config, &handshake, &mut extra);
        }

        let mut response = ResponseBuilder::new(StatusCode::SWITCHING_PROTOCOLS)
            .header("Upgrade", "websocket")
            .header("Connection", "Upgrade")
            .header("Sec-WebSocket-Accept", key)
            .build();
        if let Some(protocol) = &negotiated {
            response.add_header("Sec-WebSocket-Protocol", protocol.as_str());
        }
        response.headers.extend(extra.headers);

        let session = Session::new(
            self.next_session.fetch_add(1, Ordering::Relaxed),
            registration.id.path.clone(),
            negotiated,
            handshake.headers,
        );
        let on_upgrade = hyper::upgrade::on(req);
        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    let io = hyper_util::rt::TokioIo::new(upgraded);
                    let ws = WebSocketStream::from_raw_socket(io, Role::Server, None).await;
                    run_session(ws, endpoint, session, shutdown).await;
                }
                Err(e) => tracing::debug!(error = %e, "websocket upgrade failed"),
            }
        });

        Ok(response)
    }
}

fn to_wire(msg: WebSocketMessage) -> Message {
    match msg {
        WebSocketMessage::Text(text) => Message::Text(text),
        WebSocketMessage::Binary(data) => Message::Binary(data),
        WebSocketMessage::Ping(data) => Message::Ping(data),
        WebSocketMessage::Pong(data) => Message::Pong(data),
        WebSocketMessage::Close(frame) => Message::Close(frame.map(Into::into)),
    }
}

async fn flush<S>(ws: &mut WebSocketStream<S>, session: &mut Session) -> bool
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    use futures_util::SinkExt;

    for msg in session.take_messages() {
        if let Err(e) = ws.feed(to_wire(msg)).await {
            tracing::debug!(session = session.id(), error = %e, "websocket send failed");
            return false;
        }
    }
    ws.flush().await.is_ok()
}

/// Drive one connection until either side closes or the server stops
pub(crate) async fn run_session<S>(
    mut ws: WebSocketStream<S>,
    mut endpoint: Box<dyn Endpoint>,
    mut session: Session,
    mut shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    use futures_util::StreamExt;

    tracing::debug!(session = session.id(), path = session.path(), "websocket opened");
    endpoint.on_open(&mut session);

    loop {
        if !flush(&mut ws, &mut session).await {
            endpoint.on_close(&mut session, None);
            break;
        }
        if let Some(frame) = session.close_frame.clone() {
            endpoint.on_close(&mut session, Some(frame));
            break;
        }

        tokio::select! {
            incoming = ws.next() => match incoming {
                Some(Ok(Message::Text(text))) => endpoint.on_message(&mut session, WebSocketMessage::Text(text)),
                Some(Ok(Message::Binary(data))) => endpoint.on_message(&mut session, WebSocketMessage::Binary(data)),
                Some(Ok(Message::Close(frame))) => {
                    endpoint.on_close(&mut session, frame.map(Into::into));
                    break;
                }
                // Ping/pong handled by tungstenite
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    endpoint.on_error(&mut session, &e.to_string());
                    endpoint.on_close(&mut session, None);
                    break;
                }
                None => {
                    endpoint.on_close(&mut session, None);
                    break;
                }
            },
            _ = crate::server::shutdown_signal(&mut shutdown) => {
                session.close(CloseFrame::going_away());
                let _ = flush(&mut ws, &mut session).await;
                endpoint.on_close(&mut session, Some(CloseFrame::going_away()));
                break;
            }
        }
    }

    let _ = ws.close(None).await;
    tracing::debug!(session = session.id(), "websocket closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Echo;

    impl Endpoint for Echo {
        fn on_open(&mut self, session: &mut Session) {
            session.send_text("connected");
        }

        fn on_message(&mut self, session: &mut Session, msg: WebSocketMessage) {
            if let WebSocketMessage::Text(text) = msg {
                session.send_text(format!("Echo: {}", text));
            }
        }
    }

    impl ServerEndpoint for Echo {
        const PATH: &'static str = "/echo";
    }

    struct Other;

    impl Endpoint for Other {
        fn on_message(&mut self, _session: &mut Session, _msg: WebSocketMessage) {}
    }

    #[test]
    fn test_typed_registration() {
        let registration = WebSocketRegistration::new(|| Echo);
        assert_eq!(registration.id(), &EndpointId::of::<Echo>());
        assert_eq!(registration.id().path(), "/echo");
        assert!(registration.instantiate().is_ok());
    }

    #[test]
    fn test_dynamic_registration_checks_type() {
        let ok = WebSocketRegistration::dynamic(EndpointId::of::<Echo>(), || Box::new(Echo) as Box<dyn Endpoint>);
        assert!(ok.instantiate().is_ok());

        let bad = WebSocketRegistration::dynamic(EndpointId::of::<Echo>(), || Box::new(Other) as Box<dyn Endpoint>);
        let err = bad.instantiate().err().unwrap();
        assert_eq!(err.path, "/echo");
        assert!(err.declared.ends_with("Echo"));
        assert!(err.produced.ends_with("Other"));
    }

    #[test]
    fn test_session_queue() {
        let mut session = Session::new(1, "/echo", Some("chat".to_string()), vec![("X-Test".to_string(), "1".to_string())]);
        assert_eq!(session.subprotocol(), Some("chat"));
        assert_eq!(session.header("x-test"), Some("1"));

        session.send_text("a");
        session.close(CloseFrame::normal());
        session.send_text("ignored");
        session.close(CloseFrame::going_away());

        assert!(session.is_closing());
        assert_eq!(
            session.take_messages(),
            vec![
                WebSocketMessage::Text("a".to_string()),
                WebSocketMessage::Close(Some(CloseFrame::normal())),
            ]
        );
        assert!(session.take_messages().is_empty());
    }

    #[test]
    fn test_negotiate_subprotocol() {
        let supported = vec!["subprotocol".to_string(), "chat".to_string()];
        let offered = vec!["v2".to_string(), "chat".to_string(), "subprotocol".to_string()];
        assert_eq!(negotiate_subprotocol(&offered, &supported).as_deref(), Some("chat"));
        assert_eq!(negotiate_subprotocol(&["v2".to_string()], &supported), None);
        assert_eq!(negotiate_subprotocol(&[], &[]), None);
    }

    #[test]
    fn test_upgrade_detection() {
        let mut headers = http::HeaderMap::new();
        headers.insert(http::header::UPGRADE, "websocket".parse().unwrap());
        headers.insert(http::header::CONNECTION, "keep-alive, Upgrade".parse().unwrap());
        assert!(!is_websocket_upgrade(&headers));

        headers.insert(http::header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==".parse().unwrap());
        assert!(is_websocket_upgrade(&headers));

        headers.insert(http::header::SEC_WEBSOCKET_PROTOCOL, "a, b".parse().unwrap());
        headers.append(http::header::SEC_WEBSOCKET_PROTOCOL, "c".parse().unwrap());
        assert_eq!(offered_subprotocols(&headers), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_duplicate_paths_rejected() {
        let result = WebSocketRoutes::new(
            vec![WebSocketRegistration::of::<Echo>(), WebSocketRegistration::of::<Echo>()],
            Vec::new(),
            None,
        );
        assert!(matches!(result, Err(Error::InvalidPattern(_))));
    }

    #[test]
    fn test_close_frame_conversion() {
        let wire: WsCloseFrame<'static> = CloseFrame::going_away().into();
        assert_eq!(u16::from(wire.code), 1001);
        assert_eq!(CloseFrame::from(wire), CloseFrame::going_away());
    }
}
