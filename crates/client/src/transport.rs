use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use anyhow::Context;
use dispatch_protocol::{ClientMessage, ServerMessage, SignalingConfig};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};

/// Event name under which subscribers are told the connection dropped.
pub const TRANSPORT_LOST: &str = "transportLost";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Handler = Arc<dyn Fn(&Inbound) + Send + Sync>;

/// Outgoing half of the signaling channel, as seen by the negotiation core.
pub trait Signaler: Send + Sync {
    /// Queue a message for the server. Fire-and-forget; fails with
    /// [`CoreError::NotConnected`] once the connection is gone.
    fn send(&self, message: ClientMessage) -> Result<()>;
}

/// Something the transport received.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Message(ServerMessage),
    Lost { reason: String },
}

impl Inbound {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Message(msg) => msg.event_name(),
            Self::Lost { .. } => TRANSPORT_LOST,
        }
    }
}

enum Outbound {
    Message(ClientMessage),
    Close,
}

struct Subscriber {
    id: u64,
    event: Option<String>,
    handler: Handler,
}

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    list: Vec<Subscriber>,
    /// Events received before anyone subscribed
    backlog: Vec<Inbound>,
}

impl Subscribers {
    fn deliver(&self, event: &Inbound) {
        let name = event.event_name();
        for sub in &self.list {
            if sub.event.as_deref().is_none_or(|e| e == name) {
                (sub.handler)(event);
            }
        }
    }
}

fn lock(subscribers: &Mutex<Subscribers>) -> MutexGuard<'_, Subscribers> {
    subscribers.lock().unwrap_or_else(|e| e.into_inner())
}

/// Persistent WebSocket channel to the signaling server.
///
/// Inbound frames are dispatched on the transport's receive task in receipt
/// order. Handlers run with the subscriber list locked, so they must not block
/// or subscribe from inside a handler. Sending after the connection is lost is
/// rejected; there is no implicit reconnect.
pub struct SignalingTransport {
    url: String,
    outbound: mpsc::UnboundedSender<Outbound>,
    connected: Arc<AtomicBool>,
    subscribers: Arc<Mutex<Subscribers>>,
}

/// Handle returned by [`SignalingTransport::subscribe`].
pub struct Subscription {
    id: u64,
    subscribers: Weak<Mutex<Subscribers>>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(subscribers) = self.subscribers.upgrade() {
            lock(&subscribers).list.retain(|s| s.id != self.id);
        }
    }
}

impl SignalingTransport {
    /// Connect to the primary server, then once to the fallback if one is configured.
    pub async fn connect(config: &SignalingConfig) -> Result<Self> {
        let timeout = Duration::from_millis(config.connect_timeout_ms);
        let mut tried = Vec::new();

        for url in std::iter::once(&config.primary_url).chain(config.fallback_url.as_ref()) {
            if !tried.is_empty() {
                warn!(url = %url, "Trying fallback signaling server");
            }
            tried.push(url.clone());
            info!(url = %url, "Connecting to signaling server");
            match open(url, timeout, config.tls_cert.as_deref()).await {
                Ok(ws) => {
                    info!(url = %url, "Connected to signaling server");
                    return Ok(Self::start(url, ws));
                }
                Err(e) => warn!(url = %url, "Signaling connection failed: {e:#}"),
            }
        }

        Err(CoreError::TransportUnavailable { tried })
    }

    fn start(url: &str, ws: WsStream) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(true));
        let subscribers = Arc::new(Mutex::new(Subscribers::default()));
        tokio::spawn(pump(
            url.to_string(),
            ws,
            rx,
            Arc::clone(&connected),
            Arc::clone(&subscribers),
        ));
        Self {
            url: url.to_string(),
            outbound: tx,
            connected,
            subscribers,
        }
    }

    /// Server this transport ended up connected to.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Invoke `handler` for every inbound event named `event`
    /// ([`TRANSPORT_LOST`] for connection loss).
    pub fn subscribe(
        &self,
        event: &str,
        handler: impl Fn(&Inbound) + Send + Sync + 'static,
    ) -> Subscription {
        self.add_subscriber(Some(event.to_string()), Arc::new(handler))
    }

    /// Invoke `handler` for every inbound event.
    pub fn subscribe_all(&self, handler: impl Fn(&Inbound) + Send + Sync + 'static) -> Subscription {
        self.add_subscriber(None, Arc::new(handler))
    }

    /// Forward every inbound event into a channel.
    pub fn forward_to(&self, tx: mpsc::UnboundedSender<Inbound>) -> Subscription {
        self.subscribe_all(move |event| {
            let _ = tx.send(event.clone());
        })
    }

    fn add_subscriber(&self, event: Option<String>, handler: Handler) -> Subscription {
        let mut subs = lock(&self.subscribers);
        let id = subs.next_id;
        subs.next_id += 1;
        subs.list.push(Subscriber { id, event, handler });
        // The first subscriber gets whatever arrived before it (typically `me`).
        if subs.list.len() == 1 && !subs.backlog.is_empty() {
            let backlog = std::mem::take(&mut subs.backlog);
            debug!(count = backlog.len(), "Replaying early signaling events");
            for event in &backlog {
                subs.deliver(event);
            }
        }
        Subscription {
            id,
            subscribers: Arc::downgrade(&self.subscribers),
        }
    }

    /// Close the connection. No `transportLost` is reported for a local close.
    pub fn close(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.outbound.send(Outbound::Close);
        }
    }
}

impl Signaler for SignalingTransport {
    fn send(&self, message: ClientMessage) -> Result<()> {
        if !self.is_connected() {
            return Err(CoreError::NotConnected);
        }
        debug!(event = message.event_name(), "Signal queued");
        self.outbound
            .send(Outbound::Message(message))
            .map_err(|_| CoreError::NotConnected)
    }
}

impl std::fmt::Debug for SignalingTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingTransport")
            .field("url", &self.url)
            .field("connected", &self.is_connected())
            .finish()
    }
}

async fn open(url: &str, timeout: Duration, tls_cert: Option<&str>) -> anyhow::Result<WsStream> {
    let connector = if url.starts_with("wss://") {
        Some(build_tls_connector(tls_cert)?)
    } else {
        None
    };
    let mut ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default();
    ws_config.max_message_size = Some(1 << 20);

    let (ws, _) = tokio::time::timeout(
        timeout,
        tokio_tungstenite::connect_async_tls_with_config(url, Some(ws_config), false, connector),
    )
    .await
    .with_context(|| format!("Timed out after {}ms", timeout.as_millis()))?
    .context("WebSocket connection failed")?;
    Ok(ws)
}

/// TLS connector trusting the platform roots plus an optional pinned CA.
fn build_tls_connector(tls_cert_path: Option<&str>) -> anyhow::Result<tokio_tungstenite::Connector> {
    let mut root_store = rustls::RootCertStore::empty();

    let native = rustls_native_certs::load_native_certs();
    for e in &native.errors {
        warn!("Failed to load a platform certificate: {e}");
    }
    for cert in native.certs {
        let _ = root_store.add(cert);
    }

    if let Some(cert_path) = tls_cert_path {
        let pem_data = std::fs::read(cert_path)
            .with_context(|| format!("Failed to read TLS cert from {cert_path}"))?;
        for cert in rustls_pemfile::certs(&mut pem_data.as_slice()).filter_map(|r| r.ok()) {
            root_store
                .add(cert)
                .with_context(|| format!("Invalid certificate in {cert_path}"))?;
        }
        info!("Pinned signaling server certificate from {cert_path}");
    }

    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(tokio_tungstenite::Connector::Rustls(Arc::new(tls_config)))
}

async fn pump(
    url: String,
    ws: WsStream,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    connected: Arc<AtomicBool>,
    subscribers: Arc<Mutex<Subscribers>>,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    let reason = loop {
        tokio::select! {
            frame = ws_rx.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerMessage>(&text) {
                            Ok(msg) => {
                                debug!(event = msg.event_name(), "Signal received");
                                dispatch(&subscribers, Inbound::Message(msg));
                            }
                            Err(e) => warn!("Dropping invalid signaling frame: {e}"),
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break match frame {
                            Some(f) => format!("closed by server: {}", &*f.reason),
                            None => "closed by server".to_string(),
                        };
                    }
                    None => break "connection closed".to_string(),
                    Some(Err(e)) => break format!("connection error: {e}"),
                    Some(Ok(_)) => {}
                }
            }
            out = outbound.recv() => {
                match out {
                    Some(Outbound::Message(msg)) => {
                        let text = match serde_json::to_string(&msg) {
                            Ok(text) => text,
                            Err(e) => {
                                warn!(event = msg.event_name(), "Failed to encode signal: {e}");
                                continue;
                            }
                        };
                        if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                            break format!("send failed: {e}");
                        }
                    }
                    Some(Outbound::Close) | None => {
                        connected.store(false, Ordering::SeqCst);
                        let _ = ws_tx.send(Message::Close(None)).await;
                        info!(url = %url, "Signaling connection closed");
                        return;
                    }
                }
            }
        }
    };

    connected.store(false, Ordering::SeqCst);
    warn!(url = %url, %reason, "Signaling transport lost");
    dispatch(&subscribers, Inbound::Lost { reason });
}

fn dispatch(subscribers: &Mutex<Subscribers>, event: Inbound) {
    let mut subs = lock(subscribers);
    if subs.list.is_empty() {
        subs.backlog.push(event);
        return;
    }
    subs.deliver(&event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_protocol::Role;
    use tokio::net::TcpListener;

    type ServerWs = WebSocketStream<TcpStream>;

    /// Accept one WebSocket client and hand it to `script`.
    async fn serve<F, Fut>(script: F) -> String
    where
        F: FnOnce(ServerWs) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            script(ws).await;
        });
        format!("ws://{addr}")
    }

    /// A local address nothing listens on.
    async fn refused_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("ws://{addr}")
    }

    /// Accepts TCP connections but never completes the WebSocket handshake.
    async fn silent_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        format!("ws://{addr}")
    }

    fn config(primary: String, fallback: Option<String>) -> SignalingConfig {
        SignalingConfig {
            primary_url: primary,
            fallback_url: fallback,
            connect_timeout_ms: 2000,
            tls_cert: None,
        }
    }

    async fn push(ws: &mut ServerWs, msg: &ServerMessage) {
        let text = serde_json::to_string(msg).unwrap();
        ws.send(Message::Text(text.into())).await.unwrap();
    }

    #[tokio::test]
    async fn delivers_events_in_receipt_order() {
        let url = serve(|mut ws| async move {
            push(&mut ws, &ServerMessage::Me("me-1".to_string())).await;
            push(&mut ws, &ServerMessage::RoomJoined { room: "r".to_string() }).await;
            push(&mut ws, &ServerMessage::ParticipantLeft { id: "x".to_string() }).await;
            // Keep the socket open until the client goes away.
            while ws.next().await.is_some() {}
        })
        .await;

        let transport = SignalingTransport::connect(&config(url.clone(), None)).await.unwrap();
        assert_eq!(transport.url(), url);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = transport.forward_to(tx);

        let names: Vec<&str> = [
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
        ]
        .iter()
        .map(Inbound::event_name)
        .collect();
        assert_eq!(names, vec!["me", "roomJoined", "participantLeft"]);
    }

    #[tokio::test]
    async fn sends_json_frames() {
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let url = serve(move |mut ws| async move {
            while let Some(Ok(frame)) = ws.next().await {
                if let Message::Text(text) = frame {
                    let msg: ClientMessage = serde_json::from_str(&text).unwrap();
                    let _ = seen_tx.send(msg);
                }
            }
        })
        .await;

        let transport = SignalingTransport::connect(&config(url, None)).await.unwrap();
        transport
            .send(ClientMessage::JoinRoom {
                room: "room-7".to_string(),
                role: Some(Role::Agent),
            })
            .unwrap();
        assert_eq!(
            seen_rx.recv().await.unwrap(),
            ClientMessage::JoinRoom {
                room: "room-7".to_string(),
                role: Some(Role::Agent),
            }
        );
    }

    #[tokio::test]
    async fn falls_back_when_primary_refuses() {
        let fallback = serve(|mut ws| async move { while ws.next().await.is_some() {} }).await;
        let primary = refused_url().await;
        let transport = SignalingTransport::connect(&config(primary, Some(fallback.clone())))
            .await
            .unwrap();
        assert_eq!(transport.url(), fallback);
        assert!(transport.is_connected());
    }

    #[tokio::test]
    async fn falls_back_when_primary_handshake_stalls() {
        let fallback = serve(|mut ws| async move { while ws.next().await.is_some() {} }).await;
        let primary = silent_url().await;
        let mut config = config(primary, Some(fallback.clone()));
        config.connect_timeout_ms = 200;

        let started = std::time::Instant::now();
        let transport = SignalingTransport::connect(&config).await.unwrap();
        assert_eq!(transport.url(), fallback);
        assert!(transport.is_connected());
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn unavailable_after_primary_and_fallback() {
        let primary = refused_url().await;
        let fallback = refused_url().await;
        match SignalingTransport::connect(&config(primary.clone(), Some(fallback.clone()))).await {
            Err(CoreError::TransportUnavailable { tried }) => {
                assert_eq!(tried, vec![primary, fallback]);
            }
            other => panic!("Expected TransportUnavailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unavailable_without_fallback_tries_once() {
        let primary = refused_url().await;
        match SignalingTransport::connect(&config(primary.clone(), None)).await {
            Err(CoreError::TransportUnavailable { tried }) => assert_eq!(tried, vec![primary]),
            other => panic!("Expected TransportUnavailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_close_reports_transport_lost() {
        let url = serve(|mut ws| async move {
            push(&mut ws, &ServerMessage::Me("me-1".to_string())).await;
            let _ = ws.close(None).await;
        })
        .await;

        let transport = SignalingTransport::connect(&config(url, None)).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = transport.forward_to(tx);

        assert_eq!(rx.recv().await.unwrap().event_name(), "me");
        assert!(matches!(rx.recv().await.unwrap(), Inbound::Lost { .. }));
        assert!(!transport.is_connected());
        assert!(matches!(
            transport.send(ClientMessage::EndCall { id: None }),
            Err(CoreError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn named_subscriptions_filter_and_unsubscribe() {
        let (go_tx, mut go_rx) = mpsc::unbounded_channel::<()>();
        let url = serve(move |mut ws| async move {
            push(&mut ws, &ServerMessage::Me("me-1".to_string())).await;
            let _ = go_rx.recv().await;
            push(&mut ws, &ServerMessage::RoomJoined { room: "a".to_string() }).await;
            push(&mut ws, &ServerMessage::ParticipantLeft { id: "x".to_string() }).await;
            let _ = go_rx.recv().await;
            push(&mut ws, &ServerMessage::RoomJoined { room: "b".to_string() }).await;
            while ws.next().await.is_some() {}
        })
        .await;

        let transport = SignalingTransport::connect(&config(url, None)).await.unwrap();
        let (all_tx, mut all_rx) = mpsc::unbounded_channel();
        let _all = transport.forward_to(all_tx);
        assert_eq!(all_rx.recv().await.unwrap().event_name(), "me");

        let (joined_tx, mut joined_rx) = mpsc::unbounded_channel();
        let joined = transport.subscribe("roomJoined", move |event| {
            let _ = joined_tx.send(event.clone());
        });
        go_tx.send(()).unwrap();

        assert_eq!(
            joined_rx.recv().await.unwrap(),
            Inbound::Message(ServerMessage::RoomJoined { room: "a".to_string() })
        );
        for expected in ["roomJoined", "participantLeft"] {
            assert_eq!(all_rx.recv().await.unwrap().event_name(), expected);
        }
        assert!(joined_rx.try_recv().is_err());

        joined.unsubscribe();
        go_tx.send(()).unwrap();
        assert_eq!(all_rx.recv().await.unwrap().event_name(), "roomJoined");
        assert!(joined_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn invalid_frames_are_dropped() {
        let url = serve(|mut ws| async move {
            ws.send(Message::Text("not json".into())).await.unwrap();
            ws.send(Message::Text(r#"{"event":"mystery","data":{}}"#.into()))
                .await
                .unwrap();
            push(&mut ws, &ServerMessage::Me("me-1".to_string())).await;
            while ws.next().await.is_some() {}
        })
        .await;

        let transport = SignalingTransport::connect(&config(url, None)).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = transport.forward_to(tx);
        assert_eq!(
            rx.recv().await.unwrap(),
            Inbound::Message(ServerMessage::Me("me-1".to_string()))
        );
    }

    #[tokio::test]
    async fn local_close_is_not_reported_as_loss() {
        let url = serve(|mut ws| async move { while ws.next().await.is_some() {} }).await;
        let transport = SignalingTransport::connect(&config(url, None)).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = transport.forward_to(tx);
        transport.close();
        assert!(!transport.is_connected());
        assert!(matches!(
            transport.send(ClientMessage::EndCall { id: None }),
            Err(CoreError::NotConnected)
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }
}
