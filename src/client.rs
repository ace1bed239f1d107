//! The hub client.
//!
//! Owns the persistent websocket channel to the hub and is the sole
//! bridge-to-hub boundary. The client reconnects with jittered exponential
//! backoff, declares the exposed apps after every successful connect, then
//! dispatches inbound packets:
//!
//! ```text
//! hub ──► websocket ──► Packet::decode ──► dispatch_packet ──► sessions
//! sessions ──► SessionConnector ──► OutboundHandle ──► websocket ──► hub
//! ```
//!
//! Sessions never see the websocket; they push upstream through a small
//! per-session [`ClientConnector`] installed at session start.

use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::constants::{self, API_KEY_HEADER, CLOSE_ALL_TIMEOUT, HEARTBEAT_INTERVAL};
use crate::environment::Environment;
use crate::exit_poller::ExitPoller;
use crate::packets::{AppAnnouncement, Packet};
#[cfg(unix)]
use crate::poller::Poller;
use crate::retry::Retry;
use crate::session::manager::SessionManager;
use crate::session::SessionConnector;
use crate::types::{Meta, RouteKey, SessionId};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Shared handle to the outbound side of the channel.
///
/// A sender is attached for the lifetime of each connection; between
/// connections sends fail fast with `false` rather than queueing into the
/// void.
#[derive(Clone, Default)]
pub(crate) struct OutboundHandle {
    sender: Arc<StdMutex<Option<UnboundedSender<Vec<u8>>>>>,
}

impl OutboundHandle {
    fn attach(&self, sender: UnboundedSender<Vec<u8>>) {
        *self.sender.lock().expect("outbound lock poisoned") = Some(sender);
    }

    fn detach(&self) {
        *self.sender.lock().expect("outbound lock poisoned") = None;
    }

    /// Serialize and dispatch a packet. Returns `false` if no channel is
    /// attached or the send fails.
    fn send(&self, packet: &Packet) -> bool {
        let Ok(encoded) = packet.encode() else {
            log::warn!("Failed to encode {packet:?}");
            return false;
        };
        let sender = self.sender.lock().expect("outbound lock poisoned");
        let sent = sender
            .as_ref()
            .is_some_and(|sender| sender.send(encoded).is_ok());
        if sent {
            log::debug!("<SEND> {packet:?}");
        } else {
            log::warn!("Failed to send {packet:?}");
        }
        sent
    }
}

/// Per-session adapter translating session callbacks into outbound packets.
struct ClientConnector {
    outbound: OutboundHandle,
    session_manager: Arc<SessionManager>,
    session_id: SessionId,
    route_key: RouteKey,
}

#[async_trait]
impl SessionConnector for ClientConnector {
    async fn on_data(&self, data: Vec<u8>) {
        self.outbound.send(&Packet::SessionData {
            route_key: self.route_key.0.clone(),
            data,
        });
    }

    async fn on_meta(&self, meta: Meta) {
        let meta_type = meta.get("type").and_then(Value::as_str).unwrap_or_default();
        match meta_type {
            "open_url" => {
                self.outbound.send(&Packet::OpenUrl {
                    route_key: self.route_key.0.clone(),
                    url: get_str(&meta, "url"),
                    new_tab: meta
                        .get("new_tab")
                        .and_then(Value::as_bool)
                        .unwrap_or(true),
                });
            }
            "deliver_file_start" => {
                let path = get_str(&meta, "path");
                // Only the basename crosses the wire.
                let file_name = match Path::new(&path).file_name() {
                    Some(name) => name.to_string_lossy().into_owned(),
                    None => path,
                };
                self.outbound.send(&Packet::DeliverFileStart {
                    route_key: self.route_key.0.clone(),
                    delivery_key: get_str(&meta, "key"),
                    file_name,
                    open_method: get_str(&meta, "open_method"),
                    mime_type: get_str(&meta, "mime_type"),
                    encoding: get_str(&meta, "encoding"),
                });
            }
            unknown => {
                log::warn!(
                    "Unknown meta type {unknown:?}; the app may be newer than this bridge"
                );
            }
        }
    }

    async fn on_binary_encoded_message(&self, payload: Vec<u8>) {
        self.outbound.send(&Packet::BinaryEncodedMessage {
            route_key: self.route_key.0.clone(),
            data: payload,
        });
    }

    async fn on_close(&self) {
        self.outbound.send(&Packet::SessionClose {
            session_id: self.session_id.0.clone(),
            route_key: self.route_key.0.clone(),
        });
        self.session_manager.on_session_end(&self.session_id);
    }
}

fn get_str(meta: &Meta, key: &str) -> String {
    meta.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Manages the connection to a ganglion hub.
pub struct GanglionClient {
    environment: Environment,
    api_key: Option<String>,
    devtools: bool,
    exit_on_idle: Duration,
    #[cfg(unix)]
    poller: Poller,
    session_manager: Arc<SessionManager>,
    outbound: OutboundHandle,
    exit: CancellationToken,
}

impl GanglionClient {
    /// Build a client from an already-validated configuration.
    ///
    /// `config_path` anchors relative app paths: the file's directory is
    /// used, or the path itself when it is a directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the fd poller cannot be created.
    pub fn new(
        config_path: &Path,
        config: Config,
        environment: Environment,
        api_key: Option<String>,
        devtools: bool,
        exit_on_idle: Duration,
    ) -> Result<Self> {
        let absolute = std::path::absolute(config_path)
            .with_context(|| format!("unable to resolve {}", config_path.display()))?;
        let path = if absolute.is_dir() {
            absolute
        } else {
            match absolute.parent() {
                Some(parent) => parent.to_path_buf(),
                None => absolute,
            }
        };

        #[cfg(unix)]
        let poller = Poller::new()?;
        #[cfg(unix)]
        let session_manager = Arc::new(SessionManager::new(
            poller.clone(),
            path,
            config.apps.clone(),
        ));
        #[cfg(not(unix))]
        let session_manager = Arc::new(SessionManager::new(path, config.apps.clone()));

        Ok(Self {
            environment,
            api_key: config.account.api_key.clone().or(api_key),
            devtools,
            exit_on_idle,
            #[cfg(unix)]
            poller,
            session_manager,
            outbound: OutboundHandle::default(),
            exit: CancellationToken::new(),
        })
    }

    /// The session manager, exposed for introspection.
    #[must_use]
    pub fn session_manager(&self) -> &Arc<SessionManager> {
        &self.session_manager
    }

    /// The number of configured apps.
    #[must_use]
    pub fn app_count(&self) -> usize {
        self.session_manager.app_count()
    }

    /// Add a new app.
    pub fn add_app(&self, name: &str, command: &str, slug: &str) {
        self.session_manager.add_app(name, command, slug, false);
    }

    /// Add a new terminal.
    pub fn add_terminal(&self, name: &str, command: &str, slug: &str) {
        if cfg!(unix) {
            self.session_manager.add_app(name, command, slug, true);
        } else {
            log::warn!("terminals are not supported on this platform");
        }
    }

    /// Force the bridge to exit: cancels the connect loop and everything
    /// under it.
    pub fn force_exit(&self) {
        self.exit.cancel();
    }

    /// Token cancelled when the bridge is exiting.
    #[must_use]
    pub fn exit_token(&self) -> CancellationToken {
        self.exit.clone()
    }

    /// Run the connection loop until exit is requested.
    ///
    /// # Errors
    ///
    /// Currently infallible at this level; failures reduce to reconnection.
    pub async fn run(&self) -> Result<()> {
        #[cfg(unix)]
        self.poller.start();
        let exit_poller = ExitPoller::new(
            Arc::clone(&self.session_manager),
            self.exit.clone(),
            self.exit_on_idle,
        );
        exit_poller.start();

        self.connect().await;

        exit_poller.stop();
        #[cfg(unix)]
        {
            // The poller join can block for up to its poll timeout; keep it
            // off the async runtime.
            let poller = self.poller.clone();
            let _ = tokio::task::spawn_blocking(move || poller.exit()).await;
        }
        Ok(())
    }

    /// The connect-retry loop.
    async fn connect(&self) {
        let mut retry = Retry::new(self.exit.clone());
        while let Some(retry_count) = retry.next().await {
            if self.exit.is_cancelled() {
                break;
            }
            if retry_count == 1 {
                log::info!("connecting to {} ({})", self.environment.url, self.environment.name);
            }
            match self.open_websocket().await {
                Ok(websocket) => {
                    retry.success();
                    let (sink, stream) = websocket.split();
                    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
                    self.outbound.attach(outbound_tx);
                    self.post_connect();
                    self.run_websocket(sink, stream, outbound_rx).await;
                    self.outbound.detach();
                    log::info!("Disconnected from Ganglion");
                    if self.exit.is_cancelled() {
                        break;
                    }
                }
                Err(WsError::Http(response)) => {
                    // The hub refused the handshake outright: almost always
                    // an authentication problem.
                    if retry_count == 1 {
                        log::warn!(
                            "Received forbidden response ({}), check your API Key",
                            response.status()
                        );
                    }
                }
                Err(error) => {
                    if retry_count == 1 {
                        log::warn!(
                            "Unable to connect to Ganglion server. Will reattempt connection soon."
                        );
                    }
                    if constants::debug() {
                        log::error!("Unable to connect; {error}");
                    }
                }
            }
        }
    }

    /// Open the websocket, presenting the API key header if configured.
    async fn open_websocket(&self) -> Result<Socket, WsError> {
        let mut request = self.environment.url.into_client_request()?;
        if let Some(api_key) = &self.api_key {
            match HeaderValue::from_str(api_key) {
                Ok(value) => {
                    request.headers_mut().insert(API_KEY_HEADER, value);
                }
                Err(_) => log::warn!("API key is not a valid header value; not sent"),
            }
        }
        let (websocket, _response) = connect_async(request).await?;
        Ok(websocket)
    }

    /// Called immediately after connecting: declare our apps.
    ///
    /// Sent on every reconnect, since the hub forgets us in between.
    fn post_connect(&self) {
        self.outbound.send(&self.declaration());
    }

    /// Build the app declaration, filtering terminals out on platforms
    /// without PTY support.
    fn declaration(&self) -> Packet {
        let mut apps: Vec<AppAnnouncement> = self
            .session_manager
            .apps()
            .iter()
            .map(AppAnnouncement::from_app)
            .collect();
        if !cfg!(unix) {
            let total = apps.len();
            apps.retain(|app| !app.terminal);
            if apps.len() != total {
                log::warn!("terminals are not supported on this platform");
            }
        }
        Packet::DeclareApps { apps }
    }

    /// The receive loop for one connection.
    ///
    /// Ends when the channel closes or errors (the caller reconnects), or
    /// on exit, which first closes all sessions within a bounded window and
    /// then closes the channel with a reason.
    async fn run_websocket(
        &self,
        mut sink: SplitSink<Socket, Message>,
        mut stream: SplitStream<Socket>,
        mut outbound_rx: UnboundedReceiver<Vec<u8>>,
    ) {
        let mut heartbeat = tokio::time::interval_at(
            tokio::time::Instant::now() + HEARTBEAT_INTERVAL,
            HEARTBEAT_INTERVAL,
        );

        loop {
            tokio::select! {
                () = self.exit.cancelled() => {
                    self.session_manager.close_all(CLOSE_ALL_TIMEOUT).await;
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: CloseCode::Normal,
                            reason: "Close requested".into(),
                        })))
                        .await;
                    break;
                }

                outbound = outbound_rx.recv() => {
                    let Some(encoded) = outbound else { break };
                    if let Err(error) = sink.send(Message::Binary(encoded)).await {
                        log::warn!("websocket send failed: {error}");
                        break;
                    }
                }

                message = stream.next() => {
                    match message {
                        Some(Ok(Message::Binary(payload))) => {
                            self.handle_binary(&payload).await;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = sink.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) => {
                            log::info!("websocket closed by server");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(error)) => {
                            log::error!("websocket error: {error}");
                            break;
                        }
                        None => break,
                    }
                }

                _ = heartbeat.tick() => {
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    /// Decode one binary channel message and dispatch it.
    ///
    /// Decode failures drop the packet and keep the connection; unknown
    /// packet types are a no-op.
    async fn handle_binary(&self, payload: &[u8]) {
        match Packet::decode(payload) {
            Ok(Some(packet)) => {
                log::debug!("<RECV> {packet:?}");
                self.dispatch_packet(packet).await;
            }
            Ok(None) => {}
            Err(error) => log::error!("Unable to decode packet: {error}"),
        }
    }

    /// Send a packet to the hub. Returns `false` if there is no channel or
    /// the send fails.
    pub fn send(&self, packet: &Packet) -> bool {
        self.outbound.send(packet)
    }

    /// Route an inbound packet to its handler.
    async fn dispatch_packet(&self, packet: Packet) {
        match packet {
            Packet::Ping { data } => self.on_ping(data),
            Packet::Log { message } => log::debug!("<ganglion> {message}"),
            Packet::Info { message } => log::info!("<ganglion> {message}"),
            Packet::SessionOpen {
                session_id,
                application_slug,
                route_key,
                width,
                height,
                ..
            } => {
                self.on_session_open(session_id, application_slug, route_key, width, height)
                    .await;
            }
            Packet::SessionClose { session_id, .. } => {
                self.session_manager
                    .close_session(&SessionId(session_id))
                    .await;
            }
            Packet::SessionData { route_key, data } => {
                self.on_session_data(route_key, data).await;
            }
            Packet::RoutePing { route_key, data } => {
                self.send(&Packet::RoutePong { route_key, data });
            }
            Packet::NotifyTerminalSize {
                session_id,
                width,
                height,
            } => {
                if let Some(session) = self.session_manager.get_session(&SessionId(session_id)) {
                    session
                        .set_terminal_size(
                            u16::try_from(width).unwrap_or(80),
                            u16::try_from(height).unwrap_or(24),
                        )
                        .await;
                }
            }
            Packet::Focus { route_key } => self.send_meta_by_route(&route_key, "focus").await,
            Packet::Blur { route_key } => self.send_meta_by_route(&route_key, "blur").await,
            Packet::RequestDeliverChunk {
                route_key,
                delivery_key,
                chunk_size,
            } => {
                self.on_request_deliver_chunk(route_key, delivery_key, chunk_size)
                    .await;
            }
            // Client-originated types have no inbound meaning.
            other => log::debug!("unhandled packet {other:?}"),
        }
    }

    /// Answer an application-level ping inline.
    fn on_ping(&self, data: Vec<u8>) {
        self.send(&Packet::Pong { data });
    }

    async fn on_session_open(
        &self,
        session_id: String,
        application_slug: String,
        route_key: String,
        width: i64,
        height: i64,
    ) {
        let session_id = SessionId(session_id);
        let route_key = RouteKey(route_key);
        let session = self
            .session_manager
            .new_session(
                &application_slug,
                session_id.clone(),
                route_key.clone(),
                self.devtools,
                (
                    u16::try_from(width).unwrap_or(80),
                    u16::try_from(height).unwrap_or(24),
                ),
            )
            .await;
        let Some(session) = session else {
            log::debug!("Failed to create session for {application_slug:?}");
            return;
        };

        let connector = Arc::new(ClientConnector {
            outbound: self.outbound.clone(),
            session_manager: Arc::clone(&self.session_manager),
            session_id,
            route_key,
        });
        session.start(connector).await;
    }

    /// Data packets route by key; a key with no running session drops the
    /// packet silently.
    async fn on_session_data(&self, route_key: String, data: Vec<u8>) {
        if let Some(session) = self
            .session_manager
            .get_session_by_route_key(&RouteKey(route_key))
        {
            session.send_bytes(data).await;
        }
    }

    async fn send_meta_by_route(&self, route_key: &str, meta_type: &str) {
        if let Some(session) = self
            .session_manager
            .get_session_by_route_key(&RouteKey::from(route_key))
        {
            let mut meta = Meta::new();
            meta.insert("type".to_string(), meta_type.into());
            session.send_meta(meta).await;
        }
    }

    /// The hub wants a chunk of a file; forward the request to the app as
    /// meta.
    async fn on_request_deliver_chunk(
        &self,
        route_key: String,
        delivery_key: String,
        chunk_size: i64,
    ) {
        if let Some(session) = self
            .session_manager
            .get_session_by_route_key(&RouteKey(route_key))
        {
            let mut meta = Meta::new();
            meta.insert("type".to_string(), "deliver_chunk_request".into());
            meta.insert("key".to_string(), delivery_key.into());
            meta.insert("size".to_string(), chunk_size.into());
            session.send_meta(meta).await;
        }
    }
}

impl std::fmt::Debug for GanglionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GanglionClient")
            .field("environment", &self.environment.name)
            .field("apps", &self.app_count())
            .field("devtools", &self.devtools)
            .finish_non_exhaustive()
    }
}
