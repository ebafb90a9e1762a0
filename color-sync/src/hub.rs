use std::{
    collections::HashMap,
    fmt,
    future::Future,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    select,
    sync::{Mutex, mpsc},
    time::timeout,
};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::color::{ColorState, ColorUpdate, DEFAULT_BRIGHTNESS};

pub type ConnectionId = u64;

// Updates queued for a single connection before it is considered stalled and evicted.
const OUTBOX_CAPACITY: usize = 32;
const SEND_TIMEOUT: Duration = Duration::from_secs(5);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Send handle for one connection; the hub only ever `try_send`s into it.
pub type Outbox = mpsc::Sender<String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Secure,
    Plain,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Secure => f.write_str("secure"),
            Endpoint::Plain => f.write_str("plain"),
        }
    }
}

/// A party attached to one of the hub's endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connection {
    pub endpoint: Endpoint,
    pub id: ConnectionId,
}

#[derive(Debug, Clone, Copy)]
pub struct HubConfig {
    pub initial: ColorUpdate,
    pub brightness: f64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            initial: ColorUpdate::new(255, 255, 255),
            brightness: DEFAULT_BRIGHTNESS,
        }
    }
}

pub struct EndpointListener {
    endpoint: Endpoint,
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
}

impl EndpointListener {
    pub fn new(endpoint: Endpoint, listener: TcpListener) -> Self {
        Self {
            endpoint,
            listener,
            tls: None,
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

pub struct Hub {
    secure: EndpointListener,
    plain: EndpointListener,
    state: Arc<HubState>,
}

impl Hub {
    pub fn new(secure: EndpointListener, plain: EndpointListener, config: HubConfig) -> Self {
        Self {
            secure,
            plain,
            state: Arc::new(HubState::new(config)),
        }
    }

    pub fn secure_addr(&self) -> std::io::Result<SocketAddr> {
        self.secure.local_addr()
    }

    pub fn plain_addr(&self) -> std::io::Result<SocketAddr> {
        self.plain.local_addr()
    }

    /// Shared registry, usable for inspection while the hub runs.
    pub fn state(&self) -> Arc<HubState> {
        Arc::clone(&self.state)
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Hub {
            secure,
            plain,
            state,
        } = self;
        let stop = CancellationToken::new();
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    handle_shutdown(&state, &stop).await;
                    break;
                }
                accept_result = secure.listener.accept() => {
                    handle_accept_result(accept_result, &secure, &state, &stop);
                }
                accept_result = plain.listener.accept() => {
                    handle_accept_result(accept_result, &plain, &state, &stop);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn handle_shutdown(state: &HubState, stop: &CancellationToken) {
    info!("hub shutting down");
    stop.cancel();
    state.close_all().await;
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    listener: &EndpointListener,
    state: &Arc<HubState>,
    stop: &CancellationToken,
) {
    match result {
        Ok((stream, peer)) => spawn_connection_handler(stream, peer, listener, state, stop),
        Err(err) => warn!(endpoint = %listener.endpoint, error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection_handler(
    stream: TcpStream,
    peer: SocketAddr,
    listener: &EndpointListener,
    state: &Arc<HubState>,
    stop: &CancellationToken,
) {
    let endpoint = listener.endpoint;
    let tls = listener.tls.clone();
    let state = Arc::clone(state);
    let stop = stop.clone();

    tokio::spawn(async move {
        if let Err(err) = serve_connection(stream, tls, endpoint, peer, state, stop).await {
            warn!(%endpoint, peer = %peer, error = ?err, "connection closed with error");
        }
    });
}

async fn serve_connection<S>(
    stream: S,
    tls: Option<TlsAcceptor>,
    endpoint: Endpoint,
    peer: SocketAddr,
    state: Arc<HubState>,
    stop: CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match tls {
        Some(acceptor) => {
            let stream = timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream))
                .await
                .context("tls handshake timed out")?
                .context("tls handshake failed")?;
            handle_connection(stream, endpoint, peer, state, stop).await
        }
        None => handle_connection(stream, endpoint, peer, state, stop).await,
    }
}

async fn handle_connection<S>(
    stream: S,
    endpoint: Endpoint,
    peer: SocketAddr,
    state: Arc<HubState>,
    stop: CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let websocket = timeout(HANDSHAKE_TIMEOUT, accept_async(stream))
        .await
        .context("websocket handshake timed out")?
        .context("websocket handshake failed")?;
    let (outbox, inbox) = mpsc::channel(OUTBOX_CAPACITY);

    let connection = state.on_connect(endpoint, outbox).await;
    info!(%endpoint, peer = %peer, id = connection.id, "client connected");

    let result = run_connection_session(websocket, inbox, connection, &state, &stop).await;

    state.on_disconnect(connection).await;
    info!(%endpoint, peer = %peer, id = connection.id, "client disconnected");

    result
}

async fn run_connection_session<S>(
    websocket: tokio_tungstenite::WebSocketStream<S>,
    mut inbox: mpsc::Receiver<String>,
    connection: Connection,
    state: &HubState,
    stop: &CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut writer, mut reader) = websocket.split();

    loop {
        select! {
            _ = stop.cancelled() => {
                send_close(&mut writer).await;
                break;
            }
            frame = reader.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    state.on_message(connection, &text).await;
                }
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => {
                        state.on_message(connection, &text).await;
                    }
                    Err(_) => debug!(id = connection.id, "ignoring non-utf8 frame"),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => return Err(err).context("failed to read from client"),
            },
            outgoing = inbox.recv() => match outgoing {
                Some(text) => deliver(&mut writer, text).await?,
                None => {
                    debug!(id = connection.id, "connection evicted from registry");
                    send_close(&mut writer).await;
                    break;
                }
            },
        }
    }

    Ok(())
}

async fn deliver<W>(writer: &mut W, text: String) -> Result<()>
where
    W: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    timeout(SEND_TIMEOUT, writer.send(Message::Text(text)))
        .await
        .context("timed out delivering update")?
        .context("failed to deliver update")
}

// Best effort; a peer that stopped reading does not hold the task open.
async fn send_close<W>(writer: &mut W)
where
    W: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    if timeout(SEND_TIMEOUT, writer.send(Message::Close(None))).await.is_err() {
        debug!("peer did not accept close frame in time");
    }
}

/// Owner of the single authoritative color and of both endpoint registries.
pub struct HubState {
    registry: Mutex<Registry>,
    brightness: f64,
    next_id: AtomicU64,
}

struct Registry {
    color: ColorState,
    secure: HashMap<ConnectionId, Outbox>,
    plain: HashMap<ConnectionId, Outbox>,
}

impl Registry {
    fn connections_mut(&mut self, endpoint: Endpoint) -> &mut HashMap<ConnectionId, Outbox> {
        match endpoint {
            Endpoint::Secure => &mut self.secure,
            Endpoint::Plain => &mut self.plain,
        }
    }

    /// Queues `message` on every connection of both endpoints. Stalled or
    /// closed outboxes are evicted; evicted clients resync on reconnect.
    fn fan_out(&mut self, message: &str) -> usize {
        let mut delivered = 0;
        for endpoint in [Endpoint::Secure, Endpoint::Plain] {
            self.connections_mut(endpoint).retain(|id, outbox| {
                match outbox.try_send(message.to_string()) {
                    Ok(()) => {
                        delivered += 1;
                        true
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(%endpoint, id, "client is not keeping up; evicting");
                        false
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                }
            });
        }
        delivered
    }
}

impl HubState {
    pub fn new(config: HubConfig) -> Self {
        Self {
            registry: Mutex::new(Registry {
                color: ColorState::from_update(config.initial, config.brightness),
                secure: HashMap::new(),
                plain: HashMap::new(),
            }),
            brightness: config.brightness,
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers the outbox and queues the current snapshot on it.
    ///
    /// Both happen under one lock, so the snapshot is always ordered before
    /// any broadcast the new connection observes.
    pub async fn on_connect(&self, endpoint: Endpoint, outbox: Outbox) -> Connection {
        let connection = Connection {
            endpoint,
            id: self.next_id(),
        };
        let mut registry = self.registry.lock().await;

        if let Err(err) = outbox.try_send(registry.color.encode()) {
            debug!(%endpoint, id = connection.id, error = ?err, "failed to queue snapshot");
        }
        registry.connections_mut(endpoint).insert(connection.id, outbox);

        connection
    }

    /// Validates `raw`, replaces the shared color and fans the normalized
    /// snapshot out to both endpoints. Malformed input is dropped and `None`
    /// is returned.
    pub async fn on_message(&self, connection: Connection, raw: &str) -> Option<ColorState> {
        let update = match ColorUpdate::parse(raw) {
            Ok(update) => update,
            Err(err) => {
                debug!(endpoint = %connection.endpoint, id = connection.id, error = %err, "discarding update");
                return None;
            }
        };

        let color = ColorState::from_update(update, self.brightness);
        let mut registry = self.registry.lock().await;
        registry.color = color;
        let delivered = registry.fan_out(&color.encode());
        drop(registry);

        debug!(
            endpoint = %connection.endpoint,
            id = connection.id,
            %color,
            delivered,
            "broadcast color update"
        );
        Some(color)
    }

    pub async fn on_disconnect(&self, connection: Connection) {
        let mut registry = self.registry.lock().await;
        registry
            .connections_mut(connection.endpoint)
            .remove(&connection.id);
    }

    pub async fn snapshot(&self) -> ColorState {
        self.registry.lock().await.color
    }

    pub async fn connection_count(&self) -> usize {
        let registry = self.registry.lock().await;
        registry.secure.len() + registry.plain.len()
    }

    async fn close_all(&self) {
        let mut registry = self.registry.lock().await;
        registry.secure.clear();
        registry.plain.clear();
    }
}
