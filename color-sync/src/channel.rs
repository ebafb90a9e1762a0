//! Client side of the hub protocol: a WebSocket connection that reopens
//! itself after a drop while consumers keep reading from one stream.
//!
//! A [`Channel`] moves through [`ChannelStatus`] states driven by a single
//! supervisor task. Consumers call [`Channel::subscribe`] before
//! [`Channel::connect`] to observe the snapshot the hub sends on join.

use std::{fmt, sync::Arc, time::Duration};

use futures::{Stream, stream};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::{
    net::TcpStream,
    select,
    sync::{Notify, broadcast, mpsc, watch},
    time::{Instant, Interval, interval_at, sleep, timeout},
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{self, Message},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::color::ColorState;

pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(5000);

// Messages buffered per subscriber before it starts lagging.
const STREAM_CAPACITY: usize = 64;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel is not connected")]
    NotConnected,
    #[error("channel has been closed")]
    Closed,
    #[error("failed to open transport to {endpoint}")]
    TransportOpen {
        endpoint: String,
        #[source]
        source: tungstenite::Error,
    },
    #[error("transport closed by remote")]
    TransportClosed,
    #[error("transport error")]
    Transport(#[from] tungstenite::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelStatus::Disconnected => "disconnected",
            ChannelStatus::Connecting => "connecting",
            ChannelStatus::Connected => "connected",
            ChannelStatus::Reconnecting => "reconnecting",
            ChannelStatus::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// WebSocket URL of the hub, e.g. `ws://127.0.0.1:8880`.
    pub endpoint: String,
    /// Retry when the first attempt fails to open. Every later attempt
    /// retries regardless.
    pub reconnect: bool,
    pub reconnect_interval: Duration,
    /// Ping period used to notice dead sockets. A ping still unanswered at
    /// the next tick drops the transport. `None` disables pings.
    pub keepalive_interval: Option<Duration>,
}

impl ChannelConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            reconnect: false,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            keepalive_interval: None,
        }
    }

    pub fn with_reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    pub fn with_keepalive(mut self, interval: Duration) -> Self {
        self.keepalive_interval = Some(interval);
        self
    }
}

pub struct Channel {
    shared: Arc<Shared>,
}

struct Shared {
    config: ChannelConfig,
    machine: Mutex<Machine>,
    status: watch::Sender<ChannelStatus>,
    retry_now: Notify,
    cancel: CancellationToken,
}

struct Machine {
    status: ChannelStatus,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    // Dropped on close so every subscription ends once the session exits.
    messages: Option<broadcast::Sender<String>>,
}

impl Channel {
    pub fn new(config: ChannelConfig) -> Self {
        let (messages, _) = broadcast::channel(STREAM_CAPACITY);
        let (status, _) = watch::channel(ChannelStatus::Disconnected);

        Self {
            shared: Arc::new(Shared {
                config,
                machine: Mutex::new(Machine {
                    status: ChannelStatus::Disconnected,
                    outbound: None,
                    messages: Some(messages),
                }),
                status,
                retry_now: Notify::new(),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn status(&self) -> ChannelStatus {
        self.shared.machine.lock().status
    }

    pub fn watch_status(&self) -> watch::Receiver<ChannelStatus> {
        self.shared.status.subscribe()
    }

    /// Starts the connection. Inert while connecting or connected; skips the
    /// remaining delay while reconnecting. Must be called inside a Tokio runtime.
    pub fn connect(&self) -> Result<(), ChannelError> {
        let mut machine = self.shared.machine.lock();
        match machine.status {
            ChannelStatus::Closed => Err(ChannelError::Closed),
            ChannelStatus::Connecting | ChannelStatus::Connected => Ok(()),
            ChannelStatus::Reconnecting => {
                // Wakes only a delay that is already pending; nothing is stored.
                self.shared.retry_now.notify_waiters();
                Ok(())
            }
            ChannelStatus::Disconnected => {
                self.shared.transition(&mut machine, ChannelStatus::Connecting);
                drop(machine);
                tokio::spawn(supervise(Arc::clone(&self.shared)));
                Ok(())
            }
        }
    }

    /// Queues `text` on the live transport.
    ///
    /// Fails with [`ChannelError::NotConnected`] unless the channel is
    /// connected; nothing is buffered for a later connection.
    pub fn send(&self, text: impl Into<String>) -> Result<(), ChannelError> {
        let machine = self.shared.machine.lock();
        match (machine.status, machine.outbound.as_ref()) {
            (ChannelStatus::Connected, Some(outbound)) => outbound
                .send(Message::Text(text.into()))
                .map_err(|_| ChannelError::NotConnected),
            (ChannelStatus::Closed, _) => Err(ChannelError::Closed),
            _ => Err(ChannelError::NotConnected),
        }
    }

    /// Terminal: tears down the transport, cancels any pending reconnect and
    /// ends every subscription.
    pub fn close(&self) {
        let mut machine = self.shared.machine.lock();
        if machine.status == ChannelStatus::Closed {
            return;
        }
        machine.outbound = None;
        machine.messages = None;
        self.shared.transition(&mut machine, ChannelStatus::Closed);
        drop(machine);

        self.shared.cancel.cancel();
        info!(endpoint = %self.shared.config.endpoint, "channel closed");
    }

    /// Subscribes to inbound payloads. The subscription survives reconnects
    /// and ends only after [`Channel::close`].
    pub fn subscribe(&self) -> Subscription {
        let machine = self.shared.machine.lock();
        let receiver = match machine.messages.as_ref() {
            Some(messages) => messages.subscribe(),
            None => broadcast::channel(1).1,
        };
        Subscription { receiver }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}

pub struct Subscription {
    receiver: broadcast::Receiver<String>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<String> {
        loop {
            match self.receiver.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "subscriber lagged behind channel");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Like [`Subscription::recv`], skipping payloads that are not snapshots.
    pub async fn recv_color(&mut self) -> Option<ColorState> {
        loop {
            let message = self.recv().await?;
            match ColorState::decode(&message) {
                Ok(color) => return Some(color),
                Err(err) => debug!(error = %err, "ignoring undecodable payload"),
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = String> {
        stream::unfold(self, |mut subscription| async move {
            let message = subscription.recv().await?;
            Some((message, subscription))
        })
    }
}

impl Shared {
    fn transition(&self, machine: &mut Machine, next: ChannelStatus) {
        debug!(from = %machine.status, to = %next, "channel transition");
        machine.status = next;
        self.status.send_replace(next);
    }

    /// Moves to a non-connected state unless the channel was closed meanwhile.
    fn enter(&self, next: ChannelStatus) -> bool {
        let mut machine = self.machine.lock();
        if machine.status == ChannelStatus::Closed {
            return false;
        }
        machine.outbound = None;
        self.transition(&mut machine, next);
        true
    }

    /// Installs the outbound handle of a freshly opened transport.
    fn attach(
        &self,
        outbound: mpsc::UnboundedSender<Message>,
    ) -> Option<broadcast::Sender<String>> {
        let mut machine = self.machine.lock();
        if machine.status == ChannelStatus::Closed {
            return None;
        }
        let messages = machine.messages.clone()?;
        machine.outbound = Some(outbound);
        self.transition(&mut machine, ChannelStatus::Connected);
        Some(messages)
    }
}

enum SessionEnd {
    Cancelled,
    Dropped(ChannelError),
}

async fn supervise(shared: Arc<Shared>) {
    let endpoint = shared.config.endpoint.clone();
    let mut reconnect = shared.config.reconnect;

    loop {
        if !shared.enter(ChannelStatus::Connecting) {
            break;
        }

        let attempt = select! {
            _ = shared.cancel.cancelled() => break,
            attempt = connect_async(endpoint.as_str()) => attempt,
        };

        match attempt {
            Ok((socket, _)) => match run_session(&shared, socket).await {
                SessionEnd::Cancelled => break,
                SessionEnd::Dropped(err) => {
                    warn!(%endpoint, error = %err, "connection lost");
                }
            },
            Err(source) => {
                let err = ChannelError::TransportOpen {
                    endpoint: endpoint.clone(),
                    source,
                };
                warn!(error = ?err, "failed to connect");
                if !reconnect {
                    shared.enter(ChannelStatus::Disconnected);
                    break;
                }
            }
        }

        reconnect = true;
        // Registered before the status flips so a `connect()` that observes
        // `Reconnecting` always reaches this delay.
        let retry_now = shared.retry_now.notified();
        tokio::pin!(retry_now);
        retry_now.as_mut().enable();
        if !shared.enter(ChannelStatus::Reconnecting) {
            break;
        }
        info!(
            %endpoint,
            delay_ms = shared.config.reconnect_interval.as_millis() as u64,
            "reconnecting"
        );

        select! {
            _ = shared.cancel.cancelled() => break,
            _ = sleep(shared.config.reconnect_interval) => {}
            _ = &mut retry_now => {}
        }
    }

    debug!(%endpoint, "channel supervisor stopped");
}

async fn run_session(shared: &Shared, socket: Socket) -> SessionEnd {
    let (mut writer, mut reader) = socket.split();
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel();

    let Some(messages) = shared.attach(outbound) else {
        let _ = timeout(CLOSE_TIMEOUT, writer.close()).await;
        return SessionEnd::Cancelled;
    };
    info!(endpoint = %shared.config.endpoint, "channel connected");

    let keepalive = shared
        .config
        .keepalive_interval
        .map(|period| interval_at(Instant::now() + period, period));

    // Every read and write runs under this select, so a stalled peer never
    // holds up `close()`.
    let end = select! {
        _ = shared.cancel.cancelled() => SessionEnd::Cancelled,
        end = pump(&mut writer, &mut reader, &mut outbound_rx, &messages, keepalive) => end,
    };
    drop(messages);

    if matches!(end, SessionEnd::Cancelled)
        && timeout(CLOSE_TIMEOUT, writer.send(Message::Close(None)))
            .await
            .is_err()
    {
        debug!(endpoint = %shared.config.endpoint, "peer did not accept close frame in time");
    }
    end
}

async fn pump(
    writer: &mut SplitSink<Socket, Message>,
    reader: &mut SplitStream<Socket>,
    outbound_rx: &mut mpsc::UnboundedReceiver<Message>,
    messages: &broadcast::Sender<String>,
    mut keepalive: Option<Interval>,
) -> SessionEnd {
    let mut awaiting_pong = false;

    loop {
        select! {
            frame = reader.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    // No subscribers is fine; the payload is simply not observed.
                    let _ = messages.send(text);
                }
                Some(Ok(Message::Pong(_))) => awaiting_pong = false,
                Some(Ok(Message::Close(_))) | None => {
                    return SessionEnd::Dropped(ChannelError::TransportClosed);
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => return SessionEnd::Dropped(err.into()),
            },
            Some(message) = outbound_rx.recv() => {
                if let Err(err) = writer.send(message).await {
                    return SessionEnd::Dropped(err.into());
                }
            }
            _ = keepalive_tick(&mut keepalive) => {
                if awaiting_pong {
                    warn!("no pong within keepalive interval");
                    return SessionEnd::Dropped(ChannelError::TransportClosed);
                }
                if let Err(err) = writer.send(Message::Ping(Vec::new())).await {
                    return SessionEnd::Dropped(err.into());
                }
                awaiting_pong = true;
            }
        }
    }
}

async fn keepalive_tick(keepalive: &mut Option<Interval>) {
    match keepalive {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
