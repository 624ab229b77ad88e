//! Long-lived WebSocket connection to a single relay.
//!
//! A [`RelayConnection`] is a cheap, cloneable handle. The socket itself lives
//! in a driver task that writes queued [`ClientMessage`]s and fans decoded
//! [`RelayMessage`]s out to every listener in arrival order.
//!
//! Sends issued while the connection is still `Connecting` are queued and
//! flushed in order once it is `Open`. If the connection never opens they are
//! dropped and listeners receive the transport error instead.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{client_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    error::{Error, Result},
    message::{ClientMessage, RelayMessage},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
    Errored,
}

impl ConnectionState {
    pub fn accepts_sends(self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Open)
    }
}

/// What a listener sees on the frame stream.
///
/// Every listener receives exactly one terminal notification (`Error` or
/// `Closed`) after which its channel ends.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayNotification {
    Frame(RelayMessage),
    Error(Error),
    Closed,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Optional SOCKS5 proxy (host:port) for the TCP hop, e.g. Tor.
    pub tor_socks: Option<String>,
}

enum Command {
    Send(ClientMessage),
    Close,
}

#[derive(Default)]
struct Listeners {
    senders: Vec<mpsc::UnboundedSender<RelayNotification>>,
    terminal: Option<RelayNotification>,
}

struct Shared {
    url: String,
    state: watch::Sender<ConnectionState>,
    listeners: Mutex<Listeners>,
}

impl Shared {
    fn broadcast(&self, notification: RelayNotification) {
        self.listeners
            .lock()
            .senders
            .retain(|tx| tx.send(notification.clone()).is_ok());
    }

    /// Enter a terminal state and notify every listener once.
    fn finish(&self, state: ConnectionState, notification: RelayNotification) {
        let mut listeners = self.listeners.lock();
        if listeners.terminal.is_some() {
            return;
        }
        self.state.send_replace(state);
        for tx in listeners.senders.drain(..) {
            let _ = tx.send(notification.clone());
        }
        listeners.terminal = Some(notification);
    }

    fn fail(&self, err: Error) {
        warn!(relay = %self.url, error = %err, "relay connection failed");
        self.finish(ConnectionState::Errored, RelayNotification::Error(err));
    }

    fn terminal_error(&self) -> Option<Error> {
        match &self.listeners.lock().terminal {
            Some(RelayNotification::Error(e)) => Some(e.clone()),
            _ => None,
        }
    }
}

/// Handle to one relay connection. Clones share the same socket.
///
/// The connection is closed gracefully once every handle is dropped.
#[derive(Clone)]
pub struct RelayConnection {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl RelayConnection {
    /// Start connecting in the background and return immediately.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(url: &str, options: ConnectOptions) -> Result<Self> {
        validate_url(url)?;
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let shared = Arc::new(Shared {
            url: url.to_string(),
            state,
            listeners: Mutex::new(Listeners::default()),
        });
        let (commands, rx) = mpsc::unbounded_channel();
        tokio::spawn(drive(shared.clone(), rx, options));
        Ok(Self { shared, commands })
    }

    /// Connect and wait until the socket is open.
    pub async fn connect(url: &str, options: ConnectOptions) -> Result<Self> {
        let conn = Self::spawn(url, options)?;
        conn.wait_until_open().await?;
        Ok(conn)
    }

    pub fn url(&self) -> &str {
        &self.shared.url
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Resolve once the connection leaves `Connecting`.
    pub async fn wait_until_open(&self) -> Result<()> {
        let mut rx = self.shared.state.subscribe();
        let state = *rx
            .wait_for(|s| *s != ConnectionState::Connecting)
            .await
            .map_err(|_| Error::NotConnected)?;
        match state {
            ConnectionState::Open => Ok(()),
            ConnectionState::Errored => Err(self
                .shared
                .terminal_error()
                .unwrap_or(Error::NotConnected)),
            _ => Err(Error::NotConnected),
        }
    }

    /// Queue a frame for the relay.
    pub fn send(&self, msg: ClientMessage) -> Result<()> {
        if !self.state().accepts_sends() {
            return Err(Error::NotConnected);
        }
        self.commands
            .send(Command::Send(msg))
            .map_err(|_| Error::NotConnected)
    }

    /// Register a listener for every inbound frame from now on.
    ///
    /// Listening on a connection that already ended yields just its terminal
    /// notification.
    pub fn listen(&self) -> mpsc::UnboundedReceiver<RelayNotification> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut listeners = self.shared.listeners.lock();
        match &listeners.terminal {
            Some(terminal) => {
                let _ = tx.send(terminal.clone());
            }
            None => listeners.senders.push(tx),
        }
        rx
    }

    /// Close gracefully. Frames queued before the call are still flushed.
    pub fn close(&self) {
        self.shared.state.send_if_modified(|s| {
            if s.accepts_sends() {
                *s = ConnectionState::Closing;
                true
            } else {
                false
            }
        });
        let _ = self.commands.send(Command::Close);
    }
}

impl std::fmt::Debug for RelayConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConnection")
            .field("url", &self.shared.url)
            .field("state", &self.state())
            .finish()
    }
}

fn validate_url(url: &str) -> Result<Url> {
    let parsed =
        Url::parse(url).map_err(|e| Error::validation(format!("invalid relay url {url:?}: {e}")))?;
    if !matches!(parsed.scheme(), "ws" | "wss") {
        return Err(Error::validation(format!(
            "relay url must use ws:// or wss://, got {url:?}"
        )));
    }
    if parsed.host_str().is_none() {
        return Err(Error::validation(format!("relay url {url:?} has no host")));
    }
    Ok(parsed)
}

async fn drive(
    shared: Arc<Shared>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    options: ConnectOptions,
) {
    let ws = match connect_ws(&shared.url, options.tor_socks.as_deref()).await {
        Ok(ws) => ws,
        Err(e) => {
            shared.fail(e);
            return;
        }
    };
    // close() may already have moved us to Closing; the queued Close handles it.
    shared.state.send_if_modified(|s| {
        if *s == ConnectionState::Connecting {
            *s = ConnectionState::Open;
            true
        } else {
            false
        }
    });
    info!(relay = %shared.url, "relay connection open");

    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(Command::Send(msg)) => {
                    let text = msg.as_json();
                    debug!(relay = %shared.url, frame = %text, "sending");
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        shared.fail(e.into());
                        return;
                    }
                }
                Some(Command::Close) | None => {
                    shared.state.send_replace(ConnectionState::Closing);
                    let _ = sink.close().await;
                    info!(relay = %shared.url, "relay connection closed");
                    shared.finish(ConnectionState::Closed, RelayNotification::Closed);
                    return;
                }
            },
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(txt))) => match RelayMessage::from_json(&txt) {
                    Ok(frame) => shared.broadcast(RelayNotification::Frame(frame)),
                    Err(e) => warn!(relay = %shared.url, error = %e, "dropping inbound frame"),
                },
                Some(Ok(Message::Close(_))) | None => {
                    shared.fail(Error::Transport("relay closed the connection".into()));
                    return;
                }
                Some(Err(e)) => {
                    shared.fail(e.into());
                    return;
                }
                Some(Ok(_)) => {}
            }
        }
    }
}

/// Establish a WebSocket connection, optionally via a SOCKS5 proxy.
async fn connect_ws(
    relay: &str,
    tor_socks: Option<&str>,
) -> Result<WebSocketStream<Box<dyn AsyncReadWrite + Unpin + Send>>> {
    let url = validate_url(relay)?;
    let host = url
        .host_str()
        .ok_or_else(|| Error::validation("missing host"))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| Error::validation("missing port"))?;
    let req = relay.into_client_request()?;
    let stream: Box<dyn AsyncReadWrite + Unpin + Send> = if let Some(proxy) = tor_socks {
        Box::new(
            Socks5Stream::connect(proxy, (host, port))
                .await
                .map_err(|e| Error::Transport(format!("socks proxy {proxy}: {e}")))?,
        )
    } else {
        Box::new(
            TcpStream::connect((host, port))
                .await
                .map_err(|e| Error::Transport(format!("connect {host}:{port}: {e}")))?,
        )
    };
    let (ws, _) = client_async(req, stream).await?;
    Ok(ws)
}

/// Blanket trait for boxed async read/write streams.
trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}
