//! WebSocket relay for Connect remote control.
//!
//! A [`RemoteConnection`] wraps one WebSocket to the relay ("dealer"). It
//! publishes what the relay pushes as [`RemoteEvent`]s on a broadcast
//! channel:
//!
//! * the connection id the relay assigns, needed to announce this device
//! * cluster updates with the shared playback state
//! * remote commands, which the caller acknowledges with
//!   [`reply`](RemoteConnection::reply)
//!
//! The connection pings the relay every ping interval and gives up when
//! nothing at all arrived for three intervals. It never reconnects on its
//! own: a broken socket ends in [`RemoteEvent::Disconnected`] and the caller
//! decides what to do, usually through
//! [`RemoteConnectionProvider`](provider::RemoteConnectionProvider).
//!
//! # Relay frames
//!
//! ```text
//! {"type": "ping"} / {"type": "pong"}
//! {"type": "message", "uri": "...", "headers": {...}, "payloads": ["<base64>"]}
//! {"type": "request", "key": "...", "message_ident": "...",
//!  "payload": {"compressed": "<base64 gzip JSON command>"}}
//! {"type": "reply", "key": "...", "payload": {"success": true}}
//! ```

pub mod provider;

use std::{
    collections::HashMap,
    io::Read,
    ops::ControlFlow,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use base64::prelude::*;
use bytes::Bytes;
use flate2::read::GzDecoder;
use futures_util::{SinkExt, StreamExt};
use protobuf::Message as _;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{broadcast, mpsc, watch},
    time::Instant,
};
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    error::{Error, Result},
    protocol::{self, protos::connect::ClusterUpdate},
    uuid::Uuid,
};

/// Silent ping intervals after which the relay is presumed gone.
pub const MAX_MISSED_PINGS: u32 = 3;

/// Capacity of the event channel. Slow subscribers lag rather than block
/// the connection.
const EVENT_CAPACITY: usize = 64;

const PUSHER_URI: &str = "hm://pusher/v1/connections/";
const CLUSTER_URI: &str = "hm://connect-state/v1/cluster";
const CONNECTION_ID_HEADER: &str = "Spotify-Connection-Id";

#[derive(Clone, Debug)]
pub enum RemoteEvent {
    /// The relay assigned this connection an id.
    ConnectionId(String),

    /// The shared playback state changed, or was re-sent.
    Cluster(Arc<ClusterUpdate>),

    /// Another device asks this one to do something.
    Command(RemoteCommand),

    /// The socket is gone. No further events follow.
    Disconnected,
}

/// Command sent by another device through the relay.
#[derive(Clone, Debug, PartialEq)]
pub struct RemoteCommand {
    /// Pass to [`RemoteConnection::reply`].
    pub key: String,
    pub message_ident: String,
    pub message_id: u32,
    pub sent_by_device_id: String,
    pub endpoint: String,

    /// Decoded `data` of the command, if any.
    pub data: Option<Bytes>,

    /// The whole command object.
    pub command: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Inbound {
    Ping,
    Pong,
    Message {
        uri: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        payloads: Vec<serde_json::Value>,
    },
    Request {
        key: String,
        #[serde(default)]
        message_ident: String,
        payload: RequestPayload,
    },
}

#[derive(Debug, Deserialize)]
struct RequestPayload {
    compressed: String,
}

#[derive(Debug, Deserialize)]
struct CommandEnvelope {
    message_id: u32,
    sent_by_device_id: String,
    command: serde_json::Value,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Outbound<'a> {
    Ping,
    Reply { key: &'a str, payload: ReplyPayload },
}

#[derive(Serialize)]
struct ReplyPayload {
    success: bool,
}

fn header<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoded = Vec::new();
    GzDecoder::new(data).read_to_end(&mut decoded)?;
    Ok(decoded)
}

/// Joins the payloads of a relay message, decoding base64 strings and
/// undoing gzip when the headers say so.
fn message_body(
    headers: &HashMap<String, String>,
    payloads: &[serde_json::Value],
) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    for payload in payloads {
        match payload {
            serde_json::Value::String(encoded) => {
                body.extend_from_slice(&BASE64_STANDARD.decode(encoded)?);
            }
            other => body.extend_from_slice(&serde_json::to_vec(other)?),
        }
    }

    if header(headers, "Transfer-Encoding").is_some_and(|encoding| encoding == "gzip") {
        gunzip(&body)
    } else {
        Ok(body)
    }
}

struct Shared {
    id: Uuid,
    events: broadcast::Sender<RemoteEvent>,
    connection_id: watch::Sender<Option<String>>,
    alive: AtomicBool,
}

impl Shared {
    fn emit(&self, event: RemoteEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn handle(&self, message: Message) -> ControlFlow<()> {
        match message {
            Message::Text(text) => {
                if let Err(e) = self.handle_text(text.as_str()) {
                    warn!("remote {}: dropping frame: {e}", self.id);
                }
            }
            Message::Close(frame) => {
                info!("remote {}: closed by relay: {frame:?}", self.id);
                return ControlFlow::Break(());
            }
            Message::Ping(_) | Message::Pong(_) => {
                trace!("remote {}: control frame", self.id);
            }
            Message::Binary(data) => {
                trace!("remote {}: ignoring {} binary bytes", self.id, data.len());
            }
            Message::Frame(_) => {}
        }

        ControlFlow::Continue(())
    }

    fn handle_text(&self, text: &str) -> Result<()> {
        match protocol::json::<Inbound>(text, "relay")? {
            Inbound::Ping => trace!("remote {}: relay ping", self.id),
            Inbound::Pong => trace!("remote {}: pong", self.id),
            Inbound::Message {
                uri,
                headers,
                payloads,
            } => self.handle_message(&uri, &headers, &payloads)?,
            Inbound::Request {
                key,
                message_ident,
                payload,
            } => {
                let command = gunzip(&BASE64_STANDARD.decode(payload.compressed)?)?;
                let command = std::str::from_utf8(&command)
                    .map_err(|e| Error::data_loss(format!("command is not utf-8: {e}")))?;
                let envelope: CommandEnvelope = protocol::json(command, "relay request")?;

                let endpoint = envelope
                    .command
                    .get("endpoint")
                    .and_then(serde_json::Value::as_str)
                    .ok_or_else(|| Error::data_loss("command without endpoint"))?
                    .to_owned();
                let data = match envelope.command.get("data").and_then(serde_json::Value::as_str) {
                    Some(data) => Some(Bytes::from(BASE64_STANDARD.decode(data)?)),
                    None => None,
                };

                debug!(
                    "remote {}: command {endpoint} from {}",
                    self.id, envelope.sent_by_device_id
                );
                self.emit(RemoteEvent::Command(RemoteCommand {
                    key,
                    message_ident,
                    message_id: envelope.message_id,
                    sent_by_device_id: envelope.sent_by_device_id,
                    endpoint,
                    data,
                    command: envelope.command,
                }));
            }
        }

        Ok(())
    }

    fn handle_message(
        &self,
        uri: &str,
        headers: &HashMap<String, String>,
        payloads: &[serde_json::Value],
    ) -> Result<()> {
        if let Some(suffix) = uri.strip_prefix(PUSHER_URI) {
            let connection_id = header(headers, CONNECTION_ID_HEADER).map_or_else(
                || {
                    url::form_urlencoded::parse(suffix.as_bytes())
                        .map(|(key, _)| key.into_owned())
                        .collect::<String>()
                },
                ToOwned::to_owned,
            );
            if connection_id.is_empty() {
                return Err(Error::data_loss("pusher message without connection id"));
            }

            debug!("remote {}: relay connection id received", self.id);
            self.connection_id.send_replace(Some(connection_id.clone()));
            self.emit(RemoteEvent::ConnectionId(connection_id));
        } else if uri.starts_with(CLUSTER_URI) {
            let body = message_body(headers, payloads)?;
            let update = ClusterUpdate::parse_from_bytes(&body)?;
            trace!("remote {}: cluster update of {} bytes", self.id, body.len());
            self.emit(RemoteEvent::Cluster(Arc::new(update)));
        } else {
            debug!("remote {}: ignoring message for {uri}", self.id);
        }

        Ok(())
    }
}

/// One WebSocket connection to the relay.
pub struct RemoteConnection {
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<Message>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for RemoteConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConnection")
            .field("id", &self.shared.id)
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}

impl RemoteConnection {
    /// Opens a WebSocket to `url`. The URL carries the bearer token, so it
    /// is never logged.
    pub async fn connect(url: &Url, ping_interval: Duration, timeout: Duration) -> Result<Self> {
        let host = url.host_str().unwrap_or_default().to_owned();
        debug!("connecting to relay {host}");
        let (ws, _) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url.as_str()))
            .await
            .map_err(|_| Error::deadline_exceeded(format!("timed out connecting to {host}")))??;
        Ok(Self::start(ws, ping_interval))
    }

    /// Takes over an open WebSocket and spawns its task.
    pub fn start<S>(ws: WebSocketStream<S>, ping_interval: Duration) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            id: Uuid::fast_v4(),
            events,
            connection_id: watch::Sender::new(None),
            alive: AtomicBool::new(true),
        });
        let (outbound, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        info!("remote {} connected", shared.id);
        tokio::spawn(run(
            ws,
            rx,
            Arc::clone(&shared),
            ping_interval,
            shutdown.clone(),
        ));

        Self {
            shared,
            outbound,
            shutdown,
        }
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Connection id assigned by the relay, once it arrived.
    #[must_use]
    pub fn connection_id(&self) -> Option<String> {
        self.shared.connection_id.borrow().clone()
    }

    /// Waits until the relay assigned a connection id.
    pub async fn wait_for_connection_id(&self) -> Result<String> {
        let mut rx = self.shared.connection_id.subscribe();
        tokio::select! {
            id = rx.wait_for(Option::is_some) => id
                .ok()
                .and_then(|id| id.clone())
                .ok_or_else(|| Error::transport("relay connection closed")),
            () = self.shutdown.cancelled() => {
                Err(Error::transport("relay connection closed before assigning an id"))
            }
        }
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::Acquire)
    }

    /// Receives events from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RemoteEvent> {
        self.shared.events.subscribe()
    }

    /// Acknowledges a [`RemoteCommand`].
    pub fn reply(&self, key: &str, success: bool) -> Result<()> {
        let reply = serde_json::to_string(&Outbound::Reply {
            key,
            payload: ReplyPayload { success },
        })?;
        trace!("remote {}: reply {success} to {key}", self.shared.id);
        self.outbound
            .send(Message::text(reply))
            .map_err(|_| Error::transport("relay connection closed"))
    }

    /// Closes the socket. Subscribers see [`RemoteEvent::Disconnected`].
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Resolves once the connection is dead.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await;
    }
}

impl Drop for RemoteConnection {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run<S>(
    ws: WebSocketStream<S>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    shared: Arc<Shared>,
    ping_interval: Duration,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let id = shared.id;
    let (mut sink, mut stream) = ws.split();
    let silence = ping_interval * MAX_MISSED_PINGS;
    let mut ping = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                debug!("remote {id}: closing");
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            _ = ping.tick() => {
                if last_seen.elapsed() >= silence {
                    warn!("remote {id}: relay silent for {silence:?}, giving up");
                    break;
                }
                let Ok(text) = serde_json::to_string(&Outbound::Ping) else { break };
                trace!("remote {id}: ping");
                if let Err(e) = sink.send(Message::text(text)).await {
                    error!("remote {id}: failed sending ping: {e}");
                    break;
                }
            }
            Some(message) = outbound.recv() => {
                if let Err(e) = sink.send(message).await {
                    error!("remote {id}: failed sending: {e}");
                    break;
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(message)) => {
                    last_seen = Instant::now();
                    if shared.handle(message).is_break() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    error!("remote {id}: {e}");
                    break;
                }
                None => {
                    info!("remote {id}: relay went away");
                    break;
                }
            },
        }
    }

    shared.alive.store(false, Ordering::Release);
    shutdown.cancel();
    shared.emit(RemoteEvent::Disconnected);
}
