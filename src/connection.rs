//! Live access point connections and their reuse.
//!
//! A [`Connection`] is an authenticated [`Transport`] put to work: a writer
//! task drains outbound packets into the socket and a single receive loop
//! reads every inbound packet, answers pings, records the country code and
//! feeds Mercury packets to the connection's [`Mercury`] multiplexer. When
//! either task fails the connection is dead for good: pending requests fail
//! and [`Connection::is_alive`] turns false.
//!
//! [`ConnectionProvider`] hands out the live connection for the configured
//! credentials and replaces it when it died or the username changed. At most
//! one handshake runs at a time; concurrent callers wait for its outcome.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc, RwLock,
    },
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, Mutex},
};
use tokio_util::sync::CancellationToken;

use crate::{
    apresolve::Discovery,
    config::Config,
    credentials::{AuthType, Credentials},
    error::{Error, Result},
    mercury::Mercury,
    packet::PacketType,
    transport::{PacketSink, PacketStream, SessionWelcome, Transport},
    uuid::Uuid,
};

/// Consecutive unknown packets tolerated before the connection is dropped.
pub const MAX_UNKNOWN_PACKETS: usize = 16;

#[derive(Debug, Default)]
struct Status {
    alive: AtomicBool,
    country: RwLock<Option<String>>,
    server_time_delta: AtomicI64,
}

/// An authenticated access point connection.
pub struct Connection {
    id: Uuid,
    welcome: SessionWelcome,
    mercury: Mercury,
    status: Arc<Status>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("username", &self.welcome.canonical_username)
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Starts the connection tasks on an authenticated transport.
    pub fn start<T>(transport: Transport<T>, welcome: SessionWelcome, config: &Config) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let mercury = Mercury::new(tx.clone(), config.request_timeout);
        let status = Arc::new(Status {
            alive: AtomicBool::new(true),
            ..Status::default()
        });
        let shutdown = CancellationToken::new();
        let id = Uuid::fast_v4();

        let (sink, stream) = transport.split();
        tokio::spawn(write_loop(sink, rx, shutdown.clone()));
        tokio::spawn(receive_loop(
            id,
            stream,
            tx,
            mercury.clone(),
            Arc::clone(&status),
            shutdown.clone(),
        ));

        debug!("connection {id} started");
        Self {
            id,
            welcome,
            mercury,
            status,
            shutdown,
        }
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn welcome(&self) -> &SessionWelcome {
        &self.welcome
    }

    #[must_use]
    pub fn username(&self) -> &str {
        &self.welcome.canonical_username
    }

    #[must_use]
    pub fn mercury(&self) -> &Mercury {
        &self.mercury
    }

    /// Country code sent by the access point, once received.
    #[must_use]
    pub fn country(&self) -> Option<String> {
        self.status.country.read().ok().and_then(|c| c.clone())
    }

    /// Server clock minus local clock in seconds, from the last ping.
    #[must_use]
    pub fn server_time_delta(&self) -> i64 {
        self.status.server_time_delta.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.status.alive.load(Ordering::Acquire) && !self.shutdown.is_cancelled()
    }

    /// Stops both tasks and fails pending requests.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            debug!("connection {} shutting down", self.id);
            self.shutdown.cancel();
        }
    }

    /// Resolves once the connection has died.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn write_loop<T>(
    mut sink: PacketSink<T>,
    mut rx: mpsc::UnboundedReceiver<(u8, Bytes)>,
    shutdown: CancellationToken,
) where
    T: AsyncRead + AsyncWrite,
{
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            packet = rx.recv() => {
                let Some(packet) = packet else { break };
                if let Err(e) = sink.send(packet).await {
                    error!("failed writing to access point: {e}");
                    shutdown.cancel();
                    break;
                }
            }
        }
    }

    let _ = sink.close().await;
}

async fn receive_loop<T>(
    id: Uuid,
    mut stream: PacketStream<T>,
    tx: mpsc::UnboundedSender<(u8, Bytes)>,
    mercury: Mercury,
    status: Arc<Status>,
    shutdown: CancellationToken,
) where
    T: AsyncRead + AsyncWrite,
{
    let mut unknown = 0;

    loop {
        let packet = tokio::select! {
            () = shutdown.cancelled() => break,
            packet = stream.next() => packet,
        };

        let (cmd, payload) = match packet {
            Some(Ok(packet)) => packet,
            Some(Err(e)) => {
                error!("connection {id}: {e}");
                break;
            }
            None => {
                info!("connection {id} closed by access point");
                break;
            }
        };

        let Ok(packet_type) = PacketType::try_from(cmd) else {
            unknown += 1;
            warn!("connection {id}: ignoring unknown packet {cmd:#04x}");
            if unknown > MAX_UNKNOWN_PACKETS {
                error!("connection {id}: too many unknown packets, closing");
                break;
            }
            continue;
        };
        unknown = 0;
        trace!("connection {id}: received {packet_type} of {} bytes", payload.len());

        match packet_type {
            PacketType::Ping => {
                if payload.len() >= 4 {
                    let server_time = i64::from(u32::from_be_bytes([
                        payload[0], payload[1], payload[2], payload[3],
                    ]));
                    let now = SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX));
                    status
                        .server_time_delta
                        .store(server_time - now, Ordering::Relaxed);
                }
                if tx
                    .send((PacketType::Pong.into(), Bytes::from_static(&[0; 4])))
                    .is_err()
                {
                    break;
                }
            }
            PacketType::CountryCode => {
                let country = String::from_utf8_lossy(&payload).into_owned();
                debug!("connection {id}: country {country}");
                if let Ok(mut current) = status.country.write() {
                    *current = Some(country);
                }
            }
            packet_type if packet_type.is_mercury() => {
                if let Err(e) = mercury.dispatch(packet_type, payload) {
                    warn!("connection {id}: dropping malformed {packet_type}: {e}");
                }
            }
            PacketType::PongAck | PacketType::LicenseVersion | PacketType::ProductInfo => {
                trace!("connection {id}: ignoring {packet_type}");
            }
            other => {
                debug!("connection {id}: ignoring {other}");
            }
        }
    }

    status.alive.store(false, Ordering::Release);
    shutdown.cancel();
    mercury.invalidate();
}

/// Establishes authenticated connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, credentials: &Credentials) -> Result<Connection>;
}

/// Connects to the access point named by discovery.
pub struct ApConnector {
    config: Config,
    discovery: Arc<dyn Discovery>,
}

impl ApConnector {
    #[must_use]
    pub fn new(config: Config, discovery: Arc<dyn Discovery>) -> Self {
        Self { config, discovery }
    }
}

#[async_trait]
impl Connector for ApConnector {
    async fn connect(&self, credentials: &Credentials) -> Result<Connection> {
        let addr = self.discovery.access_point().await?;
        let mut transport = Transport::connect(&addr, &self.config).await?;
        let welcome = transport.authenticate(credentials, &self.config).await?;
        Ok(Connection::start(transport, welcome, &self.config))
    }
}

struct Current {
    username: String,
    connection: Arc<Connection>,
}

/// Owns the live connection for the configured credentials.
pub struct ConnectionProvider<C> {
    connector: C,
    credentials: RwLock<Credentials>,
    current: Mutex<Option<Current>>,
}

impl<C> ConnectionProvider<C>
where
    C: Connector,
{
    pub fn new(connector: C, credentials: Credentials) -> Self {
        Self {
            connector,
            credentials: RwLock::new(credentials),
            current: Mutex::new(None),
        }
    }

    /// Credentials the next connection will log in with.
    pub fn credentials(&self) -> Result<Credentials> {
        Ok(self.credentials.read()?.clone())
    }

    /// Replaces the credentials. A live connection for another username is
    /// replaced on the next [`connection`](Self::connection) call.
    pub fn set_credentials(&self, credentials: Credentials) -> Result<()> {
        *self.credentials.write()? = credentials;
        Ok(())
    }

    /// Returns a live connection, connecting and logging in if needed.
    ///
    /// A failed attempt leaves no state behind; the next call tries again.
    pub async fn connection(&self) -> Result<Arc<Connection>> {
        let mut current = self.current.lock().await;
        let credentials = self.credentials()?;

        if let Some(existing) = current.as_ref() {
            if existing.connection.is_alive() && existing.username == credentials.username {
                trace!("reusing connection {}", existing.connection.id());
                return Ok(Arc::clone(&existing.connection));
            }
        }

        if let Some(stale) = current.take() {
            debug!(
                "replacing connection {} for {}",
                stale.connection.id(),
                stale.username
            );
            stale.connection.shutdown();
        }

        let connection = Arc::new(self.connector.connect(&credentials).await?);
        let mut username = credentials.username.clone();

        // Log in with the reusable blob from now on, so the password is not
        // needed again.
        if credentials.auth_type == AuthType::Password {
            if let Some(reusable) = connection.welcome().reusable_credentials.clone() {
                let mut stored = self.credentials.write()?;
                if *stored == credentials {
                    debug!("stored reusable credentials for {}", reusable.username);
                    username.clone_from(&reusable.username);
                    *stored = reusable;
                }
            }
        }

        *current = Some(Current {
            username,
            connection: Arc::clone(&connection),
        });
        Ok(connection)
    }

    /// Shuts down the current connection, if any.
    pub async fn disconnect(&self) {
        if let Some(current) = self.current.lock().await.take() {
            current.connection.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::AtomicUsize, time::Duration};

    use protobuf::Message;

    use super::*;
    use crate::{
        error::ErrorKind,
        mercury::Packet,
        protocol::protos::mercury::Header,
        testing::{self, FakeAccessPoint, Login, ServerFramed},
    };

    const STEP: Duration = Duration::from_secs(2);

    async fn connect_fake(
        username: &str,
    ) -> (Connection, ServerFramed<tokio::io::DuplexStream>) {
        let config = Config::new().unwrap();
        let (client, server) = tokio::io::duplex(64 * 1024);
        let ap = tokio::spawn(FakeAccessPoint::new().login(server, Login::Welcome));

        let mut transport = Transport::handshake(client, testing::signing_key(), STEP).await.unwrap();
        let welcome = transport
            .authenticate(&Credentials::with_password(username, "secret"), &config)
            .await
            .unwrap();
        let (framed, _) = ap.await.unwrap().unwrap();
        (Connection::start(transport, welcome, &config), framed)
    }

    struct FakeConnector {
        attempts: AtomicUsize,
        fail_first: bool,
        seen: std::sync::Mutex<Vec<Credentials>>,
        servers: std::sync::Mutex<Vec<ServerFramed<tokio::io::DuplexStream>>>,
    }

    impl FakeConnector {
        fn new(fail_first: bool) -> Self {
            Self {
                attempts: AtomicUsize::new(0),
                fail_first,
                seen: std::sync::Mutex::new(Vec::new()),
                servers: std::sync::Mutex::new(Vec::new()),
            }
        }

        fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn connect(&self, credentials: &Credentials) -> Result<Connection> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(credentials.clone());
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.fail_first && attempt == 0 {
                return Err(Error::transport("connection refused"));
            }

            let (connection, server) = connect_fake(&credentials.username).await;
            self.servers.lock().unwrap().push(server);
            Ok(connection)
        }
    }

    #[tokio::test]
    async fn pings_are_answered_with_pongs() {
        let (connection, mut server) = connect_fake("alice").await;

        let now = u32::try_from(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap()
                .as_secs(),
        )
        .unwrap();
        server
            .send((
                PacketType::Ping.into(),
                Bytes::copy_from_slice(&(now + 100).to_be_bytes()),
            ))
            .await
            .unwrap();

        let (cmd, payload) = server.next().await.unwrap().unwrap();
        assert_eq!(cmd, u8::from(PacketType::Pong));
        assert_eq!(&payload[..], &[0; 4]);
        assert!((99..=101).contains(&connection.server_time_delta()));
    }

    #[tokio::test]
    async fn country_code_is_recorded() {
        let (connection, mut server) = connect_fake("alice").await;
        server
            .send((PacketType::CountryCode.into(), Bytes::from_static(b"SE")))
            .await
            .unwrap();

        // A round trip through Mercury orders the check after the packet.
        let request = tokio::spawn({
            let mercury = connection.mercury().clone();
            async move { mercury.get("hm://test/echo").await }
        });
        let (cmd, payload) = testing::next_client_packet(&mut server).await;
        assert_eq!(cmd, u8::from(PacketType::MercuryReq));
        let packet = Packet::decode(payload).unwrap();
        let mut header = Header::new();
        header.set_uri("hm://test/echo".to_owned());
        header.set_status_code(200);
        let reply = Packet {
            seq: packet.seq,
            flags: 1,
            parts: vec![Bytes::from(header.write_to_bytes().unwrap())],
        };
        server
            .send((PacketType::MercuryReq.into(), reply.encode().unwrap()))
            .await
            .unwrap();
        request.await.unwrap().unwrap();

        assert_eq!(connection.country().as_deref(), Some("SE"));
    }

    #[tokio::test]
    async fn occasional_unknown_packets_are_ignored() {
        let (connection, mut server) = connect_fake("alice").await;
        for _ in 0..MAX_UNKNOWN_PACKETS {
            server.send((0xee, Bytes::new())).await.unwrap();
        }
        server
            .send((PacketType::Ping.into(), Bytes::from_static(&[0; 4])))
            .await
            .unwrap();

        let (cmd, _) = server.next().await.unwrap().unwrap();
        assert_eq!(cmd, u8::from(PacketType::Pong));
        assert!(connection.is_alive());
    }

    #[tokio::test]
    async fn repeated_unknown_packets_close_the_connection() {
        let (connection, mut server) = connect_fake("alice").await;
        for _ in 0..=MAX_UNKNOWN_PACKETS {
            server.send((0xee, Bytes::new())).await.unwrap();
        }

        tokio::time::timeout(STEP, connection.closed()).await.unwrap();
        assert!(!connection.is_alive());
        let err = connection.mercury().get("hm://test/after").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Transport);
    }

    #[tokio::test]
    async fn socket_loss_fails_pending_requests() {
        let (connection, mut server) = connect_fake("alice").await;

        let request = tokio::spawn({
            let mercury = connection.mercury().clone();
            async move { mercury.get("hm://test/pending").await }
        });
        testing::next_client_packet(&mut server).await;
        drop(server);

        let err = request.await.unwrap().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Transport);
        tokio::time::timeout(STEP, connection.closed()).await.unwrap();
        assert!(!connection.is_alive());
    }

    #[tokio::test]
    async fn live_connection_is_reused() {
        let provider = ConnectionProvider::new(
            FakeConnector::new(false),
            Credentials::with_password("alice", "secret"),
        );

        let first = provider.connection().await.unwrap();
        let second = provider.connection().await.unwrap();

        assert_eq!(first.id(), second.id());
        assert_eq!(provider.connector.attempts(), 1);
    }

    #[tokio::test]
    async fn password_is_swapped_for_reusable_credentials() {
        let provider = ConnectionProvider::new(
            FakeConnector::new(false),
            Credentials::with_password("alice", "secret"),
        );

        provider.connection().await.unwrap();
        let credentials = provider.credentials().unwrap();
        assert_eq!(credentials.auth_type, AuthType::StoredCredentials);
        assert_eq!(credentials.auth_data, testing::REUSABLE_BLOB);

        // Reconnecting after a failure uses the blob.
        provider.connection().await.unwrap().shutdown();
        provider.connection().await.unwrap();
        let seen = provider.connector.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].auth_type, AuthType::StoredCredentials);
    }

    #[tokio::test]
    async fn username_change_creates_a_new_connection() {
        let provider = ConnectionProvider::new(
            FakeConnector::new(false),
            Credentials::with_password("alice", "secret"),
        );

        let first = provider.connection().await.unwrap();
        provider
            .set_credentials(Credentials::with_password("bob", "secret"))
            .unwrap();
        let second = provider.connection().await.unwrap();

        assert_ne!(first.id(), second.id());
        assert_eq!(second.username(), "bob");
        assert!(!first.is_alive());
        assert_eq!(provider.connector.attempts(), 2);
    }

    #[tokio::test]
    async fn dead_connection_is_replaced() {
        let provider = ConnectionProvider::new(
            FakeConnector::new(false),
            Credentials::with_password("alice", "secret"),
        );

        let first = provider.connection().await.unwrap();
        first.shutdown();
        let second = provider.connection().await.unwrap();

        assert_ne!(first.id(), second.id());
        assert_eq!(provider.connector.attempts(), 2);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_handshake() {
        let provider = Arc::new(ConnectionProvider::new(
            FakeConnector::new(false),
            Credentials::with_password("alice", "secret"),
        ));

        let (first, second) = tokio::join!(provider.connection(), provider.connection());
        assert_eq!(first.unwrap().id(), second.unwrap().id());
        assert_eq!(provider.connector.attempts(), 1);
    }

    #[tokio::test]
    async fn failed_attempt_does_not_poison_the_provider() {
        let provider = ConnectionProvider::new(
            FakeConnector::new(true),
            Credentials::with_password("alice", "secret"),
        );

        let err = provider.connection().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Transport);

        let connection = provider.connection().await.unwrap();
        assert!(connection.is_alive());
        assert_eq!(provider.connector.attempts(), 2);
    }
}
