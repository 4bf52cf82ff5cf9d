//! TCP transport to the access point.
//!
//! A [`Transport`] owns the socket, runs the [`handshake`](crate::handshake)
//! once and then exchanges encrypted packets through a
//! [`CipherStream`] codec. After [`authenticate`](Transport::authenticate)
//! it is handed to a [`Connection`](crate::connection::Connection), whose
//! receive loop becomes the only reader of the socket.

use std::time::Duration;

use bytes::Bytes;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use protobuf::{Enum, Message};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use tokio_util::codec::Framed;

use crate::{
    cipher::CipherStream,
    config::{Config, ServerKey},
    credentials::{AuthType, Credentials},
    error::{Error, Result},
    handshake,
    packet::PacketType,
    protocol::protos::{
        authentication::{APWelcome, ClientResponseEncrypted, CpuFamily, Os},
        keyexchange::APLoginFailed,
    },
};

/// Write half of an established transport.
pub type PacketSink<T> = SplitSink<Framed<T, CipherStream>, (u8, Bytes)>;

/// Read half of an established transport.
pub type PacketStream<T> = SplitStream<Framed<T, CipherStream>>;

/// Outcome of a successful login.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionWelcome {
    /// Username as known to the service, which may differ from the one used
    /// to log in.
    pub canonical_username: String,

    /// Device id presented at login.
    pub device_id: String,

    /// Credentials that log in again without the password.
    pub reusable_credentials: Option<Credentials>,
}

impl SessionWelcome {
    fn from_proto(welcome: &APWelcome, device_id: &str) -> Self {
        let reusable_credentials = (welcome.has_reusable_auth_credentials()
            && !welcome.reusable_auth_credentials().is_empty())
        .then(|| {
            let auth_type = AuthType::try_from(welcome.reusable_auth_credentials_type())
                .unwrap_or(AuthType::StoredCredentials);
            Credentials {
                username: welcome.canonical_username().to_owned(),
                auth_type,
                auth_data: welcome.reusable_auth_credentials().to_vec(),
            }
        });

        Self {
            canonical_username: welcome.canonical_username().to_owned(),
            device_id: device_id.to_owned(),
            reusable_credentials,
        }
    }
}

/// Encrypted packet transport.
pub struct Transport<T = TcpStream> {
    framed: Framed<T, CipherStream>,
}

impl<T> std::fmt::Debug for Transport<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("cipher", self.framed.codec())
            .finish_non_exhaustive()
    }
}

impl Transport<TcpStream> {
    /// Connects to `addr` (`host:port`) and runs the handshake.
    pub async fn connect(addr: &str, config: &Config) -> Result<Self> {
        debug!("connecting to access point {addr}");
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::deadline_exceeded(format!("timed out connecting to {addr}")))??;
        stream.set_nodelay(true)?;

        Self::handshake(
            stream,
            config.ap_signing_key.clone(),
            config.handshake_timeout,
        )
        .await
    }
}

impl<T> Transport<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Runs the handshake over an established stream.
    pub async fn handshake(
        mut stream: T,
        signing_key: ServerKey,
        step_timeout: Duration,
    ) -> Result<Self> {
        let cipher = handshake::handshake(&mut stream, signing_key, step_timeout).await?;
        Ok(Self {
            framed: Framed::new(stream, cipher),
        })
    }

    /// Logs in and waits for the verdict.
    ///
    /// # Errors
    ///
    /// * `Unauthenticated` carrying an [`AuthFailure`](crate::error::AuthFailure)
    ///   when the server rejects the credentials
    /// * `Unauthenticated` when any other packet arrives first
    /// * `DeadlineExceeded` when no verdict arrives within the request timeout
    pub async fn authenticate(
        &mut self,
        credentials: &Credentials,
        config: &Config,
    ) -> Result<SessionWelcome> {
        let mut packet = ClientResponseEncrypted::new();
        let login = packet.login_credentials.mut_or_insert_default();
        login.set_username(credentials.username.clone());
        login.set_typ(credentials.auth_type.into());
        login.set_auth_data(credentials.auth_data.clone());

        let system_info = packet.system_info.mut_or_insert_default();
        system_info.set_cpu_family(CpuFamily::CPU_UNKNOWN);
        system_info.set_os(Os::OS_UNKNOWN);
        system_info.set_system_information_string(config.system_information());
        system_info.set_device_id(config.device_id.clone());
        packet.set_version_string(config.app_version.clone());

        self.send_packet(PacketType::Login, Bytes::from(packet.write_to_bytes()?))
            .await?;

        let (cmd, payload) = tokio::time::timeout(config.request_timeout, self.next_packet())
            .await
            .map_err(|_| Error::deadline_exceeded("timed out waiting for login verdict"))??;

        match PacketType::try_from(cmd) {
            Ok(PacketType::APWelcome) => {
                let welcome = APWelcome::parse_from_tokio_bytes(&payload)?;
                let welcome = SessionWelcome::from_proto(&welcome, &config.device_id);
                info!("authenticated as {}", welcome.canonical_username);
                Ok(welcome)
            }
            Ok(PacketType::AuthFailure) => {
                let failure = APLoginFailed::parse_from_tokio_bytes(&payload)?;
                let code = failure.error_code();
                let description = if failure.has_error_description() {
                    failure.error_description().to_owned()
                } else {
                    format!("{code:?}")
                };
                Err(Error::login_failed(code.value(), description))
            }
            _ => Err(Error::unauthenticated(format!(
                "unexpected packet {cmd:#04x} during login"
            ))),
        }
    }

    pub async fn send_packet(&mut self, packet_type: PacketType, payload: Bytes) -> Result<()> {
        trace!("sending {packet_type} of {} bytes", payload.len());
        self.framed.send((packet_type.into(), payload)).await
    }

    /// Reads the next packet. A closed socket is a `Transport` error.
    pub async fn next_packet(&mut self) -> Result<(u8, Bytes)> {
        match self.framed.next().await {
            Some(packet) => packet,
            None => Err(Error::transport("connection closed by access point")),
        }
    }

    /// Splits into write and read halves for the connection tasks.
    pub fn split(self) -> (PacketSink<T>, PacketStream<T>) {
        self.framed.split()
    }
}
