//! Server side of the access point protocol for tests.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use num_bigint::BigUint;
use protobuf::Message;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::Framed;

use crate::{
    cipher::CipherStream,
    config::ServerKey,
    error::{Error, Result},
    handshake::{self, DhLocalKeys, SHA1_DIGEST_INFO},
    packet::PacketType,
    protocol::protos::{
        authentication::{
            APWelcome, AuthenticationType, ClientResponseEncrypted, LoginCredentials,
        },
        keyexchange::{
            APLoginFailed, APResponseMessage, ClientHello, ClientResponsePlaintext, ErrorCode,
        },
    },
};

/// Server end of an established test connection.
pub(crate) type ServerFramed<T> = Framed<T, CipherStream>;

/// Blob handed out as reusable credentials.
pub(crate) const REUSABLE_BLOB: &[u8] = b"reusable credentials";

/// How the fake access point answers a login.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Login {
    Welcome,
    Fail(ErrorCode),
}

/// RSA key pair over two Mersenne primes, large enough for SHA-1 PKCS #1
/// signatures. The primes are fixed, so every signer holds the same key.
pub(crate) struct Signer {
    public_key: ServerKey,
    modulus: BigUint,
    private_exponent: BigUint,
}

impl Signer {
    pub(crate) fn new() -> Self {
        let one = BigUint::from(1u32);
        let p = (BigUint::from(1u32) << 521u32) - 1u32;
        let q = (BigUint::from(1u32) << 607u32) - 1u32;
        let modulus = &p * &q;
        let phi = (&p - &one) * (&q - &one);
        let exponent = 65_537u32;
        let private_exponent = BigUint::from(exponent)
            .modinv(&phi)
            .expect("exponent is invertible");

        Self {
            public_key: ServerKey::new(modulus.to_bytes_be(), exponent),
            modulus,
            private_exponent,
        }
    }

    pub(crate) fn public_key(&self) -> &ServerKey {
        &self.public_key
    }

    pub(crate) fn sign(&self, message: &[u8]) -> Vec<u8> {
        let size = self.public_key.modulus.len();
        let mut encoded = vec![0x00, 0x01];
        encoded.resize(size - SHA1_DIGEST_INFO.len() - 20 - 1, 0xff);
        encoded.push(0x00);
        encoded.extend_from_slice(&SHA1_DIGEST_INFO);
        encoded.extend_from_slice(&Sha1::digest(message));

        let signature = BigUint::from_bytes_be(&encoded)
            .modpow(&self.private_exponent, &self.modulus)
            .to_bytes_be();
        let mut padded = vec![0; size - signature.len()];
        padded.extend_from_slice(&signature);
        padded
    }
}

/// Public key of [`Signer`], for clients talking to [`FakeAccessPoint`].
pub(crate) fn signing_key() -> ServerKey {
    Signer::new().public_key().clone()
}

/// Encodes an access point response carrying `gs`, with its size prefix.
pub(crate) fn server_hello(gs: &[u8], signature: Option<Vec<u8>>) -> Vec<u8> {
    let mut response = APResponseMessage::new();
    let dh = response
        .challenge
        .mut_or_insert_default()
        .login_crypto_challenge
        .mut_or_insert_default()
        .diffie_hellman
        .mut_or_insert_default();
    dh.set_gs(gs.to_vec());
    dh.set_server_signature_key(0);
    if let Some(signature) = signature {
        dh.set_gs_signature(signature);
    }
    response
        .challenge
        .mut_or_insert_default()
        .set_server_nonce(vec![0x5a; 16]);
    sized(&response.write_to_bytes().expect("serializable"))
}

/// Encodes an access point response that refuses the connection.
pub(crate) fn server_hello_failure(code: ErrorCode) -> Vec<u8> {
    let mut response = APResponseMessage::new();
    response
        .login_failed
        .mut_or_insert_default()
        .set_error_code(code);
    sized(&response.write_to_bytes().expect("serializable"))
}

fn sized(body: &[u8]) -> Vec<u8> {
    let size = u32::try_from(4 + body.len()).expect("small message");
    let mut message = size.to_be_bytes().to_vec();
    message.extend_from_slice(body);
    message
}

/// In-process access point. Signs its key exchange with [`signing_key`]
/// unless told otherwise.
pub(crate) struct FakeAccessPoint {
    keys: DhLocalKeys,
    signer: Option<Signer>,
}

impl FakeAccessPoint {
    pub(crate) fn new() -> Self {
        Self {
            keys: DhLocalKeys::random(),
            signer: Some(Signer::new()),
        }
    }

    /// Leaves the key exchange unsigned.
    pub(crate) fn unsigned(mut self) -> Self {
        self.signer = None;
        self
    }

    /// Runs the server side of the handshake and returns the stream with the
    /// server's packet cipher.
    pub(crate) async fn accept<T>(self, mut stream: T) -> Result<(T, CipherStream)>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let mut prefix = [0; 6];
        stream.read_exact(&mut prefix).await?;
        if prefix[..2] != [0x00, 0x04] {
            return Err(Error::handshake("bad client hello prefix"));
        }
        let size = u32::from_be_bytes([prefix[2], prefix[3], prefix[4], prefix[5]]) as usize;
        let mut body = vec![0; size - prefix.len()];
        stream.read_exact(&mut body).await?;

        let mut transcript = prefix.to_vec();
        transcript.extend_from_slice(&body);

        let hello = ClientHello::parse_from_bytes(&body)?;
        let gc = hello
            .login_crypto_hello
            .as_ref()
            .and_then(|hello| hello.diffie_hellman.as_ref())
            .map(|dh| dh.gc().to_vec())
            .ok_or_else(|| Error::handshake("client hello without key exchange"))?;

        let gs = self.keys.public_key();
        let signature = self.signer.as_ref().map(|signer| signer.sign(&gs));
        let response = server_hello(&gs, signature);
        stream.write_all(&response).await?;
        transcript.extend_from_slice(&response);

        let client_response = handshake::read_sized(&mut stream).await?;
        let client_response = ClientResponsePlaintext::parse_from_bytes(&client_response[4..])?;
        let hmac = client_response
            .login_crypto_response
            .as_ref()
            .and_then(|response| response.diffie_hellman.as_ref())
            .map(|dh| dh.hmac().to_vec())
            .unwrap_or_default();

        let keys = handshake::compute_keys(&self.keys.shared_secret(&gc), &transcript)?;
        if hmac != keys.challenge {
            return Err(Error::handshake("client proof does not match"));
        }

        Ok((stream, CipherStream::new(&keys.receive_key, &keys.send_key)))
    }

    /// Runs the handshake and answers the login as told.
    pub(crate) async fn login<T>(
        self,
        stream: T,
        outcome: Login,
    ) -> Result<(ServerFramed<T>, LoginCredentials)>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let (stream, cipher) = self.accept(stream).await?;
        let mut framed = Framed::new(stream, cipher);

        let (cmd, payload) = framed
            .next()
            .await
            .ok_or_else(|| Error::transport("client went away before login"))??;
        if cmd != u8::from(PacketType::Login) {
            return Err(Error::unauthenticated(format!(
                "expected login, got {cmd:#04x}"
            )));
        }
        let login = ClientResponseEncrypted::parse_from_tokio_bytes(&payload)?
            .login_credentials
            .into_option()
            .unwrap_or_default();

        match outcome {
            Login::Welcome => {
                let mut welcome = APWelcome::new();
                welcome.set_canonical_username(login.username().to_owned());
                welcome.set_reusable_auth_credentials_type(
                    AuthenticationType::AUTHENTICATION_STORED_SPOTIFY_CREDENTIALS,
                );
                welcome.set_reusable_auth_credentials(REUSABLE_BLOB.to_vec());
                framed
                    .send((
                        PacketType::APWelcome.into(),
                        Bytes::from(welcome.write_to_bytes()?),
                    ))
                    .await?;
            }
            Login::Fail(code) => {
                let mut failed = APLoginFailed::new();
                failed.set_error_code(code);
                framed
                    .send((
                        PacketType::AuthFailure.into(),
                        Bytes::from(failed.write_to_bytes()?),
                    ))
                    .await?;
            }
        }

        Ok((framed, login))
    }
}

/// Reads the next packet the client sends, skipping pongs.
pub(crate) async fn next_client_packet<T>(framed: &mut ServerFramed<T>) -> (u8, Bytes)
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let (cmd, payload) = framed
            .next()
            .await
            .expect("client connected")
            .expect("valid packet");
        if cmd != u8::from(PacketType::Pong) {
            return (cmd, payload);
        }
    }
}
