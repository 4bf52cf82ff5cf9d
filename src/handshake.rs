//! Diffie-Hellman key exchange with the access point.
//!
//! The handshake runs in the clear before any encrypted packet is exchanged:
//!
//! 1. The client sends a `ClientHello` with its public value `g^x` and a
//!    random nonce, prefixed by `[0x00, 0x04]` and a four byte size.
//! 2. The access point answers with an `APResponseMessage` carrying its
//!    public value `g^y`, signed with its RSA key.
//! 3. Both sides derive the shared secret and expand it with HMAC-SHA1 over
//!    every byte exchanged so far into a challenge and two cipher keys.
//! 4. The client proves possession of the keys by sending the challenge in a
//!    `ClientResponsePlaintext`.
//!
//! From then on both directions are encrypted by a
//! [`CipherStream`](crate::cipher::CipherStream). A response that does not
//! pass validation fails the handshake; there is no fallback to plaintext.
//!
//! [`HandshakeEngine`] is the sans-I/O state machine; [`handshake`] drives it
//! over a socket with a deadline per step.

use std::{fmt, time::Duration};

use hmac::{Hmac, Mac};
use num_bigint::BigUint;
use protobuf::{Enum, EnumOrUnknown, Message};
use rand::RngCore;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    cipher::CipherStream,
    config::{ServerKey, BUILD_VERSION},
    error::{Error, Result},
    protocol::protos::keyexchange::{
        APResponseMessage, ClientHello, ClientResponsePlaintext, Cryptosuite, Platform, Product,
    },
};

type HmacSha1 = Hmac<Sha1>;

/// 768-bit MODP group (Oakley group 1).
pub const DH_PRIME: [u8; 96] = [
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xc9, 0x0f, 0xda, 0xa2, 0x21, 0x68, 0xc2,
    0x34, 0xc4, 0xc6, 0x62, 0x8b, 0x80, 0xdc, 0x1c, 0xd1, 0x29, 0x02, 0x4e, 0x08, 0x8a, 0x67,
    0xcc, 0x74, 0x02, 0x0b, 0xbe, 0xa6, 0x3b, 0x13, 0x9b, 0x22, 0x51, 0x4a, 0x08, 0x79, 0x8e,
    0x34, 0x04, 0xdd, 0xef, 0x95, 0x19, 0xb3, 0xcd, 0x3a, 0x43, 0x1b, 0x30, 0x2b, 0x0a, 0x6d,
    0xf2, 0x5f, 0x14, 0x37, 0x4f, 0xe1, 0x35, 0x6d, 0x6d, 0x51, 0xc2, 0x45, 0xe4, 0x85, 0xb5,
    0x76, 0x62, 0x5e, 0x7e, 0xc6, 0xf4, 0x4c, 0x42, 0xe9, 0xa6, 0x3a, 0x36, 0x20, 0xff, 0xff,
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
];

/// Group generator.
pub const DH_GENERATOR: u32 = 2;

/// Size of the private exponent in bytes.
const PRIVATE_KEY_SIZE: usize = 95;

/// Size of the client nonce in bytes.
const NONCE_SIZE: usize = 16;

/// Largest handshake message accepted from the access point.
const MAX_MESSAGE_SIZE: usize = 16 * 1024;

/// ASN.1 `DigestInfo` prefix for SHA-1 in PKCS #1 v1.5 signatures.
pub(crate) const SHA1_DIGEST_INFO: [u8; 15] = [
    0x30, 0x21, 0x30, 0x09, 0x06, 0x05, 0x2b, 0x0e, 0x03, 0x02, 0x1a, 0x05, 0x00, 0x04, 0x14,
];

/// Ephemeral Diffie-Hellman key pair.
pub struct DhLocalKeys {
    private_key: BigUint,
    public_key: BigUint,
}

impl fmt::Debug for DhLocalKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DhLocalKeys").finish_non_exhaustive()
    }
}

impl DhLocalKeys {
    /// Generates a fresh key pair.
    #[must_use]
    pub fn random() -> Self {
        let mut bytes = [0; PRIVATE_KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self::from_private(&bytes)
    }

    /// Builds a key pair from a big-endian private exponent.
    #[must_use]
    pub fn from_private(private: &[u8]) -> Self {
        let private_key = BigUint::from_bytes_be(private);
        let public_key = BigUint::from(DH_GENERATOR).modpow(&private_key, &prime());
        Self {
            private_key,
            public_key,
        }
    }

    /// Big-endian public value `g^x mod p`.
    #[must_use]
    pub fn public_key(&self) -> Vec<u8> {
        self.public_key.to_bytes_be()
    }

    /// Big-endian shared secret `(g^y)^x mod p`.
    #[must_use]
    pub fn shared_secret(&self, remote_key: &[u8]) -> Vec<u8> {
        BigUint::from_bytes_be(remote_key)
            .modpow(&self.private_key, &prime())
            .to_bytes_be()
    }
}

fn prime() -> BigUint {
    BigUint::from_bytes_be(&DH_PRIME)
}

/// Rejects degenerate public values.
///
/// Values outside `1 < y < p - 1` give a shared secret the peer can predict
/// without knowing the private exponent.
pub fn check_public_value(value: &[u8]) -> Result<()> {
    let value = BigUint::from_bytes_be(value);
    let upper = prime() - 1u32;
    if value <= BigUint::from(1u32) || value >= upper {
        return Err(Error::handshake(
            "server public value outside the group range",
        ));
    }
    Ok(())
}

/// Verifies an RSASSA-PKCS1-v1_5 SHA-1 signature over `message`.
pub fn verify_signature(key: &ServerKey, message: &[u8], signature: &[u8]) -> Result<()> {
    let modulus = BigUint::from_bytes_be(&key.modulus);
    let size = modulus.to_bytes_be().len();
    let padding = size
        .checked_sub(3 + SHA1_DIGEST_INFO.len() + 20)
        .filter(|padding| *padding >= 8)
        .ok_or_else(|| Error::handshake("server signing key too short"))?;

    let signature = BigUint::from_bytes_be(signature);
    if signature >= modulus {
        return Err(Error::handshake("server signature out of range"));
    }

    let decoded = signature
        .modpow(&BigUint::from(key.exponent), &modulus)
        .to_bytes_be();
    let mut encoded = vec![0; size - decoded.len()];
    encoded.extend_from_slice(&decoded);

    let mut expected = Vec::with_capacity(size);
    expected.extend_from_slice(&[0x00, 0x01]);
    expected.resize(2 + padding, 0xff);
    expected.push(0x00);
    expected.extend_from_slice(&SHA1_DIGEST_INFO);
    expected.extend_from_slice(&Sha1::digest(message));

    if encoded != expected {
        return Err(Error::handshake("server signature does not verify"));
    }
    Ok(())
}

/// Output of the key derivation.
pub struct DerivedKeys {
    /// HMAC proof sent in the client response.
    pub challenge: Vec<u8>,

    /// Key for packets sent by the client.
    pub send_key: Vec<u8>,

    /// Key for packets received by the client.
    pub receive_key: Vec<u8>,
}

impl fmt::Debug for DerivedKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedKeys").finish_non_exhaustive()
    }
}

/// Expands the shared secret over the handshake transcript.
pub fn compute_keys(shared_secret: &[u8], transcript: &[u8]) -> Result<DerivedKeys> {
    let mut data = Vec::with_capacity(100);
    for i in 1..6u8 {
        let mut mac = HmacSha1::new_from_slice(shared_secret)?;
        mac.update(transcript);
        mac.update(&[i]);
        data.extend_from_slice(&mac.finalize().into_bytes());
    }

    let mut mac = HmacSha1::new_from_slice(&data[..0x14])?;
    mac.update(transcript);

    Ok(DerivedKeys {
        challenge: mac.finalize().into_bytes().to_vec(),
        send_key: data[0x14..0x34].to_vec(),
        receive_key: data[0x34..0x54].to_vec(),
    })
}

/// Progress of a handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HandshakeState {
    Init,
    ClientHelloSent,
    ServerHelloReceived,
    KeysDerived,
    Established,
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::ClientHelloSent => "client hello sent",
            Self::ServerHelloReceived => "server hello received",
            Self::KeysDerived => "keys derived",
            Self::Established => "established",
        };
        f.write_str(name)
    }
}

/// Sans-I/O handshake state machine.
///
/// Every step checks the current state and fails with `Internal` when called
/// out of order.
pub struct HandshakeEngine {
    state: HandshakeState,
    keys: DhLocalKeys,
    signing_key: ServerKey,
    transcript: Vec<u8>,
    remote_key: Vec<u8>,
    derived: Option<DerivedKeys>,
}

impl fmt::Debug for HandshakeEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeEngine")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl HandshakeEngine {
    #[must_use]
    pub fn new(signing_key: ServerKey) -> Self {
        Self::with_keys(DhLocalKeys::random(), signing_key)
    }

    #[must_use]
    pub fn with_keys(keys: DhLocalKeys, signing_key: ServerKey) -> Self {
        Self {
            state: HandshakeState::Init,
            keys,
            signing_key,
            transcript: Vec::with_capacity(1024),
            remote_key: Vec::new(),
            derived: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    fn expect_state(&self, expected: HandshakeState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Error::internal(format!(
                "handshake step out of order: expected {expected}, in {}",
                self.state
            )))
        }
    }

    /// Encodes the client hello, including its size prefix.
    pub fn client_hello(&mut self) -> Result<Vec<u8>> {
        self.expect_state(HandshakeState::Init)?;

        let mut nonce = [0; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);

        let mut hello = ClientHello::new();
        let build_info = hello.build_info.mut_or_insert_default();
        build_info.set_product(Product::PRODUCT_CLIENT);
        build_info.set_platform(Platform::PLATFORM_LINUX_X86);
        build_info.set_version(BUILD_VERSION);
        hello
            .cryptosuites_supported
            .push(EnumOrUnknown::new(Cryptosuite::CRYPTO_SUITE_SHANNON));
        let dh = hello
            .login_crypto_hello
            .mut_or_insert_default()
            .diffie_hellman
            .mut_or_insert_default();
        dh.set_gc(self.keys.public_key());
        dh.set_server_keys_known(1);
        hello.set_client_nonce(nonce.to_vec());
        hello.set_padding(vec![0x1e]);

        let body = hello.write_to_bytes()?;
        let size = u32::try_from(2 + 4 + body.len())
            .map_err(|_| Error::internal("client hello too large"))?;

        let mut message = Vec::with_capacity(2 + 4 + body.len());
        message.extend_from_slice(&[0x00, 0x04]);
        message.extend_from_slice(&size.to_be_bytes());
        message.extend_from_slice(&body);

        self.transcript.extend_from_slice(&message);
        self.state = HandshakeState::ClientHelloSent;
        Ok(message)
    }

    /// Accepts the access point response: the four byte size prefix followed
    /// by the encoded `APResponseMessage`.
    pub fn server_hello(&mut self, message: &[u8]) -> Result<()> {
        self.expect_state(HandshakeState::ClientHelloSent)?;
        if message.len() < 4 {
            return Err(Error::handshake("truncated server hello"));
        }
        self.transcript.extend_from_slice(message);

        let response = APResponseMessage::parse_from_bytes(&message[4..])
            .map_err(|e| Error::handshake(format!("malformed server hello: {e}")))?;

        if let Some(failed) = response.login_failed.as_ref() {
            let code = failed.error_code();
            let description = if failed.has_error_description() {
                failed.error_description().to_owned()
            } else {
                format!("{code:?}")
            };
            return Err(Error::login_failed(code.value(), description));
        }

        let challenge = response
            .challenge
            .as_ref()
            .and_then(|c| c.login_crypto_challenge.as_ref())
            .and_then(|c| c.diffie_hellman.as_ref())
            .filter(|dh| dh.has_gs())
            .ok_or_else(|| Error::handshake("server hello without key exchange"))?;

        check_public_value(challenge.gs())?;
        if !challenge.has_gs_signature() {
            return Err(Error::handshake("server hello is not signed"));
        }
        verify_signature(&self.signing_key, challenge.gs(), challenge.gs_signature())?;

        self.remote_key = challenge.gs().to_vec();
        self.state = HandshakeState::ServerHelloReceived;
        Ok(())
    }

    /// Derives the challenge and cipher keys from the shared secret.
    pub fn derive_keys(&mut self) -> Result<()> {
        self.expect_state(HandshakeState::ServerHelloReceived)?;
        let shared_secret = self.keys.shared_secret(&self.remote_key);
        self.derived = Some(compute_keys(&shared_secret, &self.transcript)?);
        self.state = HandshakeState::KeysDerived;
        Ok(())
    }

    /// Encodes the client response, including its size prefix, and switches
    /// to the encrypted packet cipher.
    pub fn client_response(&mut self) -> Result<(Vec<u8>, CipherStream)> {
        self.expect_state(HandshakeState::KeysDerived)?;
        let derived = self
            .derived
            .take()
            .ok_or_else(|| Error::internal("keys missing after derivation"))?;

        let mut response = ClientResponsePlaintext::new();
        response
            .login_crypto_response
            .mut_or_insert_default()
            .diffie_hellman
            .mut_or_insert_default()
            .set_hmac(derived.challenge);
        response.pow_response.mut_or_insert_default();
        response.crypto_response.mut_or_insert_default();

        let body = response.write_to_bytes()?;
        let size = u32::try_from(4 + body.len())
            .map_err(|_| Error::internal("client response too large"))?;

        let mut message = Vec::with_capacity(4 + body.len());
        message.extend_from_slice(&size.to_be_bytes());
        message.extend_from_slice(&body);

        self.state = HandshakeState::Established;
        Ok((
            message,
            CipherStream::new(&derived.send_key, &derived.receive_key),
        ))
    }
}

/// Runs the handshake over `stream`, bounding every network step by
/// `step_timeout`.
pub async fn handshake<T>(
    stream: &mut T,
    signing_key: ServerKey,
    step_timeout: Duration,
) -> Result<CipherStream>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut engine = HandshakeEngine::new(signing_key);

    let hello = engine.client_hello()?;
    tokio::time::timeout(step_timeout, stream.write_all(&hello))
        .await
        .map_err(|_| Error::deadline_exceeded("timed out sending client hello"))??;
    debug!("handshake: {}", engine.state());

    let response = tokio::time::timeout(step_timeout, read_sized(stream))
        .await
        .map_err(|_| Error::deadline_exceeded("timed out waiting for server hello"))??;
    engine.server_hello(&response)?;
    debug!("handshake: {}", engine.state());

    engine.derive_keys()?;
    debug!("handshake: {}", engine.state());

    let (response, cipher) = engine.client_response()?;
    tokio::time::timeout(step_timeout, stream.write_all(&response))
        .await
        .map_err(|_| Error::deadline_exceeded("timed out sending client response"))??;
    debug!("handshake: {}", engine.state());

    Ok(cipher)
}

/// Reads a message prefixed by its four byte big-endian size, which counts
/// the prefix itself. Returns the prefix and body together.
pub(crate) async fn read_sized<T>(stream: &mut T) -> Result<Vec<u8>>
where
    T: AsyncRead + Unpin,
{
    let mut prefix = [0; 4];
    stream.read_exact(&mut prefix).await?;

    let size = u32::from_be_bytes(prefix) as usize;
    if !(4..=MAX_MESSAGE_SIZE).contains(&size) {
        return Err(Error::handshake(format!(
            "handshake message size {size} out of range"
        )));
    }

    let mut message = vec![0; size];
    message[..4].copy_from_slice(&prefix);
    stream.read_exact(&mut message[4..]).await?;
    Ok(message)
}
