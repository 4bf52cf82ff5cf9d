//! Encrypted packet framing for the access point connection.
//!
//! After the handshake every packet is sealed with [`Shannon`]:
//!
//! ```text
//! [cmd: 1][length: 2, big-endian][payload: length][mac: 4]
//! '------------ encrypted ------------------------'
//! ```
//!
//! The header and payload are encrypted as one message whose nonce is a
//! per-direction packet counter, and the four byte MAC over the plaintext is
//! appended in the clear. Sending and receiving use independent keys and
//! counters, so the two directions never interfere.
//!
//! [`CipherStream`] implements the `tokio_util` codec traits so that the
//! transport can wrap its socket in a [`Framed`](tokio_util::codec::Framed).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    error::{Error, Result},
    shannon::Shannon,
};

/// Size of the encrypted header: command tag and payload length.
pub const HEADER_SIZE: usize = 3;

/// Size of the MAC trailer.
pub const MAC_SIZE: usize = 4;

/// Largest payload that fits the two byte length field.
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Stateful packet cipher for one connection.
///
/// Owns both directions: packets are encrypted with the send key and a send
/// counter, and decrypted with the receive key and a receive counter. A MAC
/// mismatch on receive is fatal: the stream is out of sync and the only
/// remedy is a new handshake.
pub struct CipherStream {
    encode_cipher: Shannon,
    encode_nonce: u32,
    decode_cipher: Shannon,
    decode_nonce: u32,
    decode_state: DecodeState,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DecodeState {
    Header,
    Payload(u8, usize),
}

impl std::fmt::Debug for CipherStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherStream")
            .field("encode_nonce", &self.encode_nonce)
            .field("decode_nonce", &self.decode_nonce)
            .finish_non_exhaustive()
    }
}

impl CipherStream {
    /// Creates a packet cipher from the keys derived by the handshake.
    #[must_use]
    pub fn new(send_key: &[u8], receive_key: &[u8]) -> Self {
        Self {
            encode_cipher: Shannon::new(send_key),
            encode_nonce: 0,
            decode_cipher: Shannon::new(receive_key),
            decode_nonce: 0,
            decode_state: DecodeState::Header,
        }
    }

    /// Number of packets sealed so far.
    #[must_use]
    pub fn sent(&self) -> u32 {
        self.encode_nonce
    }

    /// Number of packets opened so far.
    #[must_use]
    pub fn received(&self) -> u32 {
        self.decode_nonce
    }

    /// Seals one packet into `dst`.
    pub fn encrypt(&mut self, cmd: u8, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
        let length = u16::try_from(payload.len()).map_err(|_| {
            Error::invalid_argument(format!(
                "payload of {} bytes exceeds {MAX_PAYLOAD_SIZE} bytes",
                payload.len()
            ))
        })?;

        let offset = dst.len();
        dst.reserve(HEADER_SIZE + payload.len() + MAC_SIZE);
        dst.put_u8(cmd);
        dst.put_u16(length);
        dst.extend_from_slice(payload);

        self.encode_cipher.nonce_u32(self.encode_nonce);
        self.encode_cipher.encrypt(&mut dst[offset..]);

        let mut mac = [0; MAC_SIZE];
        self.encode_cipher.finish(&mut mac);
        dst.extend_from_slice(&mac);

        self.encode_nonce = self.encode_nonce.wrapping_add(1);
        Ok(())
    }

    /// Opens the next packet from `src`, or returns `None` when more bytes
    /// are needed.
    pub fn decrypt(&mut self, src: &mut BytesMut) -> Result<Option<(u8, Bytes)>> {
        if self.decode_state == DecodeState::Header && src.len() >= HEADER_SIZE {
            let mut header = [0; HEADER_SIZE];
            header.copy_from_slice(&src[..HEADER_SIZE]);
            src.advance(HEADER_SIZE);

            self.decode_cipher.nonce_u32(self.decode_nonce);
            self.decode_cipher.decrypt(&mut header);

            let cmd = header[0];
            let size = usize::from(u16::from_be_bytes([header[1], header[2]]));
            self.decode_state = DecodeState::Payload(cmd, size);
        }

        if let DecodeState::Payload(cmd, size) = self.decode_state {
            if src.len() < size + MAC_SIZE {
                src.reserve(size + MAC_SIZE - src.len());
                return Ok(None);
            }

            let mut payload = src.split_to(size);
            let mac = src.split_to(MAC_SIZE);

            self.decode_cipher.decrypt(&mut payload);
            let mut expected = [0; MAC_SIZE];
            self.decode_cipher.finish(&mut expected);
            if expected[..] != mac[..] {
                return Err(Error::data_loss(format!(
                    "MAC mismatch on packet {}",
                    self.decode_nonce
                )));
            }

            self.decode_nonce = self.decode_nonce.wrapping_add(1);
            self.decode_state = DecodeState::Header;
            return Ok(Some((cmd, payload.freeze())));
        }

        Ok(None)
    }
}

impl Encoder<(u8, Bytes)> for CipherStream {
    type Error = Error;

    fn encode(&mut self, (cmd, payload): (u8, Bytes), dst: &mut BytesMut) -> Result<()> {
        self.encrypt(cmd, &payload, dst)
    }
}

impl Decoder for CipherStream {
    type Item = (u8, Bytes);
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.decrypt(src)
    }
}
