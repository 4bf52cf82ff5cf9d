//! The Shannon stream cipher.
//!
//! Shannon is a word-oriented, non-linear feedback stream cipher with a
//! built-in message authentication code, published by Qualcomm. The access
//! point encrypts every packet after the handshake with it, so this
//! implementation must match the reference construction bit for bit.
//!
//! # Usage
//!
//! The cipher is keyed once. Every message then starts by setting a nonce,
//! which restores the keyed state, followed by any number of
//! [`encrypt`](Shannon::encrypt) or [`decrypt`](Shannon::decrypt) calls and a
//! final [`finish`](Shannon::finish) that produces the MAC over everything
//! processed since the nonce.
//!
//! ```rust
//! use spotlink::shannon::Shannon;
//!
//! let mut cipher = Shannon::new(b"shared key");
//! cipher.nonce_u32(0);
//! let mut data = *b"hello";
//! cipher.encrypt(&mut data);
//! let mut mac = [0; 4];
//! cipher.finish(&mut mac);
//! ```
//!
//! Messages need not be processed in one call: splitting a message at any
//! byte boundary yields the same output, which the packet framing relies on
//! to decrypt a header before the payload has arrived.

/// Number of words in the register.
const N: usize = 16;

/// Number of diffusion rounds.
const FOLD: usize = N;

/// Initial value of the key-dependent constant.
const INITKONST: u32 = 0x6996_c53a;

/// Register word where key and MAC material is injected.
const KEYP: usize = 13;

/// Shannon cipher state.
///
/// Holds the register, the CRC register used for the MAC, and the keyed
/// state that every nonce starts from.
#[derive(Clone)]
pub struct Shannon {
    r: [u32; N],
    crc: [u32; N],
    init_r: [u32; N],
    konst: u32,
    sbuf: u32,
    mbuf: u32,
    nbuf: u32,
}

/// Key material is never printed.
impl std::fmt::Debug for Shannon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shannon").finish_non_exhaustive()
    }
}

#[inline]
fn sbox1(mut w: u32) -> u32 {
    w ^= w.rotate_left(5) | w.rotate_left(7);
    w ^= w.rotate_left(19) | w.rotate_left(22);
    w
}

#[inline]
fn sbox2(mut w: u32) -> u32 {
    w ^= w.rotate_left(7) | w.rotate_left(22);
    w ^= w.rotate_left(5) | w.rotate_left(19);
    w
}

#[inline]
fn word(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

impl Shannon {
    /// Creates a cipher keyed with `key`.
    #[must_use]
    pub fn new(key: &[u8]) -> Self {
        let mut cipher = Self {
            r: [0; N],
            crc: [0; N],
            init_r: [0; N],
            konst: INITKONST,
            sbuf: 0,
            mbuf: 0,
            nbuf: 0,
        };

        cipher.init_state();
        cipher.load_key(key);
        cipher.gen_konst();
        cipher.init_r = cipher.r;
        cipher
    }

    /// Starts a new message with `nonce`.
    pub fn nonce(&mut self, nonce: &[u8]) {
        self.r = self.init_r;
        self.konst = INITKONST;
        self.load_key(nonce);
        self.gen_konst();
        self.nbuf = 0;
    }

    /// Starts a new message with a big-endian encoded counter as nonce.
    pub fn nonce_u32(&mut self, nonce: u32) {
        self.nonce(&nonce.to_be_bytes());
    }

    /// Encrypts `buf` in place and adds the plaintext to the MAC.
    pub fn encrypt(&mut self, buf: &mut [u8]) {
        let mut i = 0;

        // Complete a partial word left over by a previous call.
        if self.nbuf != 0 {
            while self.nbuf != 0 && i < buf.len() {
                self.mbuf ^= u32::from(buf[i]) << (32 - self.nbuf);
                buf[i] ^= self.keystream_byte();
                i += 1;
                self.nbuf -= 8;
            }
            if self.nbuf != 0 {
                return;
            }
            self.mac_word(self.mbuf);
        }

        let words_end = i + ((buf.len() - i) & !3);
        while i < words_end {
            self.cycle();
            let plain = word(&buf[i..]);
            self.mac_word(plain);
            let cipher = plain ^ self.sbuf;
            buf[i..i + 4].copy_from_slice(&cipher.to_le_bytes());
            i += 4;
        }

        if i < buf.len() {
            self.cycle();
            self.mbuf = 0;
            self.nbuf = 32;
            while self.nbuf != 0 && i < buf.len() {
                self.mbuf ^= u32::from(buf[i]) << (32 - self.nbuf);
                buf[i] ^= self.keystream_byte();
                i += 1;
                self.nbuf -= 8;
            }
        }
    }

    /// Decrypts `buf` in place and adds the recovered plaintext to the MAC.
    pub fn decrypt(&mut self, buf: &mut [u8]) {
        let mut i = 0;

        if self.nbuf != 0 {
            while self.nbuf != 0 && i < buf.len() {
                buf[i] ^= self.keystream_byte();
                self.mbuf ^= u32::from(buf[i]) << (32 - self.nbuf);
                i += 1;
                self.nbuf -= 8;
            }
            if self.nbuf != 0 {
                return;
            }
            self.mac_word(self.mbuf);
        }

        let words_end = i + ((buf.len() - i) & !3);
        while i < words_end {
            self.cycle();
            let plain = word(&buf[i..]) ^ self.sbuf;
            self.mac_word(plain);
            buf[i..i + 4].copy_from_slice(&plain.to_le_bytes());
            i += 4;
        }

        if i < buf.len() {
            self.cycle();
            self.mbuf = 0;
            self.nbuf = 32;
            while self.nbuf != 0 && i < buf.len() {
                buf[i] ^= self.keystream_byte();
                self.mbuf ^= u32::from(buf[i]) << (32 - self.nbuf);
                i += 1;
                self.nbuf -= 8;
            }
        }
    }

    /// Finishes the message and writes its MAC into `mac`.
    ///
    /// The MAC may be any length; the access point uses four bytes.
    pub fn finish(&mut self, mac: &mut [u8]) {
        if self.nbuf != 0 {
            self.mac_word(self.mbuf);
        }

        self.cycle();
        self.add_key(INITKONST ^ (self.nbuf << 3));
        self.nbuf = 0;

        for (r, crc) in self.r.iter_mut().zip(self.crc.iter()) {
            *r ^= *crc;
        }
        self.diffuse();

        for chunk in mac.chunks_mut(4) {
            self.cycle();
            let bytes = self.sbuf.to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }

    #[inline]
    #[expect(clippy::cast_possible_truncation)]
    fn keystream_byte(&self) -> u8 {
        (self.sbuf >> (32 - self.nbuf)) as u8
    }

    fn cycle(&mut self) {
        // Non-linear feedback function.
        let mut t = self.r[12] ^ self.r[13] ^ self.konst;
        t = sbox1(t) ^ self.r[0].rotate_left(1);

        self.r.copy_within(1.., 0);
        self.r[N - 1] = t;

        t = sbox2(self.r[2] ^ self.r[15]);
        self.r[0] ^= t;
        self.sbuf = t ^ self.r[8] ^ self.r[12];
    }

    fn crc_word(&mut self, i: u32) {
        let t = self.crc[0] ^ self.crc[2] ^ self.crc[15] ^ i;
        self.crc.copy_within(1.., 0);
        self.crc[N - 1] = t;
    }

    fn mac_word(&mut self, i: u32) {
        self.crc_word(i);
        self.r[KEYP] ^= i;
    }

    fn init_state(&mut self) {
        self.r[0] = 1;
        self.r[1] = 1;
        for i in 2..N {
            self.r[i] = self.r[i - 1].wrapping_add(self.r[i - 2]);
        }
        self.konst = INITKONST;
    }

    fn gen_konst(&mut self) {
        self.konst = self.r[0];
    }

    fn add_key(&mut self, k: u32) {
        self.r[KEYP] ^= k;
    }

    fn diffuse(&mut self) {
        for _ in 0..FOLD {
            self.cycle();
        }
    }

    #[expect(clippy::cast_possible_truncation)]
    fn load_key(&mut self, key: &[u8]) {
        let mut chunks = key.chunks_exact(4);
        for chunk in &mut chunks {
            self.add_key(word(chunk));
            self.cycle();
        }

        let remainder = chunks.remainder();
        if !remainder.is_empty() {
            let mut extra = [0; 4];
            extra[..remainder.len()].copy_from_slice(remainder);
            self.add_key(u32::from_le_bytes(extra));
            self.cycle();
        }

        // Keys and nonces are short; only the low 32 bits of the length
        // enter the state.
        self.add_key(key.len() as u32);
        self.cycle();

        self.crc = self.r;
        self.diffuse();

        for (r, crc) in self.r.iter_mut().zip(self.crc.iter()) {
            *r ^= *crc;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::hex;

    fn seal(cipher: &mut Shannon, nonce: u32, data: &mut [u8]) -> [u8; 4] {
        cipher.nonce_u32(nonce);
        cipher.encrypt(data);
        let mut mac = [0; 4];
        cipher.finish(&mut mac);
        mac
    }

    fn open(cipher: &mut Shannon, nonce: u32, data: &mut [u8]) -> [u8; 4] {
        cipher.nonce_u32(nonce);
        cipher.decrypt(data);
        let mut mac = [0; 4];
        cipher.finish(&mut mac);
        mac
    }

    #[test]
    fn known_answers() {
        let mut empty = Shannon::new(&[]);
        assert_eq!(seal(&mut empty, 0, &mut []), [225, 255, 57, 255]);

        let key: Vec<u8> = (0..32).collect();
        let mut cipher = Shannon::new(&key);

        let mut data = *b"Shannon known answer";
        let mac = seal(&mut cipher, 1, &mut data);
        assert_eq!(hex(&data), "e8ff47c131486bd7fe2bb4ed0fe5abaf271fc611");
        assert_eq!(mac, [70, 169, 70, 192]);

        let mut data = *b"abcdefg";
        let mac = seal(&mut cipher, 7, &mut data);
        assert_eq!(hex(&data), "f5be2e6bc717f9");
        assert_eq!(mac, [204, 98, 185, 15]);
    }

    #[test]
    fn matches_reference_crate() {
        for key_len in [0usize, 1, 4, 7, 16, 32] {
            #[expect(clippy::cast_possible_truncation)]
            let key: Vec<u8> = (0..key_len).map(|i| (i * 13 + 1) as u8).collect();
            let mut ours = Shannon::new(&key);
            let mut reference = ::shannon::Shannon::new(&key);

            for len in 0..=40u32 {
                #[expect(clippy::cast_possible_truncation)]
                let plain: Vec<u8> = (0..len).map(|i| (i * 31 + 5) as u8).collect();
                let nonce = len * 3 + 1;

                let mut mine = plain.clone();
                let mine_mac = seal(&mut ours, nonce, &mut mine);

                let mut theirs = plain.clone();
                reference.nonce_u32(nonce);
                reference.encrypt(&mut theirs);
                let mut theirs_mac = [0; 4];
                reference.finish(&mut theirs_mac);

                assert_eq!(mine, theirs, "key {key_len}, length {len}");
                assert_eq!(mine_mac, theirs_mac, "mac for key {key_len}, length {len}");
            }
        }
    }

    #[test]
    fn header_then_payload_matches_reference_crate() {
        let key = [0x5c; 32];
        let plain = *b"\x04\x00\x0bhello world";

        let mut ours = Shannon::new(&key);
        ours.nonce_u32(42);
        let mut mine = plain;
        let (header, payload) = mine.split_at_mut(3);
        ours.decrypt(header);
        ours.decrypt(payload);
        let mut mine_mac = [0; 4];
        ours.finish(&mut mine_mac);

        let mut reference = ::shannon::Shannon::new(&key);
        reference.nonce_u32(42);
        let mut theirs = plain;
        let (header, payload) = theirs.split_at_mut(3);
        reference.decrypt(header);
        reference.decrypt(payload);
        let mut theirs_mac = [0; 4];
        reference.finish(&mut theirs_mac);

        assert_eq!(mine, theirs);
        assert_eq!(mine_mac, theirs_mac);
    }

    #[test]
    fn decrypt_inverts_encrypt_for_all_short_lengths() {
        let key = [0x42; 32];
        let mut tx = Shannon::new(&key);
        let mut rx = Shannon::new(&key);

        for len in 0..=67 {
            #[expect(clippy::cast_possible_truncation)]
            let plain: Vec<u8> = (0..len).map(|i| (i * 7 + 3) as u8).collect();
            let mut data = plain.clone();

            let nonce = u32::try_from(len).unwrap();
            let sent_mac = seal(&mut tx, nonce, &mut data);
            if len >= 4 {
                assert_ne!(data, plain, "length {len} not encrypted");
            }

            let received_mac = open(&mut rx, nonce, &mut data);
            assert_eq!(data, plain, "length {len}");
            assert_eq!(sent_mac, received_mac, "mac for length {len}");
        }
    }

    #[test]
    fn split_processing_matches_single_call() {
        let key = b"split key";
        let plain: Vec<u8> = (0..=255).collect();

        let mut whole = plain.clone();
        let whole_mac = seal(&mut Shannon::new(key), 9, &mut whole);

        for split in [1, 2, 3, 5, 8, 131] {
            let mut cipher = Shannon::new(key);
            cipher.nonce_u32(9);
            let mut parts = plain.clone();
            let (head, tail) = parts.split_at_mut(split);
            cipher.encrypt(head);
            cipher.encrypt(tail);
            let mut mac = [0; 4];
            cipher.finish(&mut mac);

            assert_eq!(parts, whole, "split at {split}");
            assert_eq!(mac, whole_mac, "mac with split at {split}");
        }
    }

    #[test]
    fn nonce_changes_keystream() {
        let mut cipher = Shannon::new(b"nonce key");

        let mut first = [0u8; 16];
        seal(&mut cipher, 0, &mut first);
        let mut second = [0u8; 16];
        seal(&mut cipher, 1, &mut second);
        let mut again = [0u8; 16];
        seal(&mut cipher, 0, &mut again);

        assert_ne!(first, second);
        assert_eq!(first, again);
    }

    #[test]
    fn tampering_changes_mac() {
        let key = b"mac key";
        let mut data = *b"authenticated payload";
        let mac = seal(&mut Shannon::new(key), 3, &mut data);

        data[4] ^= 0x01;
        let mut rx = Shannon::new(key);
        let received = open(&mut rx, 3, &mut data);
        assert_ne!(mac, received);
    }
}
