use std::{fmt::Write, time::Duration};

use sha1::{Digest, Sha1};
use url::Url;

use crate::error::{Error, Result};

/// Resolver that hands out access point, relay and API hosts.
pub const APRESOLVE_URL: &str = "https://apresolve.spotify.com/";

/// Client id presented to the token service.
pub const KEYMASTER_CLIENT_ID: &str = "65b708073fc0480ea92a077233ca87bd";

/// Scopes requested for the relay bearer token.
pub const DEFAULT_SCOPES: &[&str] = &[
    "streaming",
    "user-read-playback-state",
    "user-modify-playback-state",
    "user-read-currently-playing",
    "user-read-private",
];

/// Version number reported in the client hello.
pub const BUILD_VERSION: u64 = 124_200_290;

/// Modulus of the RSA key the access point signs its key exchange with.
const AP_SIGNING_MODULUS: [u8; 256] = [
    0xac, 0xe0, 0x46, 0x0b, 0xff, 0xc2, 0x30, 0xaf, 0xf4, 0x6b, 0xfe, 0xc3, 0xbf, 0xbf, 0x86, 0x3d,
    0xa1, 0x91, 0xc6, 0xcc, 0x33, 0x6c, 0x93, 0xa1, 0x4f, 0xb3, 0xb0, 0x16, 0x12, 0xac, 0xac, 0x6a,
    0xf1, 0x80, 0xe7, 0xf6, 0x14, 0xd9, 0x42, 0x9d, 0xbe, 0x2e, 0x34, 0x66, 0x43, 0xe3, 0x62, 0xd2,
    0x32, 0x7a, 0x1a, 0x0d, 0x92, 0x3b, 0xae, 0xdd, 0x14, 0x02, 0xb1, 0x81, 0x55, 0x05, 0x61, 0x04,
    0xd5, 0x2c, 0x96, 0xa4, 0x4c, 0x1e, 0xcc, 0x02, 0x4a, 0xd4, 0xb2, 0x0c, 0x00, 0x1f, 0x17, 0xed,
    0xc2, 0x2f, 0xc4, 0x35, 0x21, 0xc8, 0xf0, 0xcb, 0xae, 0xd2, 0xad, 0xd7, 0x2b, 0x0f, 0x9d, 0xb3,
    0xc5, 0x32, 0x1a, 0x2a, 0xfe, 0x59, 0xf3, 0x5a, 0x0d, 0xac, 0x68, 0xf1, 0xfa, 0x62, 0x1e, 0xfb,
    0x2c, 0x8d, 0x0c, 0xb7, 0x39, 0x2d, 0x92, 0x47, 0xe3, 0xd7, 0x35, 0x1a, 0x6d, 0xbd, 0x24, 0xc2,
    0xae, 0x25, 0x5b, 0x88, 0xff, 0xab, 0x73, 0x29, 0x8a, 0x0b, 0xcc, 0xcd, 0x0c, 0x58, 0x67, 0x31,
    0x89, 0xe8, 0xbd, 0x34, 0x80, 0x78, 0x4a, 0x5f, 0xc9, 0x6b, 0x89, 0x9d, 0x95, 0x6b, 0xfc, 0x86,
    0xd7, 0x4f, 0x33, 0xa6, 0x78, 0x17, 0x96, 0xc9, 0xc3, 0x2d, 0x0d, 0x32, 0xa5, 0xab, 0xcd, 0x05,
    0x27, 0xe2, 0xf7, 0x10, 0xa3, 0x96, 0x13, 0xc4, 0x2f, 0x99, 0xc0, 0x27, 0xbf, 0xed, 0x04, 0x9c,
    0x3c, 0x27, 0x58, 0x04, 0xb6, 0xb2, 0x19, 0xf9, 0xc1, 0x2f, 0x02, 0xe9, 0x48, 0x63, 0xec, 0xa1,
    0xb6, 0x42, 0xa0, 0x9d, 0x48, 0x25, 0xf8, 0xb3, 0x9d, 0xd0, 0xe8, 0x6a, 0xf9, 0x48, 0x4d, 0xa1,
    0xc2, 0xba, 0x86, 0x30, 0x42, 0xea, 0x9d, 0xb3, 0x08, 0x6c, 0x19, 0x0e, 0x48, 0xb3, 0x9d, 0x66,
    0xeb, 0x00, 0x06, 0xa2, 0x5a, 0xee, 0xa1, 0x1b, 0x13, 0x87, 0x3c, 0xd7, 0x19, 0xe6, 0x55, 0xbd,
];

/// Public exponent of the access point signing key.
const AP_SIGNING_EXPONENT: u32 = 65_537;

/// RSA public key of the access point.
///
/// The handshake verifies the signature the access point puts over its
/// Diffie-Hellman public value against this key. A server that cannot
/// produce it does not get past the key exchange.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ServerKey {
    /// Big-endian modulus.
    pub modulus: Vec<u8>,

    /// Public exponent.
    pub exponent: u32,
}

impl ServerKey {
    #[must_use]
    pub fn new(modulus: Vec<u8>, exponent: u32) -> Self {
        Self { modulus, exponent }
    }

    /// The key production access points sign with.
    #[must_use]
    pub fn access_point() -> Self {
        Self::new(AP_SIGNING_MODULUS.to_vec(), AP_SIGNING_EXPONENT)
    }
}

impl Default for ServerKey {
    fn default() -> Self {
        Self::access_point()
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Config {
    pub app_name: String,
    pub app_version: String,

    pub device_name: String,

    /// 40 hex characters, stable per machine.
    pub device_id: String,

    pub user_agent: String,

    pub client_id: String,
    pub token_scopes: Vec<String>,

    pub apresolve_url: Url,

    /// Use `wss` for the relay; plain `ws` is only useful against local
    /// test servers.
    pub secure: bool,

    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub request_timeout: Duration,
    pub ping_interval: Duration,

    /// Key that verifies the access point during the handshake.
    pub ap_signing_key: ServerKey,
}

impl Config {
    pub fn new() -> Result<Self> {
        let app_name = env!("CARGO_PKG_NAME").to_owned();
        let app_version = env!("CARGO_PKG_VERSION").to_owned();

        let device_id = match machine_uid::get() {
            Ok(machine_id) => hex(&Sha1::digest(machine_id.as_bytes())),
            Err(e) => {
                warn!("could not get machine id, using random device id: {e}");
                let mut random = [0; 20];
                fastrand::fill(&mut random);
                hex(&random)
            }
        };
        trace!("device id: {device_id}");

        // Additional `User-Agent` string checks on top of `reqwest::HeaderValue`.
        let illegal_chars = |chr| chr == '/' || chr == ';';
        if app_name.is_empty()
            || app_name.contains(illegal_chars)
            || app_version.is_empty()
            || app_version.contains(illegal_chars)
        {
            return Err(Error::invalid_argument(format!(
                "application name and/or version invalid (\"{app_name}\"; \"{app_version}\")"
            )));
        }

        let os_name = match std::env::consts::OS {
            "macos" => "osx",
            other => other,
        };
        let os_version = sysinfo::System::os_version().unwrap_or_else(|| String::from("0"));
        if os_name.is_empty()
            || os_name.contains(illegal_chars)
            || os_version.is_empty()
            || os_version.contains(illegal_chars)
        {
            return Err(Error::invalid_argument(format!(
                "os name and/or version invalid (\"{os_name}\"; \"{os_version}\")"
            )));
        }

        let user_agent = format!("{app_name}/{app_version} (Rust; {os_name}/{os_version})");
        trace!("user agent: {user_agent}");

        Ok(Self {
            app_name,
            app_version,

            device_name: env!("CARGO_PKG_NAME").to_owned(),
            device_id,

            user_agent,

            client_id: KEYMASTER_CLIENT_ID.to_owned(),
            token_scopes: DEFAULT_SCOPES.iter().map(ToString::to_string).collect(),

            apresolve_url: Url::parse(APRESOLVE_URL)?,
            secure: true,

            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),

            ap_signing_key: ServerKey::access_point(),
        })
    }

    /// System information string sent at login.
    #[must_use]
    pub fn system_information(&self) -> String {
        format!("{}/{}", self.app_name, self.app_version)
    }
}

/// Lowercase hex encoding.
#[must_use]
pub fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
            let _ = write!(s, "{b:02x}");
            s
        })
}
