//! Client for Spotify's access point, Mercury and Connect relay protocols.
//!
//! The crate is layered bottom-up:
//!
//! * [`shannon`] and [`cipher`]: the Shannon stream cipher and the encrypted
//!   packet framing built on it
//! * [`handshake`]: the Diffie-Hellman key exchange with the access point
//! * [`transport`]: the TCP transport that runs the handshake and login
//! * [`mercury`]: request/response and publish/subscribe multiplexing inside
//!   the encrypted channel
//! * [`connection`]: live connections and the provider that reuses them
//! * [`remote`]: the WebSocket relay carrying Connect cluster updates and
//!   remote commands
//! * [`cluster`]: turns cluster snapshots into discrete playback [`events`]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

#[macro_use]
extern crate log;

pub mod apresolve;
pub mod cipher;
pub mod clock;
pub mod cluster;
pub mod config;
pub mod connection;
pub mod context;
pub mod credentials;
pub mod error;
pub mod events;
pub mod handshake;
pub mod http;
pub mod mercury;
pub mod packet;
pub mod protocol;
pub mod remote;
pub mod shannon;
pub mod signal;
pub mod token;
pub mod transport;
pub mod uuid;

#[cfg(test)]
mod testing;
