//! Protocol buffer messages of the access point and Connect services.
//!
//! Generated at build time from the `.proto` files next to this module:
//!
//! * `keyexchange` - client hello, AP response and client response of the
//!   Diffie-Hellman handshake
//! * `authentication` - login credentials and the welcome message
//! * `mercury` - Mercury headers and multi-get batches
//! * `pubsub` - subscription confirmations
//! * `connect` - cluster updates pushed over the relay
//!
//! All proto2 fields are optional, so serialization never fails on a field
//! left unset.

#![allow(clippy::pedantic)]

include!(concat!(env!("OUT_DIR"), "/protos/mod.rs"));
