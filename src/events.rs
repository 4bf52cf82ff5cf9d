//! Events emitted when the shared playback state changes.
//!
//! The [`ClusterMiddleware`](crate::cluster::ClusterMiddleware) turns the
//! cluster snapshots pushed over the remote channel into these events. Each
//! event fires only when its value actually changed, so a snapshot that the
//! server re-sends unchanged produces nothing.
//!
//! # Example
//!
//! ```rust
//! use spotlink::events::Event;
//!
//! fn handle_event(event: &Event) {
//!     match event {
//!         Event::TrackChanged { uri } => println!("now playing {uri:?}"),
//!         Event::PausedChanged(paused) => println!("paused: {paused}"),
//!         Event::Disconnected => println!("remote channel lost"),
//!         _ => {}
//!     }
//! }
//! ```

use std::fmt;

use crate::{cluster::RepeatMode, context::PlaybackContext};

/// Discrete change in the shared playback state.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Event {
    /// The current item changed. `None` when nothing is loaded.
    TrackChanged { uri: Option<String> },

    /// Playback was paused (`true`) or resumed (`false`).
    PausedChanged(bool),

    ShuffleChanged(bool),

    RepeatChanged(RepeatMode),

    /// The position jumped instead of advancing with the clock.
    Seeked { position_ms: i64 },

    /// Another device took over playback. `None` when no device is active.
    ActiveDeviceChanged { device_id: Option<String> },

    /// Playback now draws from another context.
    ContextChanged(Option<PlaybackContext>),

    /// The remote channel went away. Reconnect through
    /// [`RemoteConnectionProvider::connect`](crate::remote::provider::RemoteConnectionProvider::connect).
    Disconnected,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TrackChanged { uri: Some(uri) } => write!(f, "track changed to {uri}"),
            Self::TrackChanged { uri: None } => write!(f, "track cleared"),
            Self::PausedChanged(true) => write!(f, "paused"),
            Self::PausedChanged(false) => write!(f, "resumed"),
            Self::ShuffleChanged(shuffle) => write!(f, "shuffle {}", on_off(*shuffle)),
            Self::RepeatChanged(mode) => write!(f, "repeat {mode}"),
            Self::Seeked { position_ms } => write!(f, "seeked to {position_ms} ms"),
            Self::ActiveDeviceChanged {
                device_id: Some(device_id),
            } => write!(f, "active device changed to {device_id}"),
            Self::ActiveDeviceChanged { device_id: None } => write!(f, "no active device"),
            Self::ContextChanged(Some(context)) => write!(f, "context changed to {context}"),
            Self::ContextChanged(None) => write!(f, "context cleared"),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

fn on_off(value: bool) -> &'static str {
    if value {
        "on"
    } else {
        "off"
    }
}
