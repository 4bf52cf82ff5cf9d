//! Turns cluster snapshots into playback events.
//!
//! The relay pushes the whole shared playback state ("cluster") on every
//! change, and also re-sends it unchanged now and then. [`ClusterMiddleware`]
//! keeps the last observed value of each tracked field and emits an
//! [`Event`] only for fields whose new value differs. The diffing itself is
//! the pure function [`diff`].
//!
//! Position is not stored as a number that goes stale. It is kept as a
//! [`PositionBasis`], the position at a point in time, and extrapolated when
//! read.

use std::{
    fmt,
    sync::{Arc, Mutex},
};

use tokio::{sync::broadcast, task::JoinHandle};

use crate::{
    clock::{Clock, SystemClock},
    context::PlaybackContext,
    error::Result,
    events::Event,
    protocol::protos::connect::{Cluster, ClusterUpdate},
    remote::{RemoteConnection, RemoteEvent},
};

/// Deviation from the extrapolated position that counts as a seek.
pub const SEEK_TOLERANCE_MS: i64 = 1_500;

/// Capacity of the event channel.
const EVENT_CAPACITY: usize = 64;

/// What the player repeats once the current item ends.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum RepeatMode {
    /// Stop at the end of the context.
    #[default]
    None,

    /// Play the current track again.
    Track,

    /// Start the context over.
    Context,
}

impl fmt::Display for RepeatMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "off"),
            Self::Track => write!(f, "track"),
            Self::Context => write!(f, "context"),
        }
    }
}

/// Position at a known point in time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct PositionBasis {
    /// Position in milliseconds as of `timestamp_ms`.
    pub position_ms: i64,

    /// Milliseconds since the Unix epoch at which `position_ms` was true.
    pub timestamp_ms: i64,

    /// Length of the item, or zero when unknown.
    pub duration_ms: i64,

    /// Whether the position stands still.
    pub stopped: bool,
}

impl PositionBasis {
    /// Position at `now_ms`, never negative and never past the end.
    #[must_use]
    pub fn at(&self, now_ms: i64) -> i64 {
        let position = if self.stopped {
            self.position_ms
        } else {
            let elapsed = now_ms.saturating_sub(self.timestamp_ms).max(0);
            self.position_ms.saturating_add(elapsed)
        };

        let position = position.max(0);
        if self.duration_ms > 0 {
            position.min(self.duration_ms)
        } else {
            position
        }
    }
}

/// The fields of a cluster that are diffed.
///
/// Empty strings in the cluster map to `None`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct TrackedState {
    /// Device that currently plays, if any.
    pub active_device_id: Option<String>,

    /// URI of the current track.
    pub track_uri: Option<String>,

    /// What the current track is played from.
    pub context: Option<PlaybackContext>,

    pub paused: bool,
    pub shuffle: bool,
    pub repeat: RepeatMode,

    /// Where playback was at the time of the snapshot.
    pub position: PositionBasis,
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_owned())
}

impl TrackedState {
    /// Extracts the tracked fields from a cluster snapshot. A cluster
    /// without player state yields nothing but the active device.
    #[must_use]
    pub fn from_cluster(cluster: &Cluster) -> Self {
        let active_device_id = non_empty(&cluster.active_device_id);

        let Some(player) = cluster.player_state.as_ref() else {
            return Self {
                active_device_id,
                ..Self::default()
            };
        };

        let options = player.options.as_ref();
        let repeat = match options {
            Some(options) if options.repeating_track => RepeatMode::Track,
            Some(options) if options.repeating_context => RepeatMode::Context,
            _ => RepeatMode::None,
        };

        Self {
            active_device_id,
            track_uri: player
                .track
                .as_ref()
                .and_then(|track| non_empty(&track.uri)),
            context: non_empty(&player.context_uri).map(|uri| PlaybackContext::classify(&uri)),
            paused: player.is_paused,
            shuffle: options.is_some_and(|options| options.shuffling_context),
            repeat,
            position: PositionBasis {
                position_ms: player.position_as_of_timestamp,
                timestamp_ms: player.timestamp,
                duration_ms: player.duration,
                stopped: player.is_paused || !player.is_playing,
            },
        }
    }
}

/// Events that take `previous` to `next`, in a fixed order.
#[must_use]
pub fn diff(previous: &TrackedState, next: &TrackedState) -> Vec<Event> {
    let mut events = Vec::new();

    if previous.active_device_id != next.active_device_id {
        events.push(Event::ActiveDeviceChanged {
            device_id: next.active_device_id.clone(),
        });
    }

    if previous.context != next.context {
        events.push(Event::ContextChanged(next.context.clone()));
    }

    let same_track = previous.track_uri == next.track_uri;
    if !same_track {
        events.push(Event::TrackChanged {
            uri: next.track_uri.clone(),
        });
    }

    if previous.paused != next.paused {
        events.push(Event::PausedChanged(next.paused));
    }

    if previous.shuffle != next.shuffle {
        events.push(Event::ShuffleChanged(next.shuffle));
    }

    if previous.repeat != next.repeat {
        events.push(Event::RepeatChanged(next.repeat));
    }

    if same_track && next.track_uri.is_some() && previous.position != next.position {
        let at = next.position.timestamp_ms;
        let expected = previous.position.at(at);
        let actual = next.position.at(at);
        if (actual - expected).abs() > SEEK_TOLERANCE_MS {
            events.push(Event::Seeked {
                position_ms: actual,
            });
        }
    }

    events
}

/// Follows cluster updates and publishes what changed.
///
/// The clock is only consulted by [`position_ms`](Self::position_ms), so
/// tests can drive extrapolation with a
/// [`ManualClock`](crate::clock::ManualClock).
pub struct ClusterMiddleware<C = SystemClock> {
    clock: C,
    state: Mutex<TrackedState>,
    events: broadcast::Sender<Event>,
}

impl<C> fmt::Debug for ClusterMiddleware<C>
where
    C: Clock,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterMiddleware")
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl Default for ClusterMiddleware<SystemClock> {
    fn default() -> Self {
        Self::new(SystemClock)
    }
}

impl<C> ClusterMiddleware<C>
where
    C: Clock + 'static,
{
    /// Starts from the empty state: the first snapshot reports every field
    /// that is set.
    #[must_use]
    pub fn new(clock: C) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            clock,
            state: Mutex::new(TrackedState::default()),
            events,
        }
    }

    /// Receives every event published from now on. Receivers that fall
    /// behind by more than the channel capacity lose the oldest events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Last observed state.
    pub fn state(&self) -> Result<TrackedState> {
        Ok(self.state.lock()?.clone())
    }

    /// Current position, extrapolated from the last snapshot.
    pub fn position_ms(&self) -> Result<i64> {
        Ok(self.state.lock()?.position.at(self.clock.now_ms()))
    }

    /// Diffs `update` against the last snapshot, makes it the new baseline
    /// and publishes the resulting events.
    pub fn apply(&self, update: &ClusterUpdate) -> Result<Vec<Event>> {
        let Some(cluster) = update.cluster.as_ref() else {
            trace!("ignoring cluster update without cluster");
            return Ok(Vec::new());
        };

        let next = TrackedState::from_cluster(cluster);
        let events = {
            let mut state = self.state.lock()?;
            let events = diff(&state, &next);
            *state = next;
            events
        };

        for event in &events {
            debug!("{event}");
            let _ = self.events.send(event.clone());
        }
        Ok(events)
    }

    /// Publishes [`Event::Disconnected`]. The baseline is kept, so a
    /// reconnect that delivers the same state reports nothing.
    pub fn disconnected(&self) {
        info!("remote disconnected");
        let _ = self.events.send(Event::Disconnected);
    }

    /// Applies cluster updates from `remote` until it disconnects.
    pub async fn run(&self, mut remote: broadcast::Receiver<RemoteEvent>) {
        loop {
            match remote.recv().await {
                Ok(RemoteEvent::Cluster(update)) => {
                    if let Err(e) = self.apply(&update) {
                        error!("failed applying cluster update: {e}");
                    }
                }
                Ok(RemoteEvent::Disconnected) | Err(broadcast::error::RecvError::Closed) => {
                    self.disconnected();
                    break;
                }
                Ok(RemoteEvent::ConnectionId(_) | RemoteEvent::Command(_)) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("missed {skipped} remote events");
                }
            }
        }
    }

    /// Spawns [`run`](Self::run) on the events of `remote`.
    pub fn spawn(self: &Arc<Self>, remote: &RemoteConnection) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let events = remote.subscribe();
        tokio::spawn(async move { this.run(events).await })
    }
}
