//! Event types and the EventBus
//!
//! The mixer engine publishes [`MixerEvent`] values on an [`EventBus`];
//! observers (status indicator, SSE stream, logs) subscribe independently.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// Rainloop event types
///
/// Events are broadcast via EventBus and can be serialized for SSE transmission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MixerEvent {
    /// Observable mixer state changed
    StateChanged {
        is_playing: bool,
        is_loaded: bool,
        volume: f32,
        current_track_index: usize,
        timestamp: DateTime<Utc>,
    },

    /// A new loop cycle began: a unit started (or was scheduled) for an asset
    CycleStarted {
        generation: u64,
        slot: usize,
        asset_index: usize,
        /// Engine time (seconds) at which the unit starts
        start_time: f64,
        /// Seconds from the unit's start to the start of the following unit
        next_start_offset: f64,
        timestamp: DateTime<Utc>,
    },

    /// A crossfade finished and the incoming unit is now steady
    CrossfadeCompleted {
        generation: u64,
        outgoing_slot: usize,
        incoming_slot: usize,
        timestamp: DateTime<Utc>,
    },

    /// Master volume target changed
    VolumeChanged {
        old_volume: f32,
        new_volume: f32,
        timestamp: DateTime<Utc>,
    },

    /// A steady-state failure was absorbed by the rotation
    UnitFailed {
        slot: Option<usize>,
        asset_index: Option<usize>,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// Playback claimed to be running but was silent; rotation restarted
    SelfHealed {
        generation: u64,
        timestamp: DateTime<Utc>,
    },

    /// An asset failed to load (recoverable while another asset loaded)
    AssetLoadFailed {
        locator: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl MixerEvent {
    /// SSE event name
    pub fn event_type(&self) -> &'static str {
        match self {
            MixerEvent::StateChanged { .. } => "StateChanged",
            MixerEvent::CycleStarted { .. } => "CycleStarted",
            MixerEvent::CrossfadeCompleted { .. } => "CrossfadeCompleted",
            MixerEvent::VolumeChanged { .. } => "VolumeChanged",
            MixerEvent::UnitFailed { .. } => "UnitFailed",
            MixerEvent::SelfHealed { .. } => "SelfHealed",
            MixerEvent::AssetLoadFailed { .. } => "AssetLoadFailed",
        }
    }
}

/// Central event distribution bus
///
/// Uses tokio::broadcast internally, providing:
/// - Non-blocking publish (slow subscribers don't block the engine)
/// - Multiple concurrent subscribers
/// - Lagged message detection for slow subscribers
///
/// # Examples
///
/// ```
/// use rainloop_common::events::{EventBus, MixerEvent};
///
/// let bus = EventBus::new(100);
/// let mut rx = bus.subscribe();
///
/// bus.emit_lossy(MixerEvent::SelfHealed {
///     generation: 3,
///     timestamp: chrono::Utc::now(),
/// });
///
/// assert!(matches!(rx.try_recv(), Ok(MixerEvent::SelfHealed { generation: 3, .. })));
/// ```
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MixerEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<MixerEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: MixerEvent,
    ) -> Result<usize, broadcast::error::SendError<MixerEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: MixerEvent) {
        if let Err(e) = self.tx.send(event) {
            trace!("No subscribers for {}", e.0.event_type());
        }
    }

    /// Number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
