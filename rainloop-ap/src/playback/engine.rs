//! Mixer engine
//!
//! Owns the backend, the loaded assets, the unit pool and the scheduler,
//! and is the single writer of [`MixerState`]. Nothing here blocks: time
//! only moves forward through [`MixerEngine::advance`], which the service
//! loop calls on every tick (tests call it directly with a manual clock).

use super::diagnostics::Diagnostics;
use super::scheduler::{CrossfadeScheduler, Deck, PlayOutcome, SchedulerPhase};
use super::unit::{UnitPool, UnitSnapshot};
use super::visibility::{GuardAction, HostVisibility, VisibilityGuard};
use crate::assets::{AssetStore, AudioAsset};
use crate::backend::{BackendKind, PlaybackBackend};
use crate::config::EngineConfig;
use crate::error::{Error, LoadError, Result};
use chrono::Utc;
use rainloop_common::events::{EventBus, MixerEvent};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

/// Event bus capacity
const EVENT_CAPACITY: usize = 256;

/// Observable engine state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MixerState {
    pub is_playing: bool,
    pub is_loaded: bool,
    /// Smoothed master level, 0.0-1.0
    pub volume: f32,
    pub current_track_index: usize,
}

/// Full diagnostics view for the API
#[derive(Debug, Clone, Serialize)]
pub struct EngineReport {
    pub backend: BackendKind,
    pub phase: SchedulerPhase,
    pub generation: u64,
    pub target_volume: f32,
    pub assets: Vec<String>,
    pub units: Vec<UnitSnapshot>,
    pub diagnostics: Diagnostics,
}

/// Master level with a linear smoothing ramp towards `target`
#[derive(Debug, Clone, Copy)]
struct MasterVolume {
    from: f32,
    target: f32,
    start: f64,
    duration: f64,
}

impl MasterVolume {
    fn new(level: f32) -> Self {
        Self {
            from: level,
            target: level,
            start: 0.0,
            duration: 0.0,
        }
    }

    fn value_at(&self, now: f64) -> f32 {
        if self.duration <= 0.0 || now >= self.start + self.duration {
            return self.target;
        }
        let progress = ((now - self.start) / self.duration).clamp(0.0, 1.0) as f32;
        self.from + (self.target - self.from) * progress
    }

    fn retarget(&mut self, now: f64, target: f32, duration: f64) {
        self.from = self.value_at(now);
        self.target = target;
        self.start = now;
        self.duration = duration;
    }
}

/// Parts the scheduler operates on
struct Rig {
    pool: UnitPool,
    backend: Box<dyn PlaybackBackend>,
    store: AssetStore,
    diagnostics: Diagnostics,
    events: EventBus,
}

impl Rig {
    fn deck(&mut self, master: f32) -> Deck<'_> {
        Deck {
            pool: &mut self.pool,
            backend: self.backend.as_mut(),
            assets: self.store.assets(),
            diagnostics: &mut self.diagnostics,
            events: &self.events,
            master,
        }
    }
}

pub struct MixerEngine {
    config: EngineConfig,
    rig: Rig,
    scheduler: CrossfadeScheduler,
    master: MasterVolume,
    guard: VisibilityGuard,
    state_tx: watch::Sender<MixerState>,
    last_track: usize,
    shut_down: bool,
}

impl MixerEngine {
    /// Load every configured source and build the engine.
    ///
    /// # Errors
    /// - `Error::Config` for invalid settings
    /// - `Error::NoPlayableAssets` when no source loads
    pub async fn initialize(config: EngineConfig, mut backend: Box<dyn PlaybackBackend>) -> Result<Self> {
        config.validate()?;
        let store = AssetStore::load(&config.sources, backend.as_mut()).await?;
        Ok(Self::assemble(config, backend, store))
    }

    /// Build the engine around already-decoded assets.
    pub fn with_assets(
        config: EngineConfig,
        mut backend: Box<dyn PlaybackBackend>,
        assets: Vec<AudioAsset>,
    ) -> Result<Self> {
        config.validate()?;
        let store = AssetStore::from_assets(assets, backend.as_mut())?;
        if store.is_empty() {
            return Err(Error::NoPlayableAssets {
                failures: store.failures().to_vec(),
            });
        }
        Ok(Self::assemble(config, backend, store))
    }

    fn assemble(config: EngineConfig, backend: Box<dyn PlaybackBackend>, store: AssetStore) -> Self {
        let events = EventBus::new(EVENT_CAPACITY);
        let diagnostics = Diagnostics {
            load_failures: store.failures().to_vec(),
            ..Default::default()
        };
        for failure in store.failures() {
            events.emit_lossy(MixerEvent::AssetLoadFailed {
                locator: failure.locator.clone(),
                reason: failure.reason.clone(),
                timestamp: Utc::now(),
            });
        }

        let initial = MixerState {
            is_playing: false,
            is_loaded: true,
            volume: config.master_volume,
            current_track_index: 0,
        };
        let (state_tx, _) = watch::channel(initial);

        info!(
            "Mixer engine ready: {} assets, {} units, {:?} backend",
            store.len(),
            config.pool_size,
            backend.kind()
        );

        Self {
            scheduler: CrossfadeScheduler::new(config.window(), config.volume_ramp, config.retry_delay),
            master: MasterVolume::new(config.master_volume),
            guard: VisibilityGuard::new(),
            rig: Rig {
                pool: UnitPool::new(config.pool_size),
                backend,
                store,
                diagnostics,
                events,
            },
            config,
            state_tx,
            last_track: 0,
            shut_down: false,
        }
    }

    /// Start the rotation. Idempotent while playing.
    pub fn play(&mut self) -> PlayOutcome {
        if self.shut_down {
            return PlayOutcome::Rejected;
        }
        let outcome = {
            let mut deck = self.rig.deck(self.master.target);
            self.scheduler.play(&mut deck)
        };
        self.publish_state();
        outcome
    }

    /// Fade out over the pause fade; the next `play` resumes with the next
    /// asset in rotation
    pub fn pause(&mut self) {
        if self.shut_down {
            return;
        }
        let fade = self.config.pause_fade;
        {
            let mut deck = self.rig.deck(self.master.target);
            self.scheduler.pause(&mut deck, fade);
        }
        self.publish_state();
    }

    /// Fade out over the stop fade and rewind the rotation
    pub fn stop(&mut self) {
        if self.shut_down {
            return;
        }
        let fade = self.config.effective_stop_fade();
        {
            let mut deck = self.rig.deck(self.master.target);
            self.scheduler.stop(&mut deck, fade);
        }
        self.last_track = 0;
        self.publish_state();
    }

    /// Change the master volume target with a smoothing ramp
    pub fn set_volume(&mut self, volume: f32) {
        if self.shut_down {
            return;
        }
        if !volume.is_finite() {
            warn!("Ignoring non-finite volume {}", volume);
            return;
        }
        let volume = volume.clamp(0.0, 1.0);
        let old = self.master.target;
        if (volume - old).abs() < f32::EPSILON {
            return;
        }

        let now = self.now();
        self.master.retarget(now, volume, self.config.volume_ramp);
        {
            let mut deck = self.rig.deck(volume);
            self.scheduler.retarget_volume(&mut deck);
        }

        debug!("Volume {:.3} -> {:.3}", old, volume);
        self.rig.events.emit_lossy(MixerEvent::VolumeChanged {
            old_volume: old,
            new_volume: volume,
            timestamp: Utc::now(),
        });
        self.publish_state();
    }

    /// Requested master volume (the reported level follows it smoothly)
    pub fn target_volume(&self) -> f32 {
        self.master.target
    }

    /// Host visibility changed
    pub fn notify_visibility(&mut self, visibility: HostVisibility) {
        if self.shut_down {
            return;
        }
        let now = self.now();
        let is_playing = self.scheduler.is_playing();
        let pool = &self.rig.pool;
        let backend = self.rig.backend.as_ref();
        let action = self
            .guard
            .on_change(visibility, now, is_playing, || pool.any_sounding(backend));

        if action == GuardAction::SelfHeal {
            if let Err(e) = self.rig.backend.recover() {
                warn!("Output recovery failed: {}", e);
            }
            {
                let mut deck = self.rig.deck(self.master.target);
                self.scheduler.restart(&mut deck);
            }
            self.rig.diagnostics.self_heals += 1;
            self.rig.events.emit_lossy(MixerEvent::SelfHealed {
                generation: self.scheduler.generation(),
                timestamp: Utc::now(),
            });
            self.publish_state();
        }
    }

    /// Process everything due at the backend's current time
    pub fn advance(&mut self) {
        if self.shut_down {
            return;
        }
        let now = self.now();
        self.rig.backend.service(now);
        {
            let mut deck = self.rig.deck(self.master.target);
            self.scheduler.advance(&mut deck);
        }
        // Ramps issued by timers get their first coarse step right away
        self.rig.backend.service(now);
        self.publish_state();
    }

    /// Earliest time `advance` has work to do
    pub fn next_deadline(&self) -> Option<f64> {
        match (self.scheduler.next_due(), self.rig.backend.next_wakeup()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn now(&self) -> f64 {
        self.rig.backend.now()
    }

    pub fn state(&self) -> MixerState {
        self.state_tx.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<MixerState> {
        self.state_tx.subscribe()
    }

    pub fn events(&self) -> EventBus {
        self.rig.events.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<MixerEvent> {
        self.rig.events.subscribe()
    }

    pub fn unit_states(&self) -> Vec<UnitSnapshot> {
        self.rig.pool.snapshots(self.rig.backend.as_ref())
    }

    /// Sum of the gains of every unit holding an asset
    pub fn active_gain_sum(&self) -> f32 {
        self.rig.pool.gain_sum(self.rig.backend.as_ref())
    }

    pub fn phase(&self) -> SchedulerPhase {
        self.scheduler.phase()
    }

    pub fn generation(&self) -> u64 {
        self.scheduler.generation()
    }

    /// Asset index the next started unit will play
    pub fn rotation_position(&self) -> usize {
        self.scheduler.rotation_position()
    }

    /// Scheduler timers still queued
    pub fn pending_timers(&self) -> usize {
        self.scheduler.pending_timers()
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.rig.backend.kind()
    }

    pub fn assets(&self) -> &[Arc<AudioAsset>] {
        self.rig.store.assets()
    }

    pub fn load_failures(&self) -> &[LoadError] {
        self.rig.store.failures()
    }

    pub fn diagnostics(&self) -> Diagnostics {
        self.rig.diagnostics.clone()
    }

    pub fn report(&self) -> EngineReport {
        EngineReport {
            backend: self.backend_kind(),
            phase: self.scheduler.phase(),
            generation: self.scheduler.generation(),
            target_volume: self.master.target,
            assets: self.rig.store.assets().iter().map(|a| a.id().to_string()).collect(),
            units: self.unit_states(),
            diagnostics: self.diagnostics(),
        }
    }

    /// Halt immediately and release the backend and decoded assets
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        info!("Shutting down mixer engine");
        {
            let mut deck = self.rig.deck(self.master.target);
            self.scheduler.halt(&mut deck);
        }
        self.rig.backend.shutdown();
        self.rig.store.clear();
        self.shut_down = true;
        self.publish_state();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    fn publish_state(&mut self) {
        let now = self.now();
        if let Some(track) = self.scheduler.current_asset() {
            self.last_track = track;
        }
        let state = MixerState {
            is_playing: self.scheduler.is_playing(),
            is_loaded: !self.shut_down && !self.rig.store.is_empty(),
            volume: self.master.value_at(now),
            current_track_index: self.last_track,
        };

        let target = self.master.target;
        let mut notable = false;
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            notable = current.is_playing != state.is_playing
                || current.is_loaded != state.is_loaded
                || current.current_track_index != state.current_track_index
                || (current.volume != state.volume && state.volume == target);
            *current = state.clone();
            true
        });

        if notable {
            self.rig.events.emit_lossy(MixerEvent::StateChanged {
                is_playing: state.is_playing,
                is_loaded: state.is_loaded,
                volume: state.volume,
                current_track_index: state.current_track_index,
                timestamp: Utc::now(),
            });
        }
    }
}
