//! Playback units
//!
//! A unit is a reusable slot that plays one asset at a time. The pool is
//! allocated once; units cycle idle → scheduled → fading-in → steady →
//! fading-out → stopped → idle for as long as the engine plays.

use crate::assets::AudioAsset;
use crate::backend::PlaybackBackend;
use crate::error::{Error, Result};
use serde::Serialize;
use std::sync::Arc;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    Idle,
    Scheduled,
    FadingIn,
    Steady,
    FadingOut,
    Stopped,
}

impl UnitState {
    /// May accept a new `schedule_start`
    pub fn is_free(self) -> bool {
        matches!(self, UnitState::Idle | UnitState::Stopped)
    }
}

/// Point-in-time view of a unit, for diagnostics and the API
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitSnapshot {
    pub slot: usize,
    pub state: UnitState,
    pub asset_index: Option<usize>,
    pub gain: f32,
    pub scheduled_start: Option<f64>,
}

#[derive(Debug)]
pub struct PlaybackUnit {
    slot: usize,
    state: UnitState,
    asset: Option<Arc<AudioAsset>>,
    scheduled_start: Option<f64>,
    /// Bumped on every start; release timers carry the epoch they were armed for
    epoch: u64,
}

impl PlaybackUnit {
    pub fn new(slot: usize) -> Self {
        Self {
            slot,
            state: UnitState::Idle,
            asset: None,
            scheduled_start: None,
            epoch: 0,
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn state(&self) -> UnitState {
        self.state
    }

    pub fn set_state(&mut self, state: UnitState) {
        trace!("Unit {} {:?} -> {:?}", self.slot, self.state, state);
        self.state = state;
    }

    pub fn asset(&self) -> Option<&Arc<AudioAsset>> {
        self.asset.as_ref()
    }

    pub fn scheduled_start(&self) -> Option<f64> {
        self.scheduled_start
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Bind to `asset` and start it at `at` (or immediately on backends
    /// that cannot schedule ahead).
    ///
    /// # Errors
    /// - `Error::UnitBusy` if the unit is not idle or stopped
    /// - whatever the backend reports, typically `Error::PlaybackRejected`
    pub fn schedule_start(
        &mut self,
        backend: &mut dyn PlaybackBackend,
        asset: &Arc<AudioAsset>,
        at: f64,
        initial_gain: f32,
    ) -> Result<()> {
        if !self.state.is_free() {
            return Err(Error::UnitBusy {
                slot: self.slot,
                state: self.state,
            });
        }

        let at = if backend.schedules_ahead() {
            at
        } else {
            backend.now()
        };
        backend.start(self.slot, asset, at, initial_gain)?;

        self.asset = Some(Arc::clone(asset));
        self.scheduled_start = Some(at);
        self.epoch += 1;
        self.set_state(UnitState::Scheduled);
        Ok(())
    }

    /// Monotonic gain transition beginning at `starting_at`
    pub fn ramp_gain(
        &self,
        backend: &mut dyn PlaybackBackend,
        from: f32,
        to: f32,
        over: f64,
        starting_at: f64,
    ) {
        backend.ramp_gain(self.slot, from, to, starting_at, over);
    }

    /// Silence and halt. No-op on a unit that holds nothing.
    pub fn stop_now(&mut self, backend: &mut dyn PlaybackBackend) {
        if self.state.is_free() {
            return;
        }
        backend.stop(self.slot);
        self.set_state(UnitState::Stopped);
    }

    /// Drop the asset binding and return to idle
    pub fn release(&mut self) {
        self.asset = None;
        self.scheduled_start = None;
        self.set_state(UnitState::Idle);
    }

    pub fn gain(&self, backend: &dyn PlaybackBackend) -> f32 {
        if self.state.is_free() {
            return 0.0;
        }
        backend.gain_at(self.slot, backend.now())
    }

    pub fn is_sounding(&self, backend: &dyn PlaybackBackend) -> bool {
        !self.state.is_free() && backend.is_sounding(self.slot)
    }

    pub fn snapshot(&self, backend: &dyn PlaybackBackend) -> UnitSnapshot {
        UnitSnapshot {
            slot: self.slot,
            state: self.state,
            asset_index: self.asset.as_ref().map(|a| a.index()),
            gain: self.gain(backend),
            scheduled_start: self.scheduled_start,
        }
    }
}

/// Fixed-size set of units
#[derive(Debug)]
pub struct UnitPool {
    units: Vec<PlaybackUnit>,
}

impl UnitPool {
    pub fn new(size: usize) -> Self {
        Self {
            units: (0..size).map(PlaybackUnit::new).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn get(&self, slot: usize) -> Option<&PlaybackUnit> {
        self.units.get(slot)
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut PlaybackUnit> {
        self.units.get_mut(slot)
    }

    /// First free unit other than `exclude`
    pub fn acquire(&self, exclude: Option<usize>) -> Option<usize> {
        self.units
            .iter()
            .find(|u| u.state.is_free() && Some(u.slot) != exclude)
            .map(|u| u.slot)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PlaybackUnit> {
        self.units.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PlaybackUnit> {
        self.units.iter_mut()
    }

    pub fn count_in(&self, state: UnitState) -> usize {
        self.units.iter().filter(|u| u.state == state).count()
    }

    pub fn all_idle(&self) -> bool {
        self.units.iter().all(|u| u.state == UnitState::Idle)
    }

    pub fn any_sounding(&self, backend: &dyn PlaybackBackend) -> bool {
        self.units.iter().any(|u| u.is_sounding(backend))
    }

    /// Sum of every held unit's gain right now
    pub fn gain_sum(&self, backend: &dyn PlaybackBackend) -> f32 {
        self.units.iter().map(|u| u.gain(backend)).sum()
    }

    /// Stop every unit and return it to idle
    pub fn reset(&mut self, backend: &mut dyn PlaybackBackend) {
        for unit in &mut self.units {
            unit.stop_now(backend);
            unit.release();
        }
    }

    pub fn snapshots(&self, backend: &dyn PlaybackBackend) -> Vec<UnitSnapshot> {
        self.units.iter().map(|u| u.snapshot(backend)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::PcmBuffer;
    use crate::backend::{ManualClock, PrecisionBackend};
    use rainloop_common::FadeCurve;

    fn setup() -> (Arc<ManualClock>, PrecisionBackend, Arc<AudioAsset>) {
        let clock = Arc::new(ManualClock::new());
        let backend = PrecisionBackend::headless(clock.clone(), 100, FadeCurve::Linear);
        let asset = Arc::new(AudioAsset::from_pcm("a", PcmBuffer::silence(10.0, 100)));
        (clock, backend, asset)
    }

    #[test]
    fn test_schedule_start_binds() {
        let (_clock, mut backend, asset) = setup();
        let mut unit = PlaybackUnit::new(0);

        unit.schedule_start(&mut backend, &asset, 2.0, 0.0).unwrap();
        assert_eq!(unit.state(), UnitState::Scheduled);
        assert_eq!(unit.scheduled_start(), Some(2.0));
        assert_eq!(unit.epoch(), 1);
    }

    #[test]
    fn test_busy_unit_rejects_start() {
        let (_clock, mut backend, asset) = setup();
        let mut unit = PlaybackUnit::new(1);
        unit.schedule_start(&mut backend, &asset, 0.0, 0.0).unwrap();

        let err = unit.schedule_start(&mut backend, &asset, 0.0, 0.0).unwrap_err();
        assert!(matches!(
            err,
            Error::UnitBusy {
                slot: 1,
                state: UnitState::Scheduled
            }
        ));
    }

    #[test]
    fn test_stop_now_is_idempotent() {
        let (_clock, mut backend, asset) = setup();
        let mut unit = PlaybackUnit::new(0);
        unit.stop_now(&mut backend);
        assert_eq!(unit.state(), UnitState::Idle);

        unit.schedule_start(&mut backend, &asset, 0.0, 0.5).unwrap();
        unit.stop_now(&mut backend);
        unit.stop_now(&mut backend);
        assert_eq!(unit.state(), UnitState::Stopped);
        assert_eq!(unit.gain(&backend), 0.0);

        // Stopped units are free again
        assert!(unit.schedule_start(&mut backend, &asset, 0.0, 0.5).is_ok());
    }

    #[test]
    fn test_pool_acquire_skips_busy_and_excluded() {
        let (_clock, mut backend, asset) = setup();
        let mut pool = UnitPool::new(3);
        assert_eq!(pool.acquire(None), Some(0));
        assert_eq!(pool.acquire(Some(0)), Some(1));

        pool.get_mut(0)
            .unwrap()
            .schedule_start(&mut backend, &asset, 0.0, 0.0)
            .unwrap();
        assert_eq!(pool.acquire(None), Some(1));

        pool.reset(&mut backend);
        assert!(pool.all_idle());
    }
}
