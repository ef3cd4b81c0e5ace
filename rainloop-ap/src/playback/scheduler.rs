//! Crossfade scheduler
//!
//! Keeps exactly one rotation running. For a current unit started at `S`
//! with duration `D`, the next unit starts silently at `S + D - overlap`
//! and both units ramp over `fade` from that same instant, so their gains
//! sum to the master volume through the whole transition. When the fade
//! completes the outgoing unit is stopped and the incoming one becomes
//! current; the next start is computed from its own duration.
//!
//! All work is driven by a timer queue. Every timer carries the generation
//! it was armed in; `play`, `pause`, `stop` and a self-heal start a new
//! generation, which turns every older timer into a no-op. Release timers
//! are the exception: they are tied to a unit epoch instead, so units
//! fading out from an earlier generation still get halted.

use super::diagnostics::Diagnostics;
use super::unit::{UnitPool, UnitState};
use crate::assets::AudioAsset;
use crate::backend::PlaybackBackend;
use crate::error::Error;
use chrono::Utc;
use rainloop_common::events::{EventBus, MixerEvent};
use serde::Serialize;
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Timers due within this margin of `now` fire
const DUE_EPSILON: f64 = 1e-9;

/// Floor for the retry delay; a retry must land strictly after `now`
const MIN_RETRY_DELAY: f64 = 0.001;

/// Overlap and fade timing, immutable per engine
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CrossfadeWindow {
    pub overlap: f64,
    pub fade: f64,
    pub preload_lead: f64,
}

impl CrossfadeWindow {
    /// Overlap and fade used for a unit of `duration`.
    ///
    /// Units no longer than the overlap use half their duration as overlap,
    /// with the fade shortened to fit.
    pub fn for_duration(&self, duration: f64) -> (f64, f64) {
        if duration > self.overlap {
            (self.overlap, self.fade)
        } else {
            let overlap = duration / 2.0;
            (overlap, self.fade.min(overlap))
        }
    }

    /// Seconds from a unit's start to the start of its successor
    pub fn next_start_offset(&self, duration: f64) -> f64 {
        duration - self.for_duration(duration).0
    }

    pub fn is_clamped(&self, duration: f64) -> bool {
        duration <= self.overlap
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerPhase {
    Stopped,
    /// First unit of a rotation is fading in
    Starting,
    Looping,
}

/// Result of [`CrossfadeScheduler::play`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayOutcome {
    Started,
    AlreadyPlaying,
    /// Host refused playback; the engine stays loaded and paused
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum TimerAction {
    PrepareNext,
    BeginCrossfade,
    CompleteCrossfade { token: u64 },
    FadeInComplete { slot: usize },
    Retry,
    Release { slot: usize, epoch: u64 },
}

impl TimerAction {
    fn is_generation_gated(&self) -> bool {
        !matches!(self, TimerAction::Release { .. })
    }
}

#[derive(Debug, Clone, Copy)]
struct Timer {
    due: f64,
    seq: u64,
    generation: u64,
    action: TimerAction,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    fn cmp(&self, other: &Self) -> Ordering {
        self.due
            .total_cmp(&other.due)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

/// Min-heap of timers; ties fire in arming order
#[derive(Debug, Default)]
struct TimerQueue {
    heap: BinaryHeap<Reverse<Timer>>,
    next_seq: u64,
}

impl TimerQueue {
    fn push(&mut self, due: f64, generation: u64, action: TimerAction) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(Timer {
            due,
            seq,
            generation,
            action,
        }));
    }

    fn pop_due(&mut self, now: f64) -> Option<Timer> {
        match self.heap.peek() {
            Some(Reverse(timer)) if timer.due <= now + DUE_EPSILON => {
                self.heap.pop().map(|Reverse(t)| t)
            }
            _ => None,
        }
    }

    fn next_due(&self) -> Option<f64> {
        self.heap.peek().map(|Reverse(t)| t.due)
    }

    fn len(&self) -> usize {
        self.heap.len()
    }
}

/// A unit in the rotation and when it started
#[derive(Debug, Clone, Copy, PartialEq)]
struct Cycle {
    slot: usize,
    asset_index: usize,
    start: f64,
    duration: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Crossfade {
    incoming: Cycle,
    start: f64,
    end: f64,
    token: u64,
    begun: bool,
}

enum StartAttempt {
    Started(Cycle),
    /// Every asset in the rotation was rejected
    Exhausted,
    NoFreeUnit,
}

/// Everything the scheduler acts on, borrowed from the engine per call
pub struct Deck<'a> {
    pub pool: &'a mut UnitPool,
    pub backend: &'a mut dyn PlaybackBackend,
    pub assets: &'a [Arc<AudioAsset>],
    pub diagnostics: &'a mut Diagnostics,
    pub events: &'a EventBus,
    /// Master volume target
    pub master: f32,
}

pub struct CrossfadeScheduler {
    window: CrossfadeWindow,
    volume_ramp: f64,
    retry_delay: f64,
    phase: SchedulerPhase,
    generation: u64,
    timers: TimerQueue,
    /// Position of the next asset to start
    rotation: usize,
    current: Option<Cycle>,
    crossfade: Option<Crossfade>,
    next_start: Option<f64>,
    fade_in_end: Option<f64>,
    crossfade_tokens: u64,
    /// Backend transient resources go once every unit is idle after a stop
    release_pending: bool,
    clamp_warned: HashSet<usize>,
}

impl CrossfadeScheduler {
    pub fn new(window: CrossfadeWindow, volume_ramp: f64, retry_delay: f64) -> Self {
        Self {
            window,
            volume_ramp,
            retry_delay,
            phase: SchedulerPhase::Stopped,
            generation: 0,
            timers: TimerQueue::default(),
            rotation: 0,
            current: None,
            crossfade: None,
            next_start: None,
            fade_in_end: None,
            crossfade_tokens: 0,
            release_pending: false,
            clamp_warned: HashSet::new(),
        }
    }

    pub fn phase(&self) -> SchedulerPhase {
        self.phase
    }

    pub fn is_playing(&self) -> bool {
        self.phase != SchedulerPhase::Stopped
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Asset index of the current unit
    pub fn current_asset(&self) -> Option<usize> {
        self.current.map(|c| c.asset_index)
    }

    /// Asset index the next started unit will play
    pub fn rotation_position(&self) -> usize {
        self.rotation
    }

    /// Earliest pending timer
    pub fn next_due(&self) -> Option<f64> {
        self.timers.next_due()
    }

    /// Timers queued, stale generations included
    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    /// Start a rotation. No-op while one is running.
    pub fn play(&mut self, deck: &mut Deck<'_>) -> PlayOutcome {
        if self.is_playing() {
            debug!("play() while already playing; ignored");
            return PlayOutcome::AlreadyPlaying;
        }

        self.generation += 1;
        self.release_pending = false;
        let now = deck.backend.now();

        match self.start_fresh(deck, now) {
            StartAttempt::Started(_) => {
                self.phase = SchedulerPhase::Starting;
                info!("Playback started (generation {})", self.generation);
                PlayOutcome::Started
            }
            StartAttempt::NoFreeUnit => {
                self.phase = SchedulerPhase::Starting;
                self.arm_retry(now);
                PlayOutcome::Started
            }
            StartAttempt::Exhausted => {
                warn!("Playback rejected by host; staying paused");
                PlayOutcome::Rejected
            }
        }
    }

    /// Fade out and halt, keeping the rotation position
    pub fn pause(&mut self, deck: &mut Deck<'_>, fade: f64) {
        if !self.is_playing() {
            return;
        }
        let now = deck.backend.now();
        self.wind_down(deck, fade, now);
        info!("Playback paused (fade {:.2}s)", fade);
    }

    /// Fade out, halt, rewind the rotation and release transient resources
    pub fn stop(&mut self, deck: &mut Deck<'_>, fade: f64) {
        let now = deck.backend.now();
        let was_playing = self.is_playing();
        self.wind_down(deck, fade, now);
        self.rotation = 0;
        self.release_pending = true;
        self.release_transient_if_idle(deck);
        if was_playing {
            info!("Playback stopped (fade {:.2}s)", fade);
        }
    }

    /// Rescale active units to the new master target in `deck.master`
    pub fn retarget_volume(&mut self, deck: &mut Deck<'_>) {
        if !self.is_playing() {
            return;
        }
        let now = deck.backend.now();
        let master = deck.master;

        let Some(current) = self.current else {
            return;
        };

        if let Some(mut cf) = self.crossfade {
            if cf.begun || cf.start <= now {
                // Both ramps restart from where they are and meet the new
                // target together
                let duration = (cf.end - now).max(self.volume_ramp);
                let out_gain = deck.backend.gain_at(current.slot, now);
                let in_gain = deck.backend.gain_at(cf.incoming.slot, now);
                deck.backend
                    .ramp_gain(current.slot, out_gain, 0.0, now, duration);
                deck.backend
                    .ramp_gain(cf.incoming.slot, in_gain, master, now, duration);

                if now + duration > cf.end + DUE_EPSILON {
                    self.crossfade_tokens += 1;
                    cf.token = self.crossfade_tokens;
                    cf.end = now + duration;
                    self.timers.push(
                        cf.end,
                        self.generation,
                        TimerAction::CompleteCrossfade { token: cf.token },
                    );
                    self.crossfade = Some(cf);
                }
            } else {
                // Crossfade still ahead: smooth the current unit now and
                // re-issue both ramps against the new target
                let fade = cf.end - cf.start;
                let gain = deck.backend.gain_at(current.slot, now);
                deck.backend
                    .ramp_gain(current.slot, gain, master, now, self.volume_ramp);
                let out_from = deck.backend.gain_at(current.slot, cf.start);
                deck.backend
                    .ramp_gain(current.slot, out_from, 0.0, cf.start, fade);
                deck.backend
                    .ramp_gain(cf.incoming.slot, 0.0, master, cf.start, fade);
            }
            return;
        }

        let gain = deck.backend.gain_at(current.slot, now);
        let duration = match self.fade_in_end {
            Some(end) if end > now => (end - now).max(self.volume_ramp),
            _ => self.volume_ramp,
        };
        deck.backend
            .ramp_gain(current.slot, gain, master, now, duration);
    }

    /// Drop everything and start again from the top of the rotation
    pub fn restart(&mut self, deck: &mut Deck<'_>) {
        self.generation += 1;
        let now = deck.backend.now();
        deck.pool.reset(deck.backend);
        self.clear_rotation_state();
        self.rotation = 0;
        self.phase = SchedulerPhase::Starting;

        if !matches!(self.start_fresh(deck, now), StartAttempt::Started(_)) {
            self.arm_retry(now);
        }
    }

    /// Halt immediately, with no fade
    pub fn halt(&mut self, deck: &mut Deck<'_>) {
        self.generation += 1;
        deck.pool.reset(deck.backend);
        self.clear_rotation_state();
        self.phase = SchedulerPhase::Stopped;
    }

    /// Fire every timer due at the backend's current time
    pub fn advance(&mut self, deck: &mut Deck<'_>) {
        let now = deck.backend.now();
        while let Some(timer) = self.timers.pop_due(now) {
            if timer.action.is_generation_gated() && timer.generation != self.generation {
                trace!("Stale {:?} from generation {}", timer.action, timer.generation);
                continue;
            }
            match timer.action {
                TimerAction::PrepareNext => self.on_prepare_next(deck, now),
                TimerAction::BeginCrossfade => self.on_begin_crossfade(deck),
                TimerAction::CompleteCrossfade { token } => {
                    self.on_complete_crossfade(deck, token)
                }
                TimerAction::FadeInComplete { slot } => self.on_fade_in_complete(deck, slot),
                TimerAction::Retry => self.on_retry(deck, now),
                TimerAction::Release { slot, epoch } => {
                    if let Some(unit) = deck.pool.get_mut(slot) {
                        if unit.epoch() == epoch && unit.state() == UnitState::FadingOut {
                            unit.stop_now(deck.backend);
                            unit.release();
                        }
                    }
                    self.release_transient_if_idle(deck);
                }
            }
        }
    }

    fn release_transient_if_idle(&mut self, deck: &mut Deck<'_>) {
        if self.release_pending && !self.is_playing() && deck.pool.all_idle() {
            debug!("Releasing transient backend resources");
            deck.backend.release_transient();
            self.release_pending = false;
        }
    }

    fn clear_rotation_state(&mut self) {
        self.current = None;
        self.crossfade = None;
        self.next_start = None;
        self.fade_in_end = None;
    }

    fn arm_retry(&mut self, now: f64) {
        let delay = self.retry_delay.max(MIN_RETRY_DELAY);
        debug!("Retrying rotation in {:.3}s", delay);
        self.timers
            .push(now + delay, self.generation, TimerAction::Retry);
    }

    fn window_for(&mut self, cycle: &Cycle) -> (f64, f64) {
        if self.window.is_clamped(cycle.duration) && self.clamp_warned.insert(cycle.asset_index) {
            warn!(
                "Asset {} ({:.2}s) is shorter than the {:.2}s overlap; using {:.2}s",
                cycle.asset_index,
                cycle.duration,
                self.window.overlap,
                cycle.duration / 2.0
            );
        }
        self.window.for_duration(cycle.duration)
    }

    /// Bind the next asset in rotation to a free unit, skipping assets the
    /// backend rejects
    fn start_unit(&mut self, deck: &mut Deck<'_>, at: f64, exclude: Option<usize>) -> StartAttempt {
        let count = deck.assets.len();
        let now = deck.backend.now();

        for _ in 0..count {
            let Some(slot) = deck.pool.acquire(exclude) else {
                error!(
                    "No free playback unit in pool of {} (scheduling bug)",
                    deck.pool.len()
                );
                deck.diagnostics.unit_busy += 1;
                return StartAttempt::NoFreeUnit;
            };

            let asset = Arc::clone(&deck.assets[self.rotation % count]);
            self.rotation = (self.rotation + 1) % count;

            let Some(unit) = deck.pool.get_mut(slot) else {
                return StartAttempt::NoFreeUnit;
            };

            match unit.schedule_start(deck.backend, &asset, at, 0.0) {
                Ok(()) => {
                    return StartAttempt::Started(Cycle {
                        slot,
                        asset_index: asset.index(),
                        start: unit.scheduled_start().unwrap_or(at),
                        duration: asset.duration(),
                    });
                }
                Err(e @ Error::UnitBusy { .. }) => {
                    error!("{} (scheduling bug)", e);
                    deck.diagnostics.unit_busy += 1;
                    return StartAttempt::NoFreeUnit;
                }
                Err(e) => {
                    warn!(
                        "Unit {} could not start asset {}: {}; trying next asset",
                        slot,
                        asset.index(),
                        e
                    );
                    deck.diagnostics
                        .record_failure(now, Some(slot), Some(asset.index()), e.to_string());
                    deck.events.emit_lossy(MixerEvent::UnitFailed {
                        slot: Some(slot),
                        asset_index: Some(asset.index()),
                        reason: e.to_string(),
                        timestamp: Utc::now(),
                    });
                }
            }
        }

        StartAttempt::Exhausted
    }

    /// First unit of a rotation: fade in from silence
    fn start_fresh(&mut self, deck: &mut Deck<'_>, now: f64) -> StartAttempt {
        let attempt = self.start_unit(deck, now, None);
        let StartAttempt::Started(cycle) = attempt else {
            return attempt;
        };

        let (_, fade) = self.window_for(&cycle);
        if let Some(unit) = deck.pool.get_mut(cycle.slot) {
            unit.set_state(UnitState::FadingIn);
            unit.ramp_gain(deck.backend, 0.0, deck.master, fade, cycle.start);
        }

        self.current = Some(cycle);
        self.crossfade = None;
        self.fade_in_end = Some(cycle.start + fade);
        self.timers.push(
            cycle.start + fade,
            self.generation,
            TimerAction::FadeInComplete { slot: cycle.slot },
        );
        self.announce(deck, &cycle);
        self.plan_next(deck, &cycle);
        StartAttempt::Started(cycle)
    }

    fn announce(&mut self, deck: &mut Deck<'_>, cycle: &Cycle) {
        let offset = self.window.next_start_offset(cycle.duration);
        debug!(
            "Cycle started: unit {} asset {} at {:.3}s, next start offset {:.3}s",
            cycle.slot, cycle.asset_index, cycle.start, offset
        );
        deck.diagnostics.cycles_started += 1;
        deck.events.emit_lossy(MixerEvent::CycleStarted {
            generation: self.generation,
            slot: cycle.slot,
            asset_index: cycle.asset_index,
            start_time: cycle.start,
            next_start_offset: offset,
            timestamp: Utc::now(),
        });
    }

    /// Arm the timer that prepares the successor of `cycle`
    fn plan_next(&mut self, deck: &mut Deck<'_>, cycle: &Cycle) {
        let (overlap, _) = self.window_for(cycle);
        let next_start = cycle.start + cycle.duration - overlap;
        let lead = if deck.backend.schedules_ahead() {
            self.window.preload_lead
        } else {
            0.0
        };
        self.next_start = Some(next_start);
        self.timers
            .push(next_start - lead, self.generation, TimerAction::PrepareNext);
    }

    fn on_prepare_next(&mut self, deck: &mut Deck<'_>, now: f64) {
        let Some(current) = self.current else {
            return;
        };
        if self.crossfade.is_some() {
            return;
        }
        let at = self.next_start.unwrap_or(now).max(now);
        self.begin_incoming(deck, current, at, now);
    }

    /// Start the successor at `at` with both ramps anchored there
    fn begin_incoming(&mut self, deck: &mut Deck<'_>, current: Cycle, at: f64, now: f64) {
        let incoming = match self.start_unit(deck, at, Some(current.slot)) {
            StartAttempt::Started(incoming) => incoming,
            StartAttempt::Exhausted | StartAttempt::NoFreeUnit => {
                warn!("No successor could be started for unit {}", current.slot);
                self.arm_retry(now);
                return;
            }
        };

        let (_, fade) = self.window_for(&current);
        let start = incoming.start;
        let out_from = deck.backend.gain_at(current.slot, start);
        deck.backend.ramp_gain(current.slot, out_from, 0.0, start, fade);
        deck.backend
            .ramp_gain(incoming.slot, 0.0, deck.master, start, fade);

        self.crossfade_tokens += 1;
        let token = self.crossfade_tokens;
        self.crossfade = Some(Crossfade {
            incoming,
            start,
            end: start + fade,
            token,
            begun: false,
        });
        self.announce(deck, &incoming);

        if start <= now + DUE_EPSILON {
            self.on_begin_crossfade(deck);
        } else {
            self.timers
                .push(start, self.generation, TimerAction::BeginCrossfade);
        }
        self.timers.push(
            start + fade,
            self.generation,
            TimerAction::CompleteCrossfade { token },
        );
    }

    fn on_begin_crossfade(&mut self, deck: &mut Deck<'_>) {
        let (Some(current), Some(cf)) = (self.current, self.crossfade.as_mut()) else {
            return;
        };
        if cf.begun {
            return;
        }
        cf.begun = true;
        if let Some(unit) = deck.pool.get_mut(cf.incoming.slot) {
            unit.set_state(UnitState::FadingIn);
        }
        if let Some(unit) = deck.pool.get_mut(current.slot) {
            unit.set_state(UnitState::FadingOut);
        }
        self.fade_in_end = None;
        self.phase = SchedulerPhase::Looping;
    }

    fn on_complete_crossfade(&mut self, deck: &mut Deck<'_>, token: u64) {
        match self.crossfade {
            Some(cf) if cf.token == token => {}
            _ => return,
        }
        let Some(cf) = self.crossfade.take() else {
            return;
        };

        let outgoing = self.current.map(|c| c.slot);
        if let Some(slot) = outgoing {
            if let Some(unit) = deck.pool.get_mut(slot) {
                unit.stop_now(deck.backend);
                unit.release();
            }
        }
        if let Some(unit) = deck.pool.get_mut(cf.incoming.slot) {
            unit.set_state(UnitState::Steady);
        }

        self.current = Some(cf.incoming);
        self.phase = SchedulerPhase::Looping;
        deck.diagnostics.crossfades_completed += 1;
        deck.events.emit_lossy(MixerEvent::CrossfadeCompleted {
            generation: self.generation,
            outgoing_slot: outgoing.unwrap_or(cf.incoming.slot),
            incoming_slot: cf.incoming.slot,
            timestamp: Utc::now(),
        });
        self.plan_next(deck, &cf.incoming);
    }

    fn on_fade_in_complete(&mut self, deck: &mut Deck<'_>, slot: usize) {
        if self.crossfade.is_some() || self.current.map(|c| c.slot) != Some(slot) {
            return;
        }
        if let Some(unit) = deck.pool.get_mut(slot) {
            if unit.state() == UnitState::FadingIn {
                unit.set_state(UnitState::Steady);
                self.phase = SchedulerPhase::Looping;
            }
        }
        self.fade_in_end = None;
    }

    fn on_retry(&mut self, deck: &mut Deck<'_>, now: f64) {
        if self.crossfade.is_some() {
            return;
        }

        if let Some(current) = self.current {
            let still_audible = deck
                .pool
                .get(current.slot)
                .map(|u| u.is_sounding(&*deck.backend))
                .unwrap_or(false);
            if still_audible {
                self.begin_incoming(deck, current, now, now);
                return;
            }
            if let Some(unit) = deck.pool.get_mut(current.slot) {
                unit.stop_now(deck.backend);
                unit.release();
            }
            self.clear_rotation_state();
        }

        if !matches!(self.start_fresh(deck, now), StartAttempt::Started(_)) {
            self.arm_retry(now);
        }
    }

    /// Fade every audible unit of the rotation to silence and end it
    fn wind_down(&mut self, deck: &mut Deck<'_>, fade: f64, now: f64) {
        let active: Vec<usize> = self
            .current
            .iter()
            .map(|c| c.slot)
            .chain(self.crossfade.iter().map(|cf| cf.incoming.slot))
            .collect();

        // A successor scheduled ahead but not yet heard is next in line again
        if let Some(cf) = self.crossfade.filter(|cf| cf.incoming.start > now) {
            self.rotation = cf.incoming.asset_index;
        }

        self.generation += 1;
        self.clear_rotation_state();
        self.phase = SchedulerPhase::Stopped;

        for unit in deck.pool.iter_mut() {
            if unit.state().is_free() {
                unit.release();
                continue;
            }
            // Units already fading out from an earlier pause or stop keep
            // their own release timers
            if !active.contains(&unit.slot()) {
                continue;
            }

            let not_started = unit.state() == UnitState::Scheduled
                && unit.scheduled_start().map(|s| s > now).unwrap_or(true);
            if not_started || fade <= 0.0 {
                unit.stop_now(deck.backend);
                unit.release();
                continue;
            }

            let gain = unit.gain(&*deck.backend);
            unit.ramp_gain(deck.backend, gain, 0.0, fade, now);
            unit.set_state(UnitState::FadingOut);
            self.timers.push(
                now + fade,
                self.generation,
                TimerAction::Release {
                    slot: unit.slot(),
                    epoch: unit.epoch(),
                },
            );
        }
    }
}
