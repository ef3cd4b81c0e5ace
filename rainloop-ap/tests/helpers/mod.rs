//! Shared fixtures for rainloop-ap integration tests
//!
//! - Headless engines on a manual clock, stepped deterministically
//! - Generated tone assets and WAV files
//! - A backend wrapper that rejects chosen assets

#![allow(dead_code)]

pub mod audio_generator;
pub mod flaky_backend;

pub use audio_generator::{tone, write_sine_wav};
pub use flaky_backend::FlakyBackend;

use rainloop_ap::assets::AudioAsset;
use rainloop_ap::audio::output::{OutputHealth, RenderFn};
use rainloop_ap::audio::AudioFrame;
use rainloop_ap::backend::{Clock, CoarseBackend, ManualClock, PlaybackBackend, PrecisionBackend};
use rainloop_ap::config::EngineConfig;
use rainloop_ap::playback::UnitState;
use rainloop_ap::MixerEngine;
use rainloop_common::events::MixerEvent;
use rainloop_common::FadeCurve;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Output rate for generated assets and headless backends
pub const RATE: u32 = 1_000;

/// Engine step used by the simulations (10ms)
pub const TICK: f64 = 0.01;

/// 2s overlap, 1.5s fade, full master volume
pub fn test_config() -> EngineConfig {
    EngineConfig {
        overlap_duration: 2.0,
        fade_duration: 1.5,
        preload_lead: 0.5,
        master_volume: 1.0,
        pause_fade: 1.0,
        stop_fade: 0.5,
        volume_ramp: 0.25,
        pool_size: 4,
        coarse_steps: 60,
        elements_per_asset: 3,
        ..Default::default()
    }
}

/// Tone assets of the given durations, named `a`, `b`, `c`...
pub fn tones(durations: &[f64]) -> Vec<AudioAsset> {
    durations
        .iter()
        .enumerate()
        .map(|(i, &seconds)| tone(&((b'a' + i as u8) as char).to_string(), seconds))
        .collect()
}

/// Engine on a headless backend whose clock the test controls.
///
/// Harnesses built with a `*_rendered` constructor also pull one block of
/// audio per step, standing in for the device callback.
pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub health: Arc<OutputHealth>,
    pub engine: MixerEngine,
    render: Option<RenderFn>,
    rendering: bool,
}

impl Harness {
    pub fn precision(config: EngineConfig, durations: &[f64]) -> Self {
        let clock = Arc::new(ManualClock::new());
        let backend = PrecisionBackend::headless(clock.clone(), RATE, config.fade_curve);
        Self::with_backend(clock, Box::new(backend), config, tones(durations))
    }

    pub fn coarse(config: EngineConfig, durations: &[f64]) -> Self {
        let clock = Arc::new(ManualClock::new());
        let backend = coarse_backend(&clock, &config);
        Self::with_backend(clock, Box::new(backend), config, tones(durations))
    }

    /// Precision engine whose output is rendered every step
    pub fn precision_rendered(config: EngineConfig, durations: &[f64]) -> Self {
        let clock = Arc::new(ManualClock::new());
        let backend = PrecisionBackend::headless(clock.clone(), RATE, config.fade_curve);
        let render = backend.offline_renderer();
        Self::with_backend(clock, Box::new(backend), config, tones(durations)).rendering_with(render)
    }

    /// Coarse engine whose output is rendered every step
    pub fn coarse_rendered(config: EngineConfig, durations: &[f64]) -> Self {
        let clock = Arc::new(ManualClock::new());
        let backend = coarse_backend(&clock, &config);
        let render = backend.offline_renderer();
        Self::with_backend(clock, Box::new(backend), config, tones(durations)).rendering_with(render)
    }

    pub fn with_backend(
        clock: Arc<ManualClock>,
        backend: Box<dyn PlaybackBackend>,
        config: EngineConfig,
        assets: Vec<AudioAsset>,
    ) -> Self {
        let health = backend.health();
        let engine = MixerEngine::with_assets(config, backend, assets).unwrap();
        Self {
            clock,
            health,
            engine,
            render: None,
            rendering: false,
        }
    }

    fn rendering_with(mut self, render: RenderFn) -> Self {
        self.render = Some(render);
        self.rendering = true;
        self
    }

    /// Stop pulling audio, as a suspended host would
    pub fn pause_rendering(&mut self) {
        self.rendering = false;
    }

    pub fn resume_rendering(&mut self) {
        self.rendering = true;
    }

    pub fn now(&self) -> f64 {
        self.clock.now()
    }

    /// Jump to `t` and process everything due
    pub fn at(&mut self, t: f64) {
        self.clock.set(t);
        self.engine.advance();
    }

    /// Step from the current time to `end` in [`TICK`] increments, calling
    /// `inspect` after every step
    pub fn run_until_with(&mut self, end: f64, mut inspect: impl FnMut(f64, &MixerEngine)) {
        let start = self.clock.now();
        let steps = ((end - start) / TICK).round().max(0.0) as u64;
        let mut block = vec![AudioFrame::zero(); (TICK * RATE as f64).round() as usize];
        for i in 1..=steps {
            let t = start + i as f64 * TICK;
            self.clock.set(t);
            self.engine.advance();
            if self.rendering {
                if let Some(render) = self.render.as_mut() {
                    block.fill(AudioFrame::zero());
                    render(&mut block);
                }
            }
            inspect(t, &self.engine);
        }
    }

    pub fn run_until(&mut self, end: f64) {
        self.run_until_with(end, |_, _| {});
    }

    pub fn count_in(&self, state: UnitState) -> usize {
        self.engine
            .unit_states()
            .iter()
            .filter(|u| u.state == state)
            .count()
    }

    pub fn all_idle(&self) -> bool {
        self.count_in(UnitState::Idle) == self.engine.unit_states().len()
    }
}

fn coarse_backend(clock: &Arc<ManualClock>, config: &EngineConfig) -> CoarseBackend {
    CoarseBackend::headless(
        clock.clone(),
        RATE,
        config.fade_curve,
        config.coarse_steps,
        config.elements_per_asset,
    )
}

/// Every event currently queued on `rx`
pub fn drain(rx: &mut broadcast::Receiver<MixerEvent>) -> Vec<MixerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// `(asset_index, start_time, next_start_offset)` of every CycleStarted
pub fn cycles(events: &[MixerEvent]) -> Vec<(usize, f64, f64)> {
    events
        .iter()
        .filter_map(|e| match e {
            MixerEvent::CycleStarted {
                asset_index,
                start_time,
                next_start_offset,
                ..
            } => Some((*asset_index, *start_time, *next_start_offset)),
            _ => None,
        })
        .collect()
}

pub fn s_curve_config() -> EngineConfig {
    EngineConfig {
        fade_curve: FadeCurve::SCurve,
        ..test_config()
    }
}
