//! Element-pool backend
//!
//! Each asset gets a small pool of [`MediaElement`]s, self-contained players
//! with a play/pause switch and one volume value. Elements start the moment
//! they are asked to and their volume is read once per output block, so
//! ramps are approximated by writing quantized steps from
//! [`PlaybackBackend::service`]. Both sides of a crossfade are written from
//! the same step index in the same pass, keeping their sum level.

use super::clock::{Clock, SystemClock};
use super::{BackendKind, PlaybackBackend};
use crate::assets::AudioAsset;
use crate::audio::output::{monitored, OutputHealth, OutputRequest, OutputStream, RenderFn};
use crate::audio::{AudioFrame, PcmBuffer};
use crate::error::{Error, Result};
use rainloop_common::FadeCurve;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// Keeps step edges from landing just short of an integer
const STEP_EPSILON: f64 = 1e-9;

/// Self-contained player for one decoded buffer
#[derive(Debug)]
pub struct MediaElement {
    pcm: Arc<PcmBuffer>,
    playing: AtomicBool,
    cursor: AtomicUsize,
    volume: AtomicU32,
    started_at: AtomicU64,
    /// Output callbacks seen before the last `play`
    callbacks_at_play: AtomicU64,
    /// Set once the cursor has moved since the last `play`
    advanced: AtomicBool,
}

impl MediaElement {
    pub fn new(pcm: Arc<PcmBuffer>) -> Self {
        Self {
            pcm,
            playing: AtomicBool::new(false),
            cursor: AtomicUsize::new(0),
            volume: AtomicU32::new(0f32.to_bits()),
            started_at: AtomicU64::new(0f64.to_bits()),
            callbacks_at_play: AtomicU64::new(0),
            advanced: AtomicBool::new(false),
        }
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Acquire)
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Acquire))
    }

    pub fn set_volume(&self, volume: f32) {
        self.volume
            .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Release);
    }

    /// Rewind and start playing; `now` is recorded as the start time and
    /// `callbacks` as the output callback count at that moment
    pub fn play(&self, now: f64, callbacks: u64) {
        self.cursor.store(0, Ordering::Release);
        self.started_at.store(now.to_bits(), Ordering::Release);
        self.callbacks_at_play.store(callbacks, Ordering::Release);
        self.advanced.store(false, Ordering::Release);
        self.playing.store(true, Ordering::Release);
    }

    /// Stop and rewind
    pub fn halt(&self) {
        self.playing.store(false, Ordering::Release);
        self.cursor.store(0, Ordering::Release);
        self.set_volume(0.0);
    }

    /// Still inside its recording at `now`.
    ///
    /// On a monitored output the element must also be advancing: once a full
    /// callback has run since `play` without moving the cursor, nothing is
    /// coming out of it.
    fn is_audible_at(&self, now: f64, health: &OutputHealth) -> bool {
        let started = f64::from_bits(self.started_at.load(Ordering::Acquire));
        if !self.is_playing() || now - started >= self.pcm.duration_seconds() {
            return false;
        }
        if health.is_monitored() && !self.advanced.load(Ordering::Acquire) {
            // The callback in flight at `play` may have passed this element
            let since = health
                .callback_count()
                .saturating_sub(self.callbacks_at_play.load(Ordering::Acquire));
            return since <= 1;
        }
        true
    }

    /// Mix one output block. Volume is sampled once for the whole block.
    fn mix_block(&self, out: &mut [AudioFrame]) {
        if !self.is_playing() {
            return;
        }
        let volume = self.volume();
        let mut cursor = self.cursor.load(Ordering::Acquire);
        for frame in out.iter_mut() {
            match self.pcm.frame(cursor) {
                Some(sample) => frame.add_scaled(sample, volume),
                None => {
                    self.playing.store(false, Ordering::Release);
                    break;
                }
            }
            cursor += 1;
        }
        self.cursor.store(cursor, Ordering::Release);
        self.advanced.store(true, Ordering::Release);
    }
}

/// A ramp written as quantized steps
#[derive(Debug, Clone, Copy)]
struct SteppedRamp {
    from: f32,
    to: f32,
    start: f64,
    duration: f64,
}

impl SteppedRamp {
    fn progress(&self, now: f64) -> f64 {
        if self.duration <= 0.0 {
            return 1.0;
        }
        ((now - self.start) / self.duration).clamp(0.0, 1.0)
    }

    fn value_at(&self, now: f64, steps: u32, curve: FadeCurve) -> f32 {
        if now < self.start {
            return self.from;
        }
        let stepped = FadeCurve::quantize(self.progress(now) + STEP_EPSILON, steps);
        curve.interpolate(self.from as f64, self.to as f64, stepped) as f32
    }

    fn is_done(&self, now: f64) -> bool {
        now >= self.start + self.duration
    }

    /// Time of the next step edge after `now`
    fn next_edge(&self, now: f64, steps: u32) -> f64 {
        if now < self.start {
            return self.start;
        }
        let steps = steps.max(1) as f64;
        let taken = (self.progress(now) * steps + STEP_EPSILON).floor();
        self.start + self.duration * ((taken + 1.0) / steps).min(1.0)
    }
}

type Registry = Arc<Mutex<Vec<Arc<MediaElement>>>>;

fn lock(registry: &Registry) -> MutexGuard<'_, Vec<Arc<MediaElement>>> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn renderer(registry: Registry) -> RenderFn {
    Box::new(move |out: &mut [AudioFrame]| {
        for element in lock(&registry).iter() {
            element.mix_block(out);
        }
    })
}

pub struct CoarseBackend {
    clock: Arc<dyn Clock>,
    sample_rate: u32,
    curve: FadeCurve,
    steps: u32,
    elements_per_asset: usize,
    pools: HashMap<usize, Vec<Arc<MediaElement>>>,
    registry: Registry,
    bindings: HashMap<usize, Arc<MediaElement>>,
    ramps: HashMap<usize, SteppedRamp>,
    health: Arc<OutputHealth>,
    output: Option<(OutputRequest, Option<OutputStream>)>,
}

impl CoarseBackend {
    /// Open the default (or named) device with whatever format it offers.
    pub fn open(
        device_name: Option<String>,
        preferred_rate: u32,
        curve: FadeCurve,
        steps: u32,
        elements_per_asset: usize,
    ) -> Result<Self> {
        let request = OutputRequest {
            device_name,
            require_f32: false,
            preferred_rate,
        };
        let registry: Registry = Arc::new(Mutex::new(Vec::new()));
        let health = OutputHealth::new();
        let stream = OutputStream::spawn(
            request.clone(),
            Arc::clone(&health),
            renderer(Arc::clone(&registry)),
        )?;
        let sample_rate = stream.sample_rate();
        info!(
            "Coarse backend on '{}' at {}Hz ({} gain steps)",
            stream.device_name(),
            sample_rate,
            steps
        );

        Ok(Self {
            clock: Arc::new(SystemClock::new()),
            sample_rate,
            curve,
            steps,
            elements_per_asset,
            pools: HashMap::new(),
            registry,
            bindings: HashMap::new(),
            ramps: HashMap::new(),
            health,
            output: Some((request, Some(stream))),
        })
    }

    /// Backend without an output device, driven by `clock`
    pub fn headless(
        clock: Arc<dyn Clock>,
        sample_rate: u32,
        curve: FadeCurve,
        steps: u32,
        elements_per_asset: usize,
    ) -> Self {
        Self {
            sample_rate,
            curve,
            steps,
            elements_per_asset,
            pools: HashMap::new(),
            registry: Arc::new(Mutex::new(Vec::new())),
            bindings: HashMap::new(),
            ramps: HashMap::new(),
            health: OutputHealth::with_clock(Arc::clone(&clock)),
            clock,
            output: None,
        }
    }

    /// Render callback for driving a headless backend by hand; calls are
    /// recorded on the output health like device callbacks
    pub fn offline_renderer(&self) -> RenderFn {
        monitored(&self.health, renderer(Arc::clone(&self.registry)))
    }

    /// Elements available for an asset
    pub fn pool_len(&self, asset_index: usize) -> usize {
        self.pools.get(&asset_index).map(Vec::len).unwrap_or(0)
    }

    fn is_bound(&self, element: &Arc<MediaElement>) -> bool {
        self.bindings.values().any(|b| Arc::ptr_eq(b, element))
    }

    fn write_ramp(&self, slot: usize, now: f64) {
        if let (Some(ramp), Some(element)) = (self.ramps.get(&slot), self.bindings.get(&slot)) {
            element.set_volume(ramp.value_at(now, self.steps, self.curve));
        }
    }
}

impl PlaybackBackend for CoarseBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Coarse
    }

    fn now(&self) -> f64 {
        self.clock.now()
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn schedules_ahead(&self) -> bool {
        false
    }

    fn register_asset(&mut self, asset: &Arc<AudioAsset>) -> Result<()> {
        let pool: Vec<Arc<MediaElement>> = (0..self.elements_per_asset)
            .map(|_| Arc::new(MediaElement::new(Arc::clone(asset.pcm()))))
            .collect();
        lock(&self.registry).extend(pool.iter().cloned());
        debug!(
            "Created {} elements for asset {}",
            pool.len(),
            asset.index()
        );
        self.pools.insert(asset.index(), pool);
        Ok(())
    }

    fn start(&mut self, slot: usize, asset: &Arc<AudioAsset>, _at: f64, gain: f32) -> Result<()> {
        if self.health.is_blocked() {
            if let Some((_, Some(stream))) = self.output.as_ref() {
                stream.request_resume();
            }
            return Err(Error::PlaybackRejected(
                "host refused to start audio output".to_string(),
            ));
        }

        let pool = self.pools.get(&asset.index()).ok_or_else(|| {
            Error::PlaybackRejected(format!("asset {} has no elements", asset.index()))
        })?;
        let element = pool
            .iter()
            .find(|e| !e.is_playing() && !self.is_bound(e))
            .cloned()
            .ok_or_else(|| {
                Error::PlaybackRejected(format!(
                    "all {} elements of asset {} are busy",
                    pool.len(),
                    asset.index()
                ))
            })?;

        if let Some(previous) = self.bindings.remove(&slot) {
            previous.halt();
        }
        element.set_volume(gain);
        element.play(self.clock.now(), self.health.callback_count());
        self.bindings.insert(slot, element);
        self.ramps.remove(&slot);
        Ok(())
    }

    fn ramp_gain(&mut self, slot: usize, from: f32, to: f32, start_at: f64, duration: f64) {
        if !self.bindings.contains_key(&slot) {
            return;
        }
        self.ramps.insert(
            slot,
            SteppedRamp {
                from,
                to,
                start: start_at,
                duration: duration.max(0.0),
            },
        );
        self.write_ramp(slot, self.clock.now());
    }

    fn gain_at(&self, slot: usize, _t: f64) -> f32 {
        self.bindings.get(&slot).map(|e| e.volume()).unwrap_or(0.0)
    }

    fn is_sounding(&self, slot: usize) -> bool {
        if self.health.is_silent() {
            return false;
        }
        let now = self.clock.now();
        self.bindings
            .get(&slot)
            .map(|e| e.is_audible_at(now, &self.health))
            .unwrap_or(false)
    }

    fn stop(&mut self, slot: usize) {
        if let Some(element) = self.bindings.remove(&slot) {
            element.halt();
        }
        self.ramps.remove(&slot);
    }

    fn service(&mut self, now: f64) {
        // One pass writes every ramp from the same clock reading
        for slot in self.ramps.keys().copied().collect::<Vec<_>>() {
            self.write_ramp(slot, now);
        }
        self.ramps.retain(|_, ramp| !ramp.is_done(now));
    }

    fn next_wakeup(&self) -> Option<f64> {
        let now = self.clock.now();
        self.ramps
            .values()
            .map(|ramp| ramp.next_edge(now, self.steps))
            .min_by(|a, b| a.total_cmp(b))
    }

    fn release_transient(&mut self) {
        self.bindings.clear();
        self.ramps.clear();
        for element in lock(&self.registry).iter() {
            element.halt();
        }
    }

    fn recover(&mut self) -> Result<()> {
        if let Some((request, stream)) = self.output.as_mut() {
            info!("Reopening audio output");
            if let Some(mut old) = stream.take() {
                old.close();
            }
            *stream = Some(OutputStream::spawn(
                request.clone(),
                Arc::clone(&self.health),
                renderer(Arc::clone(&self.registry)),
            )?);
        }
        self.health.clear();
        Ok(())
    }

    fn health(&self) -> Arc<OutputHealth> {
        Arc::clone(&self.health)
    }

    fn shutdown(&mut self) {
        self.release_transient();
        if let Some((_, stream)) = self.output.as_mut() {
            if let Some(mut stream) = stream.take() {
                stream.close();
            }
        }
    }
}
