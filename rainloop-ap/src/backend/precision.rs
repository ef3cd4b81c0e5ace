//! Sample-clock backend
//!
//! Mixes voices directly from decoded buffers inside the output callback.
//! Every voice carries a [`GainAutomation`] evaluated per sample, so a
//! crossfade scheduled seconds ahead lands on the exact frame regardless of
//! when the scheduler thread wakes up.

use super::automation::GainAutomation;
use super::clock::{Clock, SampleClock};
use super::{BackendKind, PlaybackBackend};
use crate::assets::AudioAsset;
use crate::audio::output::{monitored, OutputHealth, OutputRequest, OutputStream, RenderFn};
use crate::audio::{AudioFrame, PcmBuffer};
use crate::error::{Error, Result};
use rainloop_common::FadeCurve;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// One-shot playback of a buffer, bound to a unit slot
#[derive(Debug)]
struct Voice {
    pcm: Arc<PcmBuffer>,
    start_at: f64,
    automation: GainAutomation,
}

impl Voice {
    fn end(&self) -> f64 {
        self.start_at + self.pcm.duration_seconds()
    }

    fn mix_into(&self, frame: &mut AudioFrame, t: f64, rate: f64) {
        if t < self.start_at {
            return;
        }
        let index = ((t - self.start_at) * rate).round() as usize;
        if let Some(sample) = self.pcm.frame(index) {
            frame.add_scaled(sample, self.automation.value_at(t) as f32);
        }
    }
}

type VoiceTable = Arc<Mutex<HashMap<usize, Voice>>>;

fn lock(voices: &VoiceTable) -> MutexGuard<'_, HashMap<usize, Voice>> {
    voices.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Mix every voice into `out`, the first frame sitting at time `start`
fn mix_voices(voices: &VoiceTable, start: f64, rate: f64, out: &mut [AudioFrame]) {
    let voices = lock(voices);
    for (i, frame) in out.iter_mut().enumerate() {
        let t = start + i as f64 / rate;
        for voice in voices.values() {
            voice.mix_into(frame, t, rate);
        }
    }
}

/// Device output state kept for reopening after a host suspension
struct Device {
    request: OutputRequest,
    frames: Arc<AtomicU64>,
    rate: Arc<AtomicU32>,
    stream: Option<OutputStream>,
}

pub struct PrecisionBackend {
    clock: Arc<dyn Clock>,
    sample_rate: u32,
    curve: FadeCurve,
    voices: VoiceTable,
    health: Arc<OutputHealth>,
    device: Option<Device>,
}

impl PrecisionBackend {
    /// Open an output device and mix on its sample clock.
    ///
    /// # Errors
    /// `Error::BackendUnavailable` when no suitable device can be opened.
    pub fn open(device_name: Option<String>, preferred_rate: u32, curve: FadeCurve) -> Result<Self> {
        let request = OutputRequest {
            device_name,
            require_f32: true,
            preferred_rate,
        };
        let voices: VoiceTable = Arc::new(Mutex::new(HashMap::new()));
        let frames = Arc::new(AtomicU64::new(0));
        let rate = Arc::new(AtomicU32::new(preferred_rate));
        let health = OutputHealth::new();

        let stream = OutputStream::spawn(
            request.clone(),
            Arc::clone(&health),
            renderer(Arc::clone(&voices), Arc::clone(&frames), Arc::clone(&rate)),
        )
        .map_err(|e| match e {
            Error::BackendUnavailable(_) => e,
            other => Error::BackendUnavailable(other.to_string()),
        })?;

        let sample_rate = stream.sample_rate();
        rate.store(sample_rate, Ordering::Release);
        info!(
            "Precision backend on '{}' at {}Hz",
            stream.device_name(),
            sample_rate
        );

        Ok(Self {
            clock: Arc::new(SampleClock::from_counter(Arc::clone(&frames), sample_rate)),
            sample_rate,
            curve,
            voices,
            health,
            device: Some(Device {
                request,
                frames,
                rate,
                stream: Some(stream),
            }),
        })
    }

    /// Backend without an output device, driven by `clock`.
    ///
    /// Used for tests and headless runs; voices are tracked and their gains
    /// evaluated exactly as with a device, only nothing is rendered.
    pub fn headless(clock: Arc<dyn Clock>, sample_rate: u32, curve: FadeCurve) -> Self {
        Self {
            sample_rate,
            curve,
            health: OutputHealth::with_clock(Arc::clone(&clock)),
            clock,
            voices: Arc::new(Mutex::new(HashMap::new())),
            device: None,
        }
    }

    /// Mix `out.len()` frames starting at time `start`, without a device.
    pub fn render_offline(&self, start: f64, out: &mut [AudioFrame]) {
        mix_voices(&self.voices, start, self.sample_rate as f64, out);
    }

    /// Render callback for driving a headless backend by hand.
    ///
    /// Each call mixes one block starting at the backend clock's current
    /// time and is recorded on the output health like a device callback,
    /// so a driver that stops calling it reads as a stalled output.
    pub fn offline_renderer(&self) -> RenderFn {
        let voices = Arc::clone(&self.voices);
        let clock = Arc::clone(&self.clock);
        let rate = self.sample_rate as f64;
        monitored(
            &self.health,
            Box::new(move |out: &mut [AudioFrame]| {
                mix_voices(&voices, clock.now(), rate, out);
            }),
        )
    }
}

fn renderer(voices: VoiceTable, frames: Arc<AtomicU64>, rate: Arc<AtomicU32>) -> RenderFn {
    Box::new(move |out: &mut [AudioFrame]| {
        let rate = rate.load(Ordering::Acquire).max(1) as f64;
        let base = frames.load(Ordering::Acquire);
        mix_voices(&voices, base as f64 / rate, rate, out);
        frames.fetch_add(out.len() as u64, Ordering::Release);
    })
}

impl PlaybackBackend for PrecisionBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Precision
    }

    fn now(&self) -> f64 {
        self.clock.now()
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn schedules_ahead(&self) -> bool {
        true
    }

    fn register_asset(&mut self, _asset: &Arc<AudioAsset>) -> Result<()> {
        // Voices read the decoded buffer directly
        Ok(())
    }

    fn start(&mut self, slot: usize, asset: &Arc<AudioAsset>, at: f64, gain: f32) -> Result<()> {
        if self.health.is_blocked() {
            if let Some(stream) = self.device.as_ref().and_then(|d| d.stream.as_ref()) {
                stream.request_resume();
            }
            return Err(Error::PlaybackRejected(
                "host refused to start audio output".to_string(),
            ));
        }

        let voice = Voice {
            pcm: Arc::clone(asset.pcm()),
            start_at: at,
            automation: GainAutomation::new(gain as f64),
        };
        if lock(&self.voices).insert(slot, voice).is_some() {
            warn!("Slot {} already had a voice; replaced", slot);
        }
        debug!("Voice on slot {} for asset {} at {:.3}s", slot, asset.index(), at);
        Ok(())
    }

    fn ramp_gain(&mut self, slot: usize, from: f32, to: f32, start_at: f64, duration: f64) {
        if let Some(voice) = lock(&self.voices).get_mut(&slot) {
            voice
                .automation
                .ramp(from as f64, to as f64, start_at, duration, self.curve);
        }
    }

    fn gain_at(&self, slot: usize, t: f64) -> f32 {
        lock(&self.voices)
            .get(&slot)
            .map(|v| v.automation.value_at(t) as f32)
            .unwrap_or(0.0)
    }

    fn is_sounding(&self, slot: usize) -> bool {
        if self.health.is_silent() {
            return false;
        }
        let now = self.clock.now();
        lock(&self.voices)
            .get(&slot)
            .map(|v| now >= v.start_at && now < v.end())
            .unwrap_or(false)
    }

    fn stop(&mut self, slot: usize) {
        lock(&self.voices).remove(&slot);
    }

    fn service(&mut self, now: f64) {
        for voice in lock(&self.voices).values_mut() {
            voice.automation.prune_before(now);
        }
    }

    fn next_wakeup(&self) -> Option<f64> {
        None
    }

    fn release_transient(&mut self) {
        lock(&self.voices).clear();
    }

    fn recover(&mut self) -> Result<()> {
        if let Some(device) = self.device.as_mut() {
            info!("Reopening audio output");
            if let Some(mut old) = device.stream.take() {
                old.close();
            }
            let stream = OutputStream::spawn(
                device.request.clone(),
                Arc::clone(&self.health),
                renderer(
                    Arc::clone(&self.voices),
                    Arc::clone(&device.frames),
                    Arc::clone(&device.rate),
                ),
            )?;
            if stream.sample_rate() != self.sample_rate {
                warn!(
                    "Output rate changed from {}Hz to {}Hz; assets keep their original rate",
                    self.sample_rate,
                    stream.sample_rate()
                );
            }
            device.stream = Some(stream);
        }
        self.health.clear();
        Ok(())
    }

    fn health(&self) -> Arc<OutputHealth> {
        Arc::clone(&self.health)
    }

    fn shutdown(&mut self) {
        self.release_transient();
        if let Some(device) = self.device.as_mut() {
            if let Some(mut stream) = device.stream.take() {
                stream.close();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ManualClock;

    fn tone(seconds: f64, rate: u32) -> Arc<AudioAsset> {
        let frames = (seconds * rate as f64) as usize;
        let samples = vec![0.5f32; frames];
        Arc::new(AudioAsset::from_pcm(
            "tone",
            PcmBuffer::from_interleaved(&samples, rate, 1),
        ))
    }

    #[test]
    fn test_voice_scheduled_ahead() {
        let clock = Arc::new(ManualClock::new());
        let mut backend = PrecisionBackend::headless(clock.clone(), 1_000, FadeCurve::Linear);
        let asset = tone(2.0, 1_000);

        backend.start(0, &asset, 1.0, 0.0).unwrap();
        backend.ramp_gain(0, 0.0, 0.8, 1.0, 1.0);

        assert!(!backend.is_sounding(0));
        clock.set(1.5);
        assert!(backend.is_sounding(0));
        assert!((backend.gain_at(0, 1.5) - 0.4).abs() < 1e-6);
        clock.set(3.0);
        assert!(!backend.is_sounding(0));
    }

    #[test]
    fn test_offline_render_applies_gain() {
        let clock = Arc::new(ManualClock::new());
        let mut backend = PrecisionBackend::headless(clock, 100, FadeCurve::Linear);
        let asset = tone(1.0, 100);

        backend.start(3, &asset, 0.0, 0.5).unwrap();
        let mut out = vec![AudioFrame::zero(); 10];
        backend.render_offline(0.0, &mut out);
        assert!((out[5].left - 0.25).abs() < 1e-6);

        backend.stop(3);
        let mut out = vec![AudioFrame::zero(); 10];
        backend.render_offline(0.0, &mut out);
        assert_eq!(out[5], AudioFrame::zero());
    }

    #[test]
    fn test_blocked_output_rejects_start() {
        let clock = Arc::new(ManualClock::new());
        let mut backend = PrecisionBackend::headless(clock, 100, FadeCurve::Linear);
        let asset = tone(1.0, 100);
        backend.health().set_blocked(true);

        let result = backend.start(0, &asset, 0.0, 0.0);
        assert!(matches!(result, Err(Error::PlaybackRejected(_))));

        backend.recover().unwrap();
        assert!(backend.start(0, &asset, 0.0, 0.0).is_ok());
    }

    #[test]
    fn test_failed_output_is_silent() {
        let clock = Arc::new(ManualClock::new());
        let mut backend = PrecisionBackend::headless(clock, 100, FadeCurve::Linear);
        let asset = tone(1.0, 100);
        backend.start(0, &asset, 0.0, 1.0).unwrap();
        assert!(backend.is_sounding(0));

        backend.health().mark_failed();
        assert!(!backend.is_sounding(0));
    }

    #[test]
    fn test_stalled_render_is_silent() {
        let clock = Arc::new(ManualClock::new());
        let mut backend = PrecisionBackend::headless(clock.clone(), 100, FadeCurve::Linear);
        let asset = tone(5.0, 100);
        backend.start(0, &asset, 0.0, 1.0).unwrap();
        let mut render = backend.offline_renderer();
        let mut block = vec![AudioFrame::zero(); 10];

        for i in 1..=20 {
            clock.set(i as f64 * 0.1);
            block.fill(AudioFrame::zero());
            render(&mut block);
        }
        assert!((block[0].left - 0.5).abs() < 1e-6);
        assert!(backend.is_sounding(0));

        // Callbacks stop; the voice is still inside its buffer
        clock.set(3.0);
        assert!(!backend.is_sounding(0));
        assert!(!backend.health().is_failed());

        backend.recover().unwrap();
        assert!(backend.is_sounding(0));
    }
}
