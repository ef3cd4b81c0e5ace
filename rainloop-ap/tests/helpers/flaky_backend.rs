//! Backend wrapper that rejects starts of chosen assets

use rainloop_ap::assets::AudioAsset;
use rainloop_ap::audio::output::OutputHealth;
use rainloop_ap::backend::{BackendKind, PlaybackBackend};
use rainloop_ap::{Error, Result};
use std::collections::HashSet;
use std::sync::Arc;

pub struct FlakyBackend {
    inner: Box<dyn PlaybackBackend>,
    rejected_assets: HashSet<usize>,
}

impl FlakyBackend {
    pub fn new(inner: Box<dyn PlaybackBackend>, rejected_assets: &[usize]) -> Self {
        Self {
            inner,
            rejected_assets: rejected_assets.iter().copied().collect(),
        }
    }
}

impl PlaybackBackend for FlakyBackend {
    fn kind(&self) -> BackendKind {
        self.inner.kind()
    }

    fn now(&self) -> f64 {
        self.inner.now()
    }

    fn sample_rate(&self) -> u32 {
        self.inner.sample_rate()
    }

    fn schedules_ahead(&self) -> bool {
        self.inner.schedules_ahead()
    }

    fn register_asset(&mut self, asset: &Arc<AudioAsset>) -> Result<()> {
        self.inner.register_asset(asset)
    }

    fn start(&mut self, slot: usize, asset: &Arc<AudioAsset>, at: f64, gain: f32) -> Result<()> {
        if self.rejected_assets.contains(&asset.index()) {
            return Err(Error::PlaybackRejected(format!(
                "asset {} refused",
                asset.index()
            )));
        }
        self.inner.start(slot, asset, at, gain)
    }

    fn ramp_gain(&mut self, slot: usize, from: f32, to: f32, start_at: f64, duration: f64) {
        self.inner.ramp_gain(slot, from, to, start_at, duration)
    }

    fn gain_at(&self, slot: usize, t: f64) -> f32 {
        self.inner.gain_at(slot, t)
    }

    fn is_sounding(&self, slot: usize) -> bool {
        self.inner.is_sounding(slot)
    }

    fn stop(&mut self, slot: usize) {
        self.inner.stop(slot)
    }

    fn service(&mut self, now: f64) {
        self.inner.service(now)
    }

    fn next_wakeup(&self) -> Option<f64> {
        self.inner.next_wakeup()
    }

    fn release_transient(&mut self) {
        self.inner.release_transient()
    }

    fn recover(&mut self) -> Result<()> {
        self.inner.recover()
    }

    fn health(&self) -> Arc<OutputHealth> {
        self.inner.health()
    }

    fn shutdown(&mut self) {
        self.inner.shutdown()
    }
}
