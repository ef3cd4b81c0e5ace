//! Playback backends
//!
//! The scheduler drives exactly one backend per process through the
//! [`PlaybackBackend`] trait. Two implementations exist:
//!
//! - [`PrecisionBackend`]: mixes decoded buffers itself on a sample clock,
//!   so start times and gain ramps can be placed ahead of time and are
//!   evaluated per sample.
//! - [`CoarseBackend`]: drives a pool of self-contained playback elements
//!   that can only start immediately and whose volume is written in
//!   discrete steps by [`PlaybackBackend::service`].
//!
//! Backend selection happens once in [`select_backend`]; the scheduler
//! never branches on the concrete type.

pub mod automation;
pub mod clock;
pub mod coarse;
pub mod precision;

pub use clock::{Clock, ManualClock, SampleClock, SystemClock};
pub use coarse::CoarseBackend;
pub use precision::PrecisionBackend;

use crate::assets::AudioAsset;
use crate::audio::output::OutputHealth;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

/// Which backend family is running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Precision,
    Coarse,
}

/// Configured backend choice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendPreference {
    /// Precision when the host supports it, coarse otherwise
    #[default]
    Auto,
    Precision,
    Coarse,
}

impl FromStr for BackendPreference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "precision" => Ok(Self::Precision),
            "coarse" => Ok(Self::Coarse),
            other => Err(Error::Config(format!("Unknown backend '{}'", other))),
        }
    }
}

/// Capability set the scheduler relies on.
///
/// `slot` identifies a playback unit; a backend holds at most one voice or
/// element per slot. Times are on the backend's own clock ([`Self::now`]).
pub trait PlaybackBackend: Send {
    fn kind(&self) -> BackendKind;

    /// Current time in seconds
    fn now(&self) -> f64;

    /// Rate that loaded assets must be converted to
    fn sample_rate(&self) -> u32;

    /// Whether starts and ramps may be placed in the future
    fn schedules_ahead(&self) -> bool;

    /// Make a freshly loaded asset playable
    fn register_asset(&mut self, asset: &Arc<AudioAsset>) -> Result<()>;

    /// Begin playback of `asset` on `slot` at `at` with an initial gain.
    ///
    /// Backends that cannot schedule ahead start immediately.
    fn start(&mut self, slot: usize, asset: &Arc<AudioAsset>, at: f64, gain: f32) -> Result<()>;

    /// Replace any pending gain changes on `slot` from `start_at` with a ramp
    fn ramp_gain(&mut self, slot: usize, from: f32, to: f32, start_at: f64, duration: f64);

    /// Gain `slot` has (or is scheduled to have) at time `t`
    fn gain_at(&self, slot: usize, t: f64) -> f32;

    /// True while `slot` is producing sound
    fn is_sounding(&self, slot: usize) -> bool;

    /// Stop `slot` immediately and free its voice or element
    fn stop(&mut self, slot: usize);

    /// Periodic maintenance; the coarse backend writes stepped gains here
    fn service(&mut self, now: f64);

    /// Next time `service` has work to do
    fn next_wakeup(&self) -> Option<f64>;

    /// Drop transient playback resources after a full stop
    fn release_transient(&mut self);

    /// Re-establish output after the host suspended or lost it
    fn recover(&mut self) -> Result<()>;

    fn health(&self) -> Arc<OutputHealth>;

    /// Close the output device
    fn shutdown(&mut self);
}

/// Backend construction options
#[derive(Debug, Clone)]
pub struct BackendOptions {
    pub preference: BackendPreference,
    pub device_name: Option<String>,
    /// Run without an audio device, on the system clock
    pub headless: bool,
    pub fade_curve: rainloop_common::FadeCurve,
    pub coarse_steps: u32,
    pub elements_per_asset: usize,
    pub sample_rate: u32,
}

/// Build the process-wide backend, falling back from precision to coarse.
pub fn select_backend(options: &BackendOptions) -> Result<Box<dyn PlaybackBackend>> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());

    let precision = || -> Result<Box<dyn PlaybackBackend>> {
        if options.headless {
            Ok(Box::new(PrecisionBackend::headless(
                Arc::clone(&clock),
                options.sample_rate,
                options.fade_curve,
            )))
        } else {
            Ok(Box::new(PrecisionBackend::open(
                options.device_name.clone(),
                options.sample_rate,
                options.fade_curve,
            )?))
        }
    };

    let coarse = || -> Result<Box<dyn PlaybackBackend>> {
        if options.headless {
            Ok(Box::new(CoarseBackend::headless(
                Arc::clone(&clock),
                options.sample_rate,
                options.fade_curve,
                options.coarse_steps,
                options.elements_per_asset,
            )))
        } else {
            Ok(Box::new(CoarseBackend::open(
                options.device_name.clone(),
                options.sample_rate,
                options.fade_curve,
                options.coarse_steps,
                options.elements_per_asset,
            )?))
        }
    };

    let backend = match options.preference {
        BackendPreference::Precision => precision()?,
        BackendPreference::Coarse => coarse()?,
        BackendPreference::Auto => match precision() {
            Ok(backend) => backend,
            Err(e) => {
                warn!("Precision backend unavailable ({}), using coarse backend", e);
                coarse()?
            }
        },
    };

    info!(
        "Playback backend: {:?} at {}Hz{}",
        backend.kind(),
        backend.sample_rate(),
        if options.headless { " (headless)" } else { "" }
    );
    Ok(backend)
}
