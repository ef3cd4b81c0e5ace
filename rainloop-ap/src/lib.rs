//! # Rainloop Audio Player Library (rainloop-ap)
//!
//! Gapless ambient playback: one or more short recordings are rotated with
//! overlapping, level-preserving crossfades so the listener hears an
//! unbroken loop.
//!
//! **Architecture:** symphonia + rubato decode assets up front; a
//! [`backend::PlaybackBackend`] (sample-accurate or coarse, picked once at
//! startup) renders units through cpal; the [`playback::MixerEngine`]
//! schedules the rotation from a single logical thread driven by
//! [`service::spawn_engine`].

pub mod api;
pub mod assets;
pub mod audio;
pub mod backend;
pub mod config;
pub mod error;
pub mod playback;
pub mod service;

pub use error::{Error, LoadError, Result};
pub use playback::{MixerEngine, MixerState, PlayOutcome};
