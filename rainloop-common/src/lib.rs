//! # Rainloop Common Library
//!
//! Shared code for the rainloop ambient player:
//! - Fade curve definitions and calculations
//! - Event types (MixerEvent enum) and the EventBus
//! - Configuration file discovery and layered value resolution
//! - Common error types

pub mod config;
pub mod error;
pub mod events;
pub mod fade_curves;

pub use error::{Error, Result};
pub use fade_curves::FadeCurve;
