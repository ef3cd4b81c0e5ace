//! Generated audio for tests

use super::RATE;
use hound::{SampleFormat, WavSpec, WavWriter};
use rainloop_ap::assets::AudioAsset;
use rainloop_ap::audio::PcmBuffer;
use std::f32::consts::PI;
use std::path::Path;

/// Constant-level mono asset at [`RATE`]
pub fn tone(id: &str, seconds: f64) -> AudioAsset {
    let frames = (seconds * RATE as f64).round() as usize;
    AudioAsset::from_pcm(id, PcmBuffer::from_interleaved(&vec![0.25f32; frames], RATE, 1))
}

/// Write a 16-bit mono 440Hz sine WAV
pub fn write_sine_wav(path: &Path, sample_rate: u32, seconds: f64) {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(path, spec).unwrap();
    let frames = (seconds * sample_rate as f64) as usize;
    for i in 0..frames {
        let t = i as f32 / sample_rate as f32;
        let sample = (2.0 * PI * 440.0 * t).sin() * 0.5;
        writer
            .write_sample((sample * i16::MAX as f32) as i16)
            .unwrap();
    }
    writer.finalize().unwrap();
}
