//! Core audio data types
//!
//! All decoded audio is held as interleaved stereo f32 at the backend's
//! output rate, so rendering never converts formats on the audio thread.

/// Single stereo audio frame (left + right sample)
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AudioFrame {
    pub left: f32,
    pub right: f32,
}

impl AudioFrame {
    /// Silent frame
    pub fn zero() -> Self {
        Self::default()
    }

    /// Add `other` scaled by `gain`
    pub fn add_scaled(&mut self, other: AudioFrame, gain: f32) {
        self.left += other.left * gain;
        self.right += other.right * gain;
    }
}

/// Fully decoded recording ready for playback.
///
/// **Format:**
/// - Samples are f32 (floating point -1.0 to 1.0)
/// - Stereo interleaved: [L, R, L, R, ...]
#[derive(Debug, Clone, PartialEq)]
pub struct PcmBuffer {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl PcmBuffer {
    /// Build from interleaved samples with any channel count.
    ///
    /// Mono is duplicated to both sides; channels beyond the first two are
    /// dropped.
    pub fn from_interleaved(samples: &[f32], sample_rate: u32, channels: u16) -> Self {
        let samples = match channels {
            0 => Vec::new(),
            1 => samples.iter().flat_map(|&s| [s, s]).collect(),
            2 => samples.to_vec(),
            n => samples
                .chunks_exact(n as usize)
                .flat_map(|frame| [frame[0], frame[1]])
                .collect(),
        };

        Self {
            samples,
            sample_rate,
        }
    }

    /// Silent buffer of the given length
    pub fn silence(duration_seconds: f64, sample_rate: u32) -> Self {
        let frames = (duration_seconds * sample_rate as f64).round() as usize;
        Self {
            samples: vec![0.0; frames * 2],
            sample_rate,
        }
    }

    /// Number of stereo frames
    pub fn frames(&self) -> usize {
        self.samples.len() / 2
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Interleaved stereo samples
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Duration in seconds
    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Frame at index, `None` past the end
    pub fn frame(&self, index: usize) -> Option<AudioFrame> {
        let i = index.checked_mul(2)?;
        match self.samples.get(i..i + 2) {
            Some(&[left, right]) => Some(AudioFrame { left, right }),
            _ => None,
        }
    }
}
