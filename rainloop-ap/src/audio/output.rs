//! Audio output using cpal
//!
//! The stream lives on a dedicated thread because `cpal::Stream` is not
//! `Send` on every host. The engine talks to it through [`OutputStream`],
//! which is `Send` and only carries a command channel and shared health
//! flags.

use crate::audio::AudioFrame;
use crate::backend::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

/// Seconds without a render callback before a monitored output counts as
/// stalled
pub const STALL_THRESHOLD: f64 = 0.5;

/// Health of the output path, shared with the audio thread.
///
/// `failed` is raised when the host reports a stream error (device lost).
/// `blocked` is raised when the host refuses to start the stream; playback
/// may succeed after a later retry. Once monitoring is on, every render
/// callback is timestamped, so a host that silently stops pulling audio
/// shows up as a stall even though no error is reported.
///
/// Callback bookkeeping is atomics only; it runs on the real-time thread.
pub struct OutputHealth {
    clock: Arc<dyn Clock>,
    failed: AtomicBool,
    blocked: AtomicBool,
    error_count: AtomicU32,
    monitored: AtomicBool,
    /// Clock time (f64 bits) of the last render callback, or of the moment
    /// monitoring started or was reset
    last_callback: AtomicU64,
    callback_count: AtomicU64,
    frames_rendered: AtomicU64,
}

impl OutputHealth {
    /// Health timestamped on wall-clock time
    pub fn new() -> Arc<Self> {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Health timestamped on `clock`
    pub fn with_clock(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            clock,
            failed: AtomicBool::new(false),
            blocked: AtomicBool::new(false),
            error_count: AtomicU32::new(0),
            monitored: AtomicBool::new(false),
            last_callback: AtomicU64::new(0f64.to_bits()),
            callback_count: AtomicU64::new(0),
            frames_rendered: AtomicU64::new(0),
        })
    }

    pub fn mark_failed(&self) {
        self.failed.store(true, Ordering::SeqCst);
        self.error_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn set_blocked(&self, blocked: bool) {
        self.blocked.store(blocked, Ordering::SeqCst);
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::SeqCst)
    }

    /// Errors reported since the output was opened
    pub fn error_count(&self) -> u32 {
        self.error_count.load(Ordering::SeqCst)
    }

    /// Expect render callbacks from now on
    pub fn start_monitoring(&self) {
        self.touch();
        self.monitored.store(true, Ordering::Release);
    }

    pub fn is_monitored(&self) -> bool {
        self.monitored.load(Ordering::Acquire)
    }

    /// Record one render callback of `frames` frames
    pub fn note_callback(&self, frames: usize) {
        self.touch();
        self.callback_count.fetch_add(1, Ordering::Release);
        self.frames_rendered.fetch_add(frames as u64, Ordering::Relaxed);
    }

    pub fn callback_count(&self) -> u64 {
        self.callback_count.load(Ordering::Acquire)
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered.load(Ordering::Relaxed)
    }

    /// Seconds since the last render callback
    pub fn since_last_callback(&self) -> f64 {
        self.clock.now() - f64::from_bits(self.last_callback.load(Ordering::Acquire))
    }

    /// Monitored and no callback for longer than [`STALL_THRESHOLD`]
    pub fn is_stalled(&self) -> bool {
        self.is_monitored() && self.since_last_callback() > STALL_THRESHOLD
    }

    /// No sound can be coming out of this output
    pub fn is_silent(&self) -> bool {
        self.is_failed() || self.is_stalled()
    }

    /// Reset after a successful recovery; a reopened stream gets a fresh
    /// stall window
    pub fn clear(&self) {
        self.failed.store(false, Ordering::SeqCst);
        self.blocked.store(false, Ordering::SeqCst);
        self.touch();
    }

    fn touch(&self) {
        self.last_callback
            .store(self.clock.now().to_bits(), Ordering::Release);
    }
}

impl fmt::Debug for OutputHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputHealth")
            .field("failed", &self.is_failed())
            .field("blocked", &self.is_blocked())
            .field("monitored", &self.is_monitored())
            .field("callback_count", &self.callback_count())
            .finish()
    }
}

/// Wrap `render` so every call is recorded on `health`, and turn
/// monitoring on.
pub fn monitored(health: &Arc<OutputHealth>, mut render: RenderFn) -> RenderFn {
    let health = Arc::clone(health);
    health.start_monitoring();
    Box::new(move |out: &mut [AudioFrame]| {
        render(out);
        health.note_callback(out.len());
    })
}

/// Output device request
#[derive(Debug, Clone, Default)]
pub struct OutputRequest {
    /// Device name, `None` for the host default
    pub device_name: Option<String>,
    /// Refuse devices that cannot take f32 samples natively
    pub require_f32: bool,
    /// Preferred sample rate when the device supports it
    pub preferred_rate: u32,
}

/// Render callback: fill the slice with mixed stereo frames
pub type RenderFn = Box<dyn FnMut(&mut [AudioFrame]) + Send + 'static>;

enum OutputCommand {
    /// Retry `play()` after the host refused it
    Resume,
    Shutdown,
}

/// Handle to a running output stream
pub struct OutputStream {
    sample_rate: u32,
    device_name: String,
    health: Arc<OutputHealth>,
    commands: mpsc::Sender<OutputCommand>,
    thread: Option<JoinHandle<()>>,
}

impl OutputStream {
    /// Open a device and start streaming `render` on a dedicated thread.
    pub fn spawn(request: OutputRequest, health: Arc<OutputHealth>, render: RenderFn) -> Result<Self> {
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(u32, String)>>();
        let (command_tx, command_rx) = mpsc::channel::<OutputCommand>();
        let thread_health = Arc::clone(&health);
        let render = monitored(&health, render);

        let thread = std::thread::Builder::new()
            .name("rainloop-output".to_string())
            .spawn(move || {
                let stream = match open_stream(&request, &thread_health, render) {
                    Ok((stream, rate, name)) => {
                        // Ignore send errors: the spawner gave up waiting
                        let _ = ready_tx.send(Ok((rate, name)));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                while let Ok(command) = command_rx.recv() {
                    match command {
                        OutputCommand::Resume => match stream.play() {
                            Ok(()) => {
                                info!("Audio stream resumed");
                                thread_health.set_blocked(false);
                            }
                            Err(e) => warn!("Audio stream still refused by host: {}", e),
                        },
                        OutputCommand::Shutdown => break,
                    }
                }

                debug!("Audio output thread exiting");
                drop(stream);
            })
            .map_err(|e| Error::AudioOutput(format!("Failed to spawn output thread: {}", e)))?;

        let (sample_rate, device_name) = ready_rx
            .recv()
            .map_err(|_| Error::AudioOutput("Output thread exited during startup".to_string()))??;

        Ok(Self {
            sample_rate,
            device_name,
            health,
            commands: command_tx,
            thread: Some(thread),
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn health(&self) -> Arc<OutputHealth> {
        Arc::clone(&self.health)
    }

    /// Ask the host to start the stream again after a refusal
    pub fn request_resume(&self) {
        if self.commands.send(OutputCommand::Resume).is_err() {
            warn!("Audio output thread is gone; cannot resume");
        }
    }

    /// Stop the stream and join the audio thread
    pub fn close(&mut self) {
        let _ = self.commands.send(OutputCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Audio output thread panicked");
            }
        }
    }
}

impl Drop for OutputStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// List available audio output devices.
pub fn list_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();

    let devices: Vec<String> = host
        .output_devices()
        .map_err(|e| Error::AudioOutput(format!("Failed to enumerate devices: {}", e)))?
        .filter_map(|device| device.name().ok())
        .collect();

    debug!("Found {} output devices", devices.len());
    Ok(devices)
}

fn open_stream(
    request: &OutputRequest,
    health: &Arc<OutputHealth>,
    render: RenderFn,
) -> Result<(Stream, u32, String)> {
    let (device, name) = find_device(request.device_name.as_deref())?;
    let (config, sample_format) = best_config(&device, request)?;

    debug!(
        "Audio config: sample_rate={}, channels={}, format={:?}",
        config.sample_rate.0, config.channels, sample_format
    );

    let stream = match sample_format {
        SampleFormat::F32 => build_stream::<f32>(&device, &config, render, health, |s| s)?,
        SampleFormat::I16 => build_stream::<i16>(&device, &config, render, health, |s| {
            (s * i16::MAX as f32) as i16
        })?,
        SampleFormat::U16 => build_stream::<u16>(&device, &config, render, health, |s| {
            // [-1.0, 1.0] to [0, 65535]
            ((s + 1.0) * 32767.5) as u16
        })?,
        other => {
            return Err(Error::AudioOutput(format!(
                "Unsupported sample format: {:?}",
                other
            )));
        }
    };

    if let Err(e) = stream.play() {
        // Keep the stream: the host may allow it on a later attempt
        warn!("Host refused to start audio stream: {}", e);
        health.set_blocked(true);
    } else {
        info!("Audio stream started on '{}'", name);
    }

    Ok((stream, config.sample_rate.0, name))
}

fn find_device(device_name: Option<&str>) -> Result<(Device, String)> {
    let host = cpal::default_host();

    if let Some(name) = device_name {
        let mut devices = host
            .output_devices()
            .map_err(|e| Error::AudioOutput(format!("Failed to enumerate devices: {}", e)))?;

        if let Some(dev) = devices.find(|d| d.name().ok().as_deref() == Some(name)) {
            info!("Found requested audio device: {}", name);
            return Ok((dev, name.to_string()));
        }
        warn!("Requested device '{}' not found, falling back to default device", name);
    }

    let dev = host
        .default_output_device()
        .ok_or_else(|| Error::AudioOutput("No default output device found".to_string()))?;
    let name = dev.name().unwrap_or_else(|_| "Unknown".to_string());
    info!("Using default audio device: {}", name);
    Ok((dev, name))
}

/// Prefer stereo f32 at the requested rate, else the device default.
fn best_config(device: &Device, request: &OutputRequest) -> Result<(StreamConfig, SampleFormat)> {
    let rate = request.preferred_rate;
    let preferred = device
        .supported_output_configs()
        .map_err(|e| Error::AudioOutput(format!("Failed to get device configs: {}", e)))?
        .find(|config| {
            config.channels() == 2
                && config.min_sample_rate().0 <= rate
                && config.max_sample_rate().0 >= rate
                && config.sample_format() == SampleFormat::F32
        });

    if let Some(supported) = preferred {
        let sample_format = supported.sample_format();
        let config = supported.with_sample_rate(cpal::SampleRate(rate)).config();
        return Ok((config, sample_format));
    }

    let supported = device
        .default_output_config()
        .map_err(|e| Error::AudioOutput(format!("Failed to get default config: {}", e)))?;
    let sample_format = supported.sample_format();

    if request.require_f32 && sample_format != SampleFormat::F32 {
        return Err(Error::BackendUnavailable(format!(
            "device only offers {:?} output",
            sample_format
        )));
    }

    Ok((supported.config(), sample_format))
}

fn build_stream<T>(
    device: &Device,
    config: &StreamConfig,
    mut render: RenderFn,
    health: &Arc<OutputHealth>,
    convert: fn(f32) -> T,
) -> Result<Stream>
where
    T: cpal::SizedSample + Send + 'static,
{
    let channels = config.channels as usize;
    let error_health = Arc::clone(health);
    let mut scratch: Vec<AudioFrame> = Vec::new();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let frames = data.len() / channels.max(1);
                scratch.clear();
                scratch.resize(frames, AudioFrame::zero());
                render(&mut scratch);

                for (out, frame) in data.chunks_mut(channels).zip(scratch.iter()) {
                    out[0] = convert(frame.left.clamp(-1.0, 1.0));
                    if channels > 1 {
                        out[1] = convert(frame.right.clamp(-1.0, 1.0));
                    }
                    for extra in out.iter_mut().skip(2) {
                        *extra = convert(0.0);
                    }
                }
            },
            move |err| {
                error!("Audio stream error: {} - marking for recovery", err);
                error_health.mark_failed();
            },
            None,
        )
        .map_err(|e| Error::AudioOutput(format!("Failed to build stream: {}", e)))
}
