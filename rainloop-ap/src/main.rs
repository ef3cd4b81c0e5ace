//! Rainloop Audio Player (rainloop-ap) - Main entry point
//!
//! Loads the configured recordings, starts the crossfade engine on the
//! best available backend and exposes it over HTTP.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use rainloop_ap::api::{self, AppContext};
use rainloop_ap::audio::resampler::DEFAULT_SAMPLE_RATE;
use rainloop_ap::backend::{select_backend, BackendOptions, BackendPreference};
use rainloop_ap::config::{FileConfig, DEFAULT_PORT, PORT_ENV_VAR};
use rainloop_ap::service::{schedule_autoplay, spawn_engine};
use rainloop_ap::MixerEngine;
use rainloop_common::config::{load_toml, resolve_config_path, resolve_value, CONFIG_ENV_VAR};
use rainloop_common::FadeCurve;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Command-line arguments for rainloop-ap
#[derive(Parser, Debug)]
#[command(name = "rainloop-ap")]
#[command(about = "Gapless ambient loop player")]
#[command(version)]
struct Args {
    /// Config file (defaults to RAINLOOP_CONFIG, then the platform config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (also RAINLOOP_PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Backend: auto, precision or coarse
    #[arg(short, long)]
    backend: Option<BackendPreference>,

    /// Output device name
    #[arg(short, long)]
    device: Option<String>,

    /// Crossfade curve: linear or s_curve
    #[arg(long)]
    fade_curve: Option<FadeCurve>,

    /// Run without an audio device
    #[arg(long)]
    headless: bool,

    /// Do not start playing once loaded
    #[arg(long)]
    no_autoplay: bool,

    /// Recordings to rotate (files or http(s) URLs); replaces configured sources
    sources: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = resolve_config_path(args.config.as_deref(), CONFIG_ENV_VAR);
    let mut file: FileConfig =
        load_toml(config_path.as_deref()).context("Failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&file.logging.level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match &config_path {
        Some(path) => info!("Using config file {}", path.display()),
        None => info!("No config file, using defaults"),
    }

    if !args.sources.is_empty() {
        file.engine.sources = args.sources.clone();
    }
    if let Some(backend) = args.backend {
        file.engine.backend = backend;
    }
    if let Some(curve) = args.fade_curve {
        file.engine.fade_curve = curve;
    }
    if args.no_autoplay {
        file.engine.autoplay = false;
    }
    let port = resolve_value(args.port, PORT_ENV_VAR, file.server.port, DEFAULT_PORT);
    let engine_config = file.engine.clone();
    engine_config.validate().context("Invalid engine configuration")?;

    info!(
        "Starting rainloop-ap on port {} with {} source(s)",
        port,
        engine_config.sources.len()
    );

    let backend = select_backend(&BackendOptions {
        preference: engine_config.backend,
        device_name: args.device.or(file.audio.device.clone()),
        headless: args.headless,
        fade_curve: engine_config.fade_curve,
        coarse_steps: engine_config.coarse_steps,
        elements_per_asset: engine_config.elements_per_asset,
        sample_rate: file.audio.sample_rate.unwrap_or(DEFAULT_SAMPLE_RATE),
    })
    .context("No playback backend available")?;

    let autoplay = engine_config.autoplay;
    let autoplay_delay = Duration::from_secs_f64(engine_config.autoplay_delay.max(0.0));
    let tick = engine_config.tick_interval();

    let engine = MixerEngine::initialize(engine_config, backend)
        .await
        .context("Failed to initialize mixer engine")?;
    for failure in engine.load_failures() {
        warn!("Skipped asset: {}", failure);
    }

    let (handle, engine_task) = spawn_engine(engine, tick);
    if autoplay {
        schedule_autoplay(handle.clone(), autoplay_delay);
    }

    let ctx = AppContext {
        engine: handle.clone(),
        port,
    };
    api::run(ctx, shutdown_signal())
        .await
        .context("Server error")?;

    if let Err(e) = handle.shutdown().await {
        warn!("Engine already stopped: {}", e);
    }
    engine_task.await.context("Engine task panicked")?;

    info!("Shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
