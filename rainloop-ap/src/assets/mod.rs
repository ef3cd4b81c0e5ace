//! Asset loading
//!
//! Fetches and decodes every configured recording once at startup. Failures
//! are collected per locator; loading only fails outright when nothing is
//! playable. Decoded audio is converted to the backend's output rate and
//! registered with the backend so it can prepare its own playback resources.

use crate::audio::decoder::SimpleDecoder;
use crate::audio::resampler::Resampler;
use crate::audio::PcmBuffer;
use crate::backend::PlaybackBackend;
use crate::error::{Error, LoadError, Result};
use futures::future::join_all;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where a recording comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    File(PathBuf),
    Url(String),
}

impl Locator {
    /// `http://` and `https://` are fetched; anything else is a file path.
    pub fn parse(source: &str) -> Self {
        let trimmed = source.trim();
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            Locator::Url(trimmed.to_string())
        } else {
            Locator::File(PathBuf::from(trimmed))
        }
    }

    /// Short identifier: file stem or last URL path segment
    pub fn short_name(&self) -> String {
        match self {
            Locator::File(path) => path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
            Locator::Url(url) => url_path(url)
                .rsplit('/')
                .find(|s| !s.is_empty())
                .map(|s| s.split('.').next().unwrap_or(s).to_string())
                .unwrap_or_else(|| url.clone()),
        }
    }

    /// Format hint for the decoder
    fn extension(&self) -> Option<String> {
        match self {
            Locator::File(path) => path.extension().map(|e| e.to_string_lossy().into_owned()),
            Locator::Url(url) => Path::new(url_path(url))
                .extension()
                .map(|e| e.to_string_lossy().into_owned()),
        }
    }
}

/// URL without query string or fragment
fn url_path(url: &str) -> &str {
    url.split(['?', '#']).next().unwrap_or(url)
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::File(path) => write!(f, "{}", path.display()),
            Locator::Url(url) => write!(f, "{}", url),
        }
    }
}

/// A decoded recording in the rotation
#[derive(Debug)]
pub struct AudioAsset {
    index: usize,
    id: String,
    locator: Locator,
    pcm: Arc<PcmBuffer>,
}

impl AudioAsset {
    /// Wrap already-decoded audio, e.g. generated tones.
    pub fn from_pcm(id: impl Into<String>, pcm: PcmBuffer) -> Self {
        let id = id.into();
        Self {
            index: 0,
            locator: Locator::File(PathBuf::from(&id)),
            id,
            pcm: Arc::new(pcm),
        }
    }

    /// Position in the rotation
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn locator(&self) -> &Locator {
        &self.locator
    }

    /// Duration in seconds
    pub fn duration(&self) -> f64 {
        self.pcm.duration_seconds()
    }

    pub fn pcm(&self) -> &Arc<PcmBuffer> {
        &self.pcm
    }
}

/// Owns the loaded assets and the record of what failed.
#[derive(Debug, Default)]
pub struct AssetStore {
    assets: Vec<Arc<AudioAsset>>,
    failures: Vec<LoadError>,
}

impl AssetStore {
    /// Fetch, decode, and register every source.
    ///
    /// # Errors
    /// `Error::NoPlayableAssets` when every source failed.
    pub async fn load(sources: &[String], backend: &mut dyn PlaybackBackend) -> Result<Self> {
        let sample_rate = backend.sample_rate();
        let client = reqwest::Client::new();

        info!("Loading {} audio assets at {}Hz", sources.len(), sample_rate);

        let fetches = sources.iter().map(|source| {
            let locator = Locator::parse(source);
            let client = client.clone();
            async move {
                let result = fetch_and_decode(&client, &locator, sample_rate).await;
                (locator, result)
            }
        });

        let mut loaded = Vec::new();
        let mut failures = Vec::new();
        for (locator, result) in join_all(fetches).await {
            match result {
                Ok(pcm) => loaded.push(AudioAsset {
                    index: 0,
                    id: locator.short_name(),
                    locator,
                    pcm: Arc::new(pcm),
                }),
                Err(reason) => {
                    warn!("Failed to load '{}': {}", locator, reason);
                    failures.push(LoadError::new(locator.to_string(), reason));
                }
            }
        }

        let mut store = Self::from_assets(loaded, backend)?;
        failures.append(&mut store.failures);
        store.failures = failures;

        if store.assets.is_empty() {
            return Err(Error::NoPlayableAssets {
                failures: store.failures,
            });
        }

        info!(
            "Loaded {} assets ({} failed)",
            store.assets.len(),
            store.failures.len()
        );
        Ok(store)
    }

    /// Index and register pre-decoded assets, skipping empty ones.
    ///
    /// Unlike [`AssetStore::load`], an empty result is not an error here;
    /// callers decide whether an empty store is usable.
    pub fn from_assets(assets: Vec<AudioAsset>, backend: &mut dyn PlaybackBackend) -> Result<Self> {
        let mut store = Self::default();

        for mut asset in assets {
            if asset.pcm.frames() == 0 {
                store
                    .failures
                    .push(LoadError::new(asset.locator.to_string(), "recording is empty"));
                continue;
            }
            if asset.pcm.sample_rate() != backend.sample_rate() {
                store.failures.push(LoadError::new(
                    asset.locator.to_string(),
                    format!(
                        "sample rate {}Hz does not match output rate {}Hz",
                        asset.pcm.sample_rate(),
                        backend.sample_rate()
                    ),
                ));
                continue;
            }

            asset.index = store.assets.len();
            let asset = Arc::new(asset);
            backend.register_asset(&asset)?;
            debug!(
                "Asset {} '{}' ready ({:.2}s)",
                asset.index,
                asset.id,
                asset.duration()
            );
            store.assets.push(asset);
        }

        Ok(store)
    }

    pub fn assets(&self) -> &[Arc<AudioAsset>] {
        &self.assets
    }

    pub fn get(&self, index: usize) -> Option<&Arc<AudioAsset>> {
        self.assets.get(index)
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    /// Per-locator failures recorded during load
    pub fn failures(&self) -> &[LoadError] {
        &self.failures
    }

    /// Drop all decoded audio
    pub fn clear(&mut self) {
        self.assets.clear();
    }
}

async fn fetch_and_decode(
    client: &reqwest::Client,
    locator: &Locator,
    sample_rate: u32,
) -> std::result::Result<PcmBuffer, String> {
    let extension = locator.extension();

    let decoded = match locator {
        Locator::File(path) => {
            let path = path.clone();
            tokio::task::spawn_blocking(move || SimpleDecoder::decode_file(&path))
                .await
                .map_err(|e| format!("decode task failed: {}", e))?
        }
        Locator::Url(url) => {
            let bytes = client
                .get(url)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| format!("fetch failed: {}", e))?
                .bytes()
                .await
                .map_err(|e| format!("fetch failed: {}", e))?;
            debug!("Fetched {} bytes from {}", bytes.len(), url);
            tokio::task::spawn_blocking(move || {
                SimpleDecoder::decode_bytes(bytes.to_vec(), extension.as_deref())
            })
            .await
            .map_err(|e| format!("decode task failed: {}", e))?
        }
    };

    let (samples, source_rate, channels) = decoded.map_err(|e| e.to_string())?;

    let pcm = tokio::task::spawn_blocking(move || -> Result<PcmBuffer> {
        let resampled = Resampler::resample(&samples, source_rate, sample_rate, channels)?;
        Ok(PcmBuffer::from_interleaved(&resampled, sample_rate, channels))
    })
    .await
    .map_err(|e| format!("resample task failed: {}", e))?
    .map_err(|e| e.to_string())?;

    if pcm.frames() == 0 {
        return Err("recording is empty".to_string());
    }
    Ok(pcm)
}
