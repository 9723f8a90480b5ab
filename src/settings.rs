use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::PathBuf,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

use crate::sampler::SamplerConfig;

pub const SCORER_URL_ENV: &str = "PREPAI_SCORER_URL";
pub const STORE_URL_ENV: &str = "PREPAI_STORE_URL";
pub const DEBUG_ENV: &str = "PREPAI_DEBUG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionSettings {
    /// WebSocket endpoint of the scoring service.
    pub scorer_url: String,
    /// Endpoint receiving the final persistence payload.
    pub store_url: String,
    pub frame_interval_ms: u64,
    pub jpeg_quality: u8,
    pub capture_width: u32,
    pub capture_height: u32,
    pub request_timeout_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        let sampler = SamplerConfig::default();
        Self {
            scorer_url: "ws://127.0.0.1:8765".into(),
            store_url: "http://localhost:5000/api/sessions/save".into(),
            frame_interval_ms: sampler.frame_interval.as_millis() as u64,
            jpeg_quality: sampler.jpeg_quality,
            capture_width: sampler.width,
            capture_height: sampler.height,
            request_timeout_secs: 10,
        }
    }
}

impl SessionSettings {
    pub fn sampler_config(&self) -> SamplerConfig {
        SamplerConfig {
            frame_interval: Duration::from_millis(self.frame_interval_ms.max(1)),
            width: self.capture_width.max(1),
            height: self.capture_height.max(1),
            jpeg_quality: self.jpeg_quality.clamp(1, 100),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    /// Environment wins over the settings file.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var(SCORER_URL_ENV) {
            if !url.trim().is_empty() {
                self.scorer_url = url;
            }
        }
        if let Ok(url) = std::env::var(STORE_URL_ENV) {
            if !url.trim().is_empty() {
                self.store_url = url;
            }
        }
        self
    }
}

pub fn debug_enabled() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<SessionSettings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_else(|err| {
                warn!("Ignoring malformed settings at {}: {err}", path.display());
                SessionSettings::default()
            })
        } else {
            SessionSettings::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, SessionSettings> {
        match self.data.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, SessionSettings> {
        match self.data.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn settings(&self) -> SessionSettings {
        self.read().clone()
    }

    pub fn update(&self, settings: SessionSettings) -> Result<()> {
        let mut guard = self.write();
        *guard = settings;
        self.persist(&guard)
    }

    fn persist(&self, data: &SessionSettings) -> Result<()> {
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }
}
