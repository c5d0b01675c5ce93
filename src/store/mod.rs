use crate::config::Deployment;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const STREAM_CONFIG_FILE: &str = "stream_config.json";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StreamConfig {
    pub selected_script: String,
    pub bitrate: u32,
    pub resolution: String,
    pub fps: u32,
    pub audio_bitrate: u32,
    pub stream_key: String,
    pub auto_start: bool,
}

impl StreamConfig {
    pub fn defaults_for(deployment: Deployment) -> Self {
        let (selected_script, bitrate) = match deployment {
            Deployment::Container => ("vp9", 5000),
            Deployment::Service => ("av1-optiplex", 4000),
        };
        Self {
            selected_script: selected_script.to_string(),
            bitrate,
            resolution: "1280x720".to_string(),
            fps: 60,
            audio_bitrate: 192,
            stream_key: "gaming".to_string(),
            auto_start: false,
        }
    }

    /// Overlays the keys present in `patch` onto this config. Returns `None`
    /// when `patch` is not an object, a value has the wrong type, or a text
    /// value carries control characters.
    pub fn merged(&self, patch: &Value) -> Option<Self> {
        let patch = patch.as_object()?;
        let mut base = serde_json::to_value(self).ok()?;
        let fields = base.as_object_mut()?;
        for (key, value) in patch {
            if fields.contains_key(key) {
                fields.insert(key.clone(), value.clone());
            }
        }
        let merged: Self = serde_json::from_value(base).ok()?;
        merged.is_clean().then_some(merged)
    }

    /// Text values end up in environment assignments and unit files, where
    /// a line break would start a new directive.
    fn is_clean(&self) -> bool {
        [&self.selected_script, &self.resolution, &self.stream_key]
            .iter()
            .all(|value| !value.chars().any(char::is_control))
    }
}

/// JSON-backed store for the operator's stream settings.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
    defaults: StreamConfig,
}

impl ConfigStore {
    pub fn new(state_dir: &Path, deployment: Deployment) -> Self {
        Self {
            path: state_dir.join(STREAM_CONFIG_FILE),
            defaults: StreamConfig::defaults_for(deployment),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn defaults(&self) -> &StreamConfig {
        &self.defaults
    }

    /// Never fails: a missing, corrupt or mistyped file yields the defaults.
    pub fn load(&self) -> StreamConfig {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) => {
                if err.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(path = %self.path.display(), error = %err, "stream config unreadable, using defaults");
                }
                return self.defaults.clone();
            }
        };
        let persisted: Value = match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "stream config is not valid json, using defaults");
                return self.defaults.clone();
            }
        };
        self.defaults.merged(&persisted).unwrap_or_else(|| {
            tracing::warn!(path = %self.path.display(), "stream config has unexpected shape, using defaults");
            self.defaults.clone()
        })
    }

    pub fn save(&self, config: &StreamConfig) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = serde_json::to_string_pretty(config)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
