//! OS-facing backends that launch, probe and terminate the encoder.
//!
//! The container deployment runs the profile script as a child process in
//! its own process group; the service deployment hands the script to the
//! service manager as a unit. Both expose the same [`Supervisor`] contract so
//! the lifecycle controller does not care which one it drives.

mod process;
mod service;

pub use process::ProcessSupervisor;
pub use service::{ServiceError, ServiceSupervisor, Systemctl, UnitSettings};

use crate::catalog::StreamProfile;
use crate::store::StreamConfig;
use std::fmt;
use std::io;
use thiserror::Error;

/// Identifies the running stream attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunHandle {
    Process(u32),
    Service(String),
}

impl RunHandle {
    /// Parses the on-disk record: a bare pid or a unit name.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        if raw.bytes().all(|b| b.is_ascii_digit()) {
            return raw.parse().ok().map(Self::Process);
        }
        let valid_unit = raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@' | ':'));
        valid_unit.then(|| Self::Service(raw.to_string()))
    }
}

impl fmt::Display for RunHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Process(pid) => write!(f, "{pid}"),
            Self::Service(unit) => f.write_str(unit),
        }
    }
}

/// Settings the encoder scripts read from their environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchEnv {
    vars: Vec<(&'static str, String)>,
}

impl LaunchEnv {
    pub fn new(config: &StreamConfig, server_url: &str, video_device: &str) -> Self {
        Self {
            vars: vec![
                ("STREAM_KEY", config.stream_key.clone()),
                ("SERVER_URL", server_url.to_string()),
                ("VIDEO_DEVICE", video_device.to_string()),
                ("RESOLUTION", config.resolution.clone()),
                ("BITRATE", config.bitrate.to_string()),
                ("FPS", config.fps.to_string()),
                ("AUDIO_BITRATE", config.audio_bitrate.to_string()),
            ],
        }
    }

    pub fn vars(&self) -> &[(&'static str, String)] {
        &self.vars
    }
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Service(#[from] ServiceError),
}

#[derive(Debug, Error)]
pub enum TerminationError {
    #[error("refusing to signal pid {0}")]
    InvalidPid(u32),
    #[error("failed to signal process group {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: io::Error,
    },
    #[error("{0} is still alive after forced termination")]
    Survived(RunHandle),
    #[error(transparent)]
    Service(#[from] ServiceError),
}

pub trait Supervisor: Send + Sync {
    fn launch(&self, profile: &StreamProfile, env: &LaunchEnv) -> Result<RunHandle, LaunchError>;

    fn is_alive(&self, handle: &RunHandle) -> bool;

    /// Graceful stop, bounded grace period, then forced kill. A target that
    /// is already gone counts as success.
    fn terminate(&self, handle: &RunHandle) -> Result<(), TerminationError>;

    /// Stops a run this backend can find without a record. Backends whose
    /// runs are only known through their handle have nothing to sweep.
    fn sweep(&self) -> Result<(), TerminationError> {
        Ok(())
    }
}
