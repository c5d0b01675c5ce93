//! Stream lifecycle: start, stop, restart and toggle.
//!
//! Every transition runs under one mutex so concurrent requests can never
//! leave two encoders fighting over the capture device. All operations are
//! safe to repeat: stopping a stopped stream and starting a running one are
//! both ordinary paths.

use crate::catalog;
use crate::store::{ConfigStore, StreamConfig};
use crate::supervisor::{LaunchEnv, LaunchError, Supervisor};
use crate::tracker::HandleTracker;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Invalid script: {0:?}")]
    InvalidProfile(String),
    #[error("failed to launch {profile}: {source}")]
    LaunchFailed {
        profile: String,
        #[source]
        source: LaunchError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Stopped,
    Running,
}

#[derive(Debug, Clone)]
pub struct LaunchSettings {
    pub server_url: String,
    pub video_device: String,
    pub restart_delay: Duration,
}

pub struct StreamController {
    store: ConfigStore,
    tracker: HandleTracker,
    supervisor: Arc<dyn Supervisor>,
    settings: LaunchSettings,
    transition: Mutex<()>,
}

impl StreamController {
    pub fn new(
        store: ConfigStore,
        tracker: HandleTracker,
        supervisor: Arc<dyn Supervisor>,
        settings: LaunchSettings,
    ) -> Self {
        Self {
            store,
            tracker,
            supervisor,
            settings,
            transition: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn is_running(&self) -> bool {
        self.tracker.current().is_some()
    }

    pub fn state(&self) -> StreamState {
        if self.is_running() {
            StreamState::Running
        } else {
            StreamState::Stopped
        }
    }

    pub fn start(&self, profile_id: &str, config: StreamConfig) -> Result<(), ControlError> {
        let _guard = self.lock();
        self.start_locked(profile_id, config)
    }

    pub fn stop(&self) -> Result<(), ControlError> {
        let _guard = self.lock();
        self.stop_locked();
        Ok(())
    }

    /// Relaunches the saved profile with the saved settings, pausing between
    /// stop and start so the capture device is released.
    pub fn restart(&self) -> Result<(), ControlError> {
        let _guard = self.lock();
        let config = self.store.load();
        self.stop_locked();
        if !self.settings.restart_delay.is_zero() {
            thread::sleep(self.settings.restart_delay);
        }
        let profile_id = config.selected_script.clone();
        self.start_locked(&profile_id, config)
    }

    pub fn toggle(&self, profile_id: &str, config: StreamConfig) -> Result<StreamState, ControlError> {
        let _guard = self.lock();
        if self.tracker.current().is_some() {
            self.stop_locked();
            Ok(StreamState::Stopped)
        } else {
            self.start_locked(profile_id, config)?;
            Ok(StreamState::Running)
        }
    }

    fn start_locked(&self, profile_id: &str, mut config: StreamConfig) -> Result<(), ControlError> {
        let profile = catalog::lookup(profile_id)
            .ok_or_else(|| ControlError::InvalidProfile(profile_id.to_string()))?;

        // The encoder needs exclusive access to the capture device.
        self.stop_locked();

        let env = LaunchEnv::new(&config, &self.settings.server_url, &self.settings.video_device);
        let handle = self
            .supervisor
            .launch(profile, &env)
            .map_err(|source| ControlError::LaunchFailed {
                profile: profile_id.to_string(),
                source,
            })?;

        if let Err(err) = self.tracker.record(&handle) {
            tracing::error!(handle = %handle, error = %err, "could not record stream handle, stopping untracked stream");
            if let Err(term) = self.supervisor.terminate(&handle) {
                tracing::warn!(handle = %handle, error = %term, "termination failed");
            }
            return Err(ControlError::LaunchFailed {
                profile: profile_id.to_string(),
                source: LaunchError::Io(err),
            });
        }

        config.selected_script = profile_id.to_string();
        if let Err(err) = self.store.save(&config) {
            tracing::warn!(path = %self.store.path().display(), error = %err, "failed to persist stream config");
        }

        tracing::info!(profile = profile_id, handle = %handle, bitrate = config.bitrate, fps = config.fps, "stream started");
        Ok(())
    }

    /// Terminates whatever is recorded, live or not, then clears the record.
    /// With no record the supervisor sweeps any run it can find on its own.
    /// Failures are logged; the record is cleared regardless.
    fn stop_locked(&self) {
        let Some(handle) = self.tracker.recorded() else {
            if let Err(err) = self.supervisor.sweep() {
                tracing::warn!(error = %err, "failed to stop unrecorded stream");
            }
            return;
        };
        match self.supervisor.terminate(&handle) {
            Ok(()) => tracing::info!(handle = %handle, "stream stopped"),
            Err(err) => tracing::warn!(handle = %handle, error = %err, "stream termination failed"),
        }
        if let Err(err) = self.tracker.clear() {
            tracing::warn!(path = %self.tracker.path().display(), error = %err, "failed to clear stream handle");
        }
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.transition.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
