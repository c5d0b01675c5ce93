use crate::supervisor::{RunHandle, Supervisor};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub const PID_RECORD_FILE: &str = "stream.pid";
pub const UNIT_RECORD_FILE: &str = "stream.unit";

/// Single-slot record of the running stream. The file is the source of truth
/// so a panel restart still finds a stream it launched earlier.
pub struct HandleTracker {
    path: PathBuf,
    supervisor: Arc<dyn Supervisor>,
    io_lock: Mutex<()>,
}

impl HandleTracker {
    pub fn new(path: impl Into<PathBuf>, supervisor: Arc<dyn Supervisor>) -> Self {
        Self {
            path: path.into(),
            supervisor,
            io_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, handle: &RunHandle) -> io::Result<()> {
        let _guard = self.guard();
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, format!("{handle}\n"))?;
        fs::rename(&tmp, &self.path)
    }

    /// The recorded handle if it is still alive. A stale or unreadable record
    /// is removed before returning `None`.
    pub fn current(&self) -> Option<RunHandle> {
        let _guard = self.guard();
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return None,
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "handle record unreadable, discarding");
                self.remove_record();
                return None;
            }
        };
        let Some(handle) = RunHandle::parse(&raw) else {
            tracing::warn!(path = %self.path.display(), "handle record malformed, discarding");
            self.remove_record();
            return None;
        };
        if self.supervisor.is_alive(&handle) {
            Some(handle)
        } else {
            tracing::info!(handle = %handle, "stream handle is stale, clearing");
            self.remove_record();
            None
        }
    }

    /// The recorded handle without a liveness check. Only the lifecycle
    /// controller uses this, to sweep whatever a dead run left behind.
    pub(crate) fn recorded(&self) -> Option<RunHandle> {
        let _guard = self.guard();
        fs::read_to_string(&self.path)
            .ok()
            .and_then(|raw| RunHandle::parse(&raw))
    }

    pub fn clear(&self) -> io::Result<()> {
        let _guard = self.guard();
        match fs::remove_file(&self.path) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }

    fn remove_record(&self) {
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %err, "failed to remove handle record");
            }
        }
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.io_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StreamProfile;
    use crate::supervisor::{LaunchEnv, LaunchError, TerminationError};
    use std::collections::HashSet;

    #[derive(Default)]
    struct AliveSet(Mutex<HashSet<u32>>);

    impl Supervisor for AliveSet {
        fn launch(&self, _: &StreamProfile, _: &LaunchEnv) -> Result<RunHandle, LaunchError> {
            unreachable!("tracker never launches")
        }

        fn is_alive(&self, handle: &RunHandle) -> bool {
            match handle {
                RunHandle::Process(pid) => self.0.lock().unwrap().contains(pid),
                RunHandle::Service(_) => false,
            }
        }

        fn terminate(&self, _: &RunHandle) -> Result<(), TerminationError> {
            Ok(())
        }
    }

    fn tracker(dir: &Path, alive: &[u32]) -> HandleTracker {
        let sup = AliveSet::default();
        sup.0.lock().unwrap().extend(alive.iter().copied());
        HandleTracker::new(dir.join(PID_RECORD_FILE), Arc::new(sup))
    }

    #[test]
    fn empty_tracker_reports_nothing() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(tracker(dir.path(), &[]).current(), None);
    }

    #[test]
    fn live_handle_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let t = tracker(dir.path(), &[4321]);
        t.record(&RunHandle::Process(4321)).unwrap();
        assert_eq!(fs::read_to_string(t.path()).unwrap(), "4321\n");
        assert_eq!(t.current(), Some(RunHandle::Process(4321)));
        assert!(t.path().exists());
    }

    #[test]
    fn stale_pid_is_cleared_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let t = tracker(dir.path(), &[]);
        fs::write(t.path(), "99999").unwrap();
        assert_eq!(t.current(), None);
        assert!(!t.path().exists());
    }

    #[test]
    fn garbage_record_is_cleared_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let t = tracker(dir.path(), &[]);
        fs::write(t.path(), "not a pid!").unwrap();
        assert_eq!(t.current(), None);
        assert!(!t.path().exists());
    }

    #[test]
    fn recorded_skips_liveness_and_clear_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let t = tracker(dir.path(), &[]);
        t.record(&RunHandle::Process(77)).unwrap();
        assert_eq!(t.recorded(), Some(RunHandle::Process(77)));
        t.clear().unwrap();
        t.clear().unwrap();
        assert_eq!(t.recorded(), None);
    }

    #[cfg(unix)]
    #[test]
    fn stale_pid_against_real_process_table() {
        use crate::supervisor::ProcessSupervisor;
        use std::time::Duration;

        let dir = tempfile::tempdir().unwrap();
        let sup = Arc::new(ProcessSupervisor::new(dir.path(), Duration::from_millis(100)));
        let t = HandleTracker::new(dir.path().join(PID_RECORD_FILE), sup);
        fs::write(t.path(), "99999999").unwrap();
        assert_eq!(t.current(), None);
        assert!(!t.path().exists());
    }
}
