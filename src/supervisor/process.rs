use super::{LaunchEnv, LaunchError, RunHandle, Supervisor, TerminationError};
use crate::catalog::StreamProfile;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessStatus, System};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Runs profile scripts as direct children, each leading its own process
/// group so the encoder processes a script forks are stopped with it.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    scripts_dir: PathBuf,
    grace: Duration,
}

impl ProcessSupervisor {
    pub fn new(scripts_dir: impl Into<PathBuf>, grace: Duration) -> Self {
        Self {
            scripts_dir: scripts_dir.into(),
            grace,
        }
    }

    fn wait_for_exit(&self, pid: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !pid_alive(pid) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

impl Supervisor for ProcessSupervisor {
    fn launch(&self, profile: &StreamProfile, env: &LaunchEnv) -> Result<RunHandle, LaunchError> {
        let script = self.scripts_dir.join(profile.script);
        let mut cmd = Command::new(&script);
        cmd.current_dir(&self.scripts_dir)
            .envs(env.vars().iter().map(|(k, v)| (*k, v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let mut child = cmd.spawn()?;
        let pid = child.id();

        // Reap the child as soon as it exits so a dead encoder never shows up
        // as a live zombie.
        let reaper = thread::Builder::new()
            .name(format!("reap-{pid}"))
            .spawn(move || {
                let _ = child.wait();
            });
        if let Err(err) = reaper {
            tracing::warn!(pid, error = %err, "could not spawn reaper thread");
        }

        tracing::info!(profile = profile.id, pid, script = %script.display(), "stream process launched");
        Ok(RunHandle::Process(pid))
    }

    fn is_alive(&self, handle: &RunHandle) -> bool {
        match handle {
            RunHandle::Process(pid) => pid_alive(*pid),
            RunHandle::Service(_) => false,
        }
    }

    fn terminate(&self, handle: &RunHandle) -> Result<(), TerminationError> {
        let pid = match handle {
            RunHandle::Process(pid) => *pid,
            RunHandle::Service(_) => return Ok(()),
        };
        if pid <= 1 || pid == std::process::id() {
            return Err(TerminationError::InvalidPid(pid));
        }

        signal_group(pid, Signal::Term)?;
        if self.wait_for_exit(pid, self.grace) {
            tracing::debug!(pid, "stream process exited after SIGTERM");
        } else {
            tracing::warn!(pid, grace_ms = self.grace.as_millis() as u64, "stream process ignored SIGTERM, killing");
        }

        // Anything still in the group (detached encoders included) goes now.
        signal_group(pid, Signal::Kill)?;
        if !self.wait_for_exit(pid, self.grace) {
            return Err(TerminationError::Survived(handle.clone()));
        }
        Ok(())
    }
}

/// True when the pid exists and is not a zombie.
pub(crate) fn pid_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    if !sys.refresh_process(pid) {
        return false;
    }
    sys.process(pid)
        .map(|p| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
        .unwrap_or(false)
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: Signal) -> Result<(), TerminationError> {
    let signo = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    let pgid = libc::pid_t::try_from(pid).map_err(|_| TerminationError::InvalidPid(pid))?;
    // SAFETY: killpg has no memory-safety preconditions.
    let rc = unsafe { libc::killpg(pgid, signo) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(TerminationError::Signal { pid, source: err })
}

#[cfg(not(unix))]
fn signal_group(pid: u32, signal: Signal) -> Result<(), TerminationError> {
    let target = Pid::from_u32(pid);
    let mut sys = System::new();
    if !sys.refresh_process(target) {
        return Ok(());
    }
    if let Some(process) = sys.process(target) {
        match signal {
            Signal::Term => {
                if process.kill_with(sysinfo::Signal::Term).is_none() {
                    process.kill();
                }
            }
            Signal::Kill => {
                process.kill();
            }
        }
    }
    Ok(())
}
