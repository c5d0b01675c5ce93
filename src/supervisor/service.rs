use super::{LaunchEnv, LaunchError, RunHandle, Supervisor, TerminationError};
use crate::catalog::StreamProfile;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("`{command}` exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: ExitStatus,
        stderr: String,
    },
    #[error("failed to write unit file {path}: {source}")]
    WriteUnit {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("refusing to write {key} into a unit file: value contains a control character")]
    UnsafeValue { key: &'static str },
}

/// The subset of a service manager the panel needs.
pub trait ServiceManager: Send + Sync {
    fn install(&self, unit: &str, contents: &str) -> Result<(), ServiceError>;
    fn start(&self, unit: &str) -> Result<(), ServiceError>;
    fn stop(&self, unit: &str) -> Result<(), ServiceError>;
    fn is_active(&self, unit: &str) -> bool;
}

/// systemd through the `systemctl` binary. Mutating calls go through `sudo`
/// when the panel runs unprivileged.
#[derive(Debug, Clone)]
pub struct Systemctl {
    unit_dir: PathBuf,
    use_sudo: bool,
}

impl Systemctl {
    pub fn new(unit_dir: impl Into<PathBuf>, use_sudo: bool) -> Self {
        Self {
            unit_dir: unit_dir.into(),
            use_sudo,
        }
    }

    fn privileged(&self, program: &str) -> Command {
        if self.use_sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg("-n").arg(program);
            cmd
        } else {
            Command::new(program)
        }
    }

    fn systemctl(&self, args: &[&str]) -> Result<(), ServiceError> {
        let mut cmd = self.privileged("systemctl");
        cmd.args(args);
        run(cmd, None)
    }

    fn unit_path(&self, unit: &str) -> PathBuf {
        self.unit_dir.join(format!("{unit}.service"))
    }
}

impl ServiceManager for Systemctl {
    fn install(&self, unit: &str, contents: &str) -> Result<(), ServiceError> {
        let path = self.unit_path(unit);
        if self.use_sudo {
            let mut cmd = self.privileged("tee");
            cmd.arg(&path);
            run(cmd, Some(contents.as_bytes()))?;
        } else {
            std::fs::write(&path, contents)
                .map_err(|source| ServiceError::WriteUnit { path: path.clone(), source })?;
        }
        self.systemctl(&["daemon-reload"])
    }

    fn start(&self, unit: &str) -> Result<(), ServiceError> {
        self.systemctl(&["start", unit])
    }

    fn stop(&self, unit: &str) -> Result<(), ServiceError> {
        self.systemctl(&["stop", unit])
    }

    fn is_active(&self, unit: &str) -> bool {
        match Command::new("systemctl")
            .args(["is-active", unit])
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
        {
            Ok(out) => unit_state_is_alive(String::from_utf8_lossy(&out.stdout).trim()),
            Err(err) => {
                tracing::debug!(unit, error = %err, "systemctl is-active failed");
                false
            }
        }
    }
}

/// `activating` covers the `Restart=` back-off window, when the unit is
/// still going to hold the capture device.
fn unit_state_is_alive(state: &str) -> bool {
    matches!(state, "active" | "activating" | "reloading")
}

fn run(mut cmd: Command, stdin: Option<&[u8]>) -> Result<(), ServiceError> {
    let command = format!("{cmd:?}");
    cmd.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::null())
        .stderr(Stdio::piped());
    let mut child = cmd.spawn().map_err(|source| ServiceError::Spawn {
        command: command.clone(),
        source,
    })?;
    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input).map_err(|source| ServiceError::Spawn {
            command: command.clone(),
            source,
        })?;
    }
    let out = child.wait_with_output().map_err(|source| ServiceError::Spawn {
        command: command.clone(),
        source,
    })?;
    if out.status.success() {
        Ok(())
    } else {
        Err(ServiceError::Failed {
            command,
            status: out.status,
            stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct UnitSettings {
    pub unit: String,
    pub scripts_dir: PathBuf,
    pub after_unit: Option<String>,
    pub user: Option<String>,
    pub grace: Duration,
}

/// Runs the selected profile as a systemd unit, rewriting the unit file on
/// every launch so it always points at the chosen script.
pub struct ServiceSupervisor {
    manager: Box<dyn ServiceManager>,
    settings: UnitSettings,
}

impl ServiceSupervisor {
    pub fn new(manager: Box<dyn ServiceManager>, settings: UnitSettings) -> Self {
        Self { manager, settings }
    }
}

impl Supervisor for ServiceSupervisor {
    fn launch(&self, profile: &StreamProfile, env: &LaunchEnv) -> Result<RunHandle, LaunchError> {
        let unit = &self.settings.unit;
        let contents = render_unit(profile, env, &self.settings)?;
        self.manager.install(unit, &contents)?;
        self.manager.start(unit)?;
        tracing::info!(profile = profile.id, unit = %unit, "stream service started");
        Ok(RunHandle::Service(unit.clone()))
    }

    fn is_alive(&self, handle: &RunHandle) -> bool {
        match handle {
            RunHandle::Service(unit) => self.manager.is_active(unit),
            RunHandle::Process(_) => false,
        }
    }

    fn terminate(&self, handle: &RunHandle) -> Result<(), TerminationError> {
        let unit = match handle {
            RunHandle::Service(unit) => unit,
            RunHandle::Process(_) => return Ok(()),
        };
        // systemd applies TimeoutStopSec and then SIGKILLs the whole cgroup.
        self.manager.stop(unit)?;
        if self.manager.is_active(unit) {
            return Err(TerminationError::Survived(handle.clone()));
        }
        Ok(())
    }

    /// The unit name is fixed, so a unit left running by a previous boot or
    /// a lost record is still ours to stop.
    fn sweep(&self) -> Result<(), TerminationError> {
        let unit = &self.settings.unit;
        if !self.manager.is_active(unit) {
            return Ok(());
        }
        tracing::info!(unit = %unit, "stopping unrecorded stream service");
        self.terminate(&RunHandle::Service(unit.clone()))
    }
}

pub fn render_unit(
    profile: &StreamProfile,
    env: &LaunchEnv,
    settings: &UnitSettings,
) -> Result<String, ServiceError> {
    let scripts_dir = settings.scripts_dir.display().to_string();
    let exec = settings.scripts_dir.join(profile.script);
    let mut out = String::new();

    out.push_str("[Unit]\n");
    out.push_str(&format!(
        "Description=Gaming WebRTC Stream ({})\n",
        escape_specifiers(profile.name)
    ));
    if let Some(after) = &settings.after_unit {
        out.push_str(&format!("Requires={after}\nAfter={after}\n"));
    }

    out.push_str("\n[Service]\nType=simple\n");
    if let Some(user) = &settings.user {
        out.push_str(&format!("User={user}\n"));
    }
    out.push_str(&format!("WorkingDirectory={}\n", escape_specifiers(&scripts_dir)));
    for (key, value) in env.vars() {
        if value.chars().any(char::is_control) {
            return Err(ServiceError::UnsafeValue { key: *key });
        }
        out.push_str(&format!("Environment=\"{}={}\"\n", key, quote_env(value)));
    }
    out.push_str(&format!("ExecStart={}\n", escape_specifiers(&exec.display().to_string())));
    out.push_str("Restart=always\nRestartSec=5\n");
    out.push_str(&format!(
        "TimeoutStopSec={}\n",
        settings.grace.as_secs().max(1)
    ));
    out.push_str("KillMode=control-group\n");
    out.push_str("\nNoNewPrivileges=true\nPrivateTmp=true\nProtectSystem=strict\nProtectHome=true\n");
    out.push_str(&format!("ReadWritePaths={}\n", escape_specifiers(&scripts_dir)));

    out.push_str("\n[Install]\nWantedBy=multi-user.target\n");
    Ok(out)
}

fn escape_specifiers(raw: &str) -> String {
    raw.replace('%', "%%")
}

fn quote_env(raw: &str) -> String {
    escape_specifiers(&raw.replace('\\', "\\\\").replace('"', "\\\""))
}
