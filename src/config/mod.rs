use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const CONFIG_FILE: &str = "stream-panel.toml";
const ENV_PREFIX: &str = "STREAM_PANEL_";

/// How the encoder is run and tracked on this machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Deployment {
    /// Raw child process, tracked by a PID file.
    #[default]
    Container,
    /// systemd unit, tracked by unit name.
    Service,
}

impl FromStr for Deployment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "container" | "docker" => Ok(Self::Container),
            "service" | "systemd" => Ok(Self::Service),
            other => Err(format!("unknown deployment '{other}'")),
        }
    }
}

impl fmt::Display for Deployment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Container => "container",
            Self::Service => "service",
        })
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct PanelConfig {
    pub deployment: Deployment,
    pub server: ServerConfig,
    pub paths: PathsConfig,
    pub stream: StreamSettings,
    pub service: ServiceConfig,
    pub broadcast: BroadcastConfig,
    pub metrics: MetricsConfig,
    pub theme: ThemeConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub token: Option<String>,
    pub require_token: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8081,
            token: None,
            require_token: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct PathsConfig {
    pub scripts_dir: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StreamSettings {
    pub server_url: String,
    pub video_device: String,
    pub grace_ms: u64,
    pub restart_delay_ms: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8080/api/whip".to_string(),
            video_device: "/dev/video0".to_string(),
            grace_ms: 1000,
            restart_delay_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub unit: String,
    pub unit_dir: PathBuf,
    pub after_unit: Option<String>,
    pub user: Option<String>,
    pub use_sudo: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            unit: "gaming-stream-av1".to_string(),
            unit_dir: PathBuf::from("/etc/systemd/system"),
            after_unit: Some("broadcast-box.service".to_string()),
            user: None,
            use_sudo: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BroadcastConfig {
    pub base_url: String,
    pub probe_timeout_ms: u64,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            probe_timeout_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub poll_interval_ms: u64,
    pub gpu_cache_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5000,
            gpu_cache_secs: 50,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ThemeConfig {
    pub font_family: String,
    pub bg: String,
    pub panel: String,
    pub muted: String,
    pub good: String,
    pub warn: String,
    pub bad: String,
    pub line: String,
}

impl Default for ThemeConfig {
    fn default() -> Self {
        Self {
            font_family: "system-ui, sans-serif".to_string(),
            bg: "#101418".to_string(),
            panel: "#182029".to_string(),
            muted: "#8a9bb0".to_string(),
            good: "#3ccf7c".to_string(),
            warn: "#f2c744".to_string(),
            bad: "#e5484d".to_string(),
            line: "#253241".to_string(),
        }
    }
}

impl PanelConfig {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let path = active_config_path();
        let mut config = match fs::read_to_string(&path) {
            Ok(raw) => toml::from_str::<PanelConfig>(&raw)
                .map_err(|err| format!("{}: {err}", path.display()))?,
            Err(_) => Self::default(),
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(val) = env_var("DEPLOYMENT") {
            self.deployment = val.parse()?;
        }

        if let Some(val) = env_var("SERVER_HOST") {
            self.server.host = val;
        }
        if let Some(val) = env_var("SERVER_PORT") {
            self.server.port = val
                .parse()
                .map_err(|_| format!("{ENV_PREFIX}SERVER_PORT is not a port: {val}"))?;
        }
        if let Some(val) = env_var("SERVER_TOKEN") {
            self.server.token = Some(val);
        }

        if let Some(val) = env_var("SCRIPTS_DIR") {
            self.paths.scripts_dir = Some(PathBuf::from(val));
        }
        if let Some(val) = env_var("STATE_DIR") {
            self.paths.state_dir = Some(PathBuf::from(val));
        }

        if let Some(val) = env_var("WHIP_URL") {
            self.stream.server_url = val;
        }
        if let Some(val) = env_var("VIDEO_DEVICE") {
            self.stream.video_device = val;
        }

        if let Some(val) = env_var("SERVICE_UNIT") {
            self.service.unit = val;
        }
        if let Some(val) = env_var("SERVICE_USER") {
            self.service.user = Some(val);
        }
        if let Some(val) = env_var("USE_SUDO") {
            self.service.use_sudo = parse_flag("USE_SUDO", &val)?;
        }

        if let Some(val) = env_var("BROADCAST_URL") {
            self.broadcast.base_url = val;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.server.port == 0 {
            return Err("server.port must be non-zero".into());
        }
        if let Some(token) = &self.server.token {
            if token.trim().is_empty() {
                return Err("server.token must not be blank when set".into());
            }
        }
        if self.stream.grace_ms == 0 {
            return Err("stream.grace_ms must be non-zero".into());
        }
        if self.stream.server_url.trim().is_empty() {
            return Err("stream.server_url must be set".into());
        }
        if self.deployment == Deployment::Service && self.service.unit.trim().is_empty() {
            return Err("service.unit is required for the service deployment".into());
        }
        if !(1000..=5000).contains(&self.broadcast.probe_timeout_ms) {
            return Err("broadcast.probe_timeout_ms must be between 1000 and 5000".into());
        }
        if self.metrics.poll_interval_ms < 500 {
            return Err("metrics.poll_interval_ms must be >= 500".into());
        }
        Ok(())
    }

    pub fn scripts_dir(&self) -> PathBuf {
        if let Some(dir) = &self.paths.scripts_dir {
            return dir.clone();
        }
        match self.deployment {
            Deployment::Container => PathBuf::from("/app/scripts"),
            Deployment::Service => home_dir().join("streaming"),
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        if let Some(dir) = &self.paths.state_dir {
            return dir.clone();
        }
        match self.deployment {
            Deployment::Container => PathBuf::from("/app/config"),
            Deployment::Service => self.scripts_dir().join("config"),
        }
    }

    pub fn service_user(&self) -> Option<String> {
        self.service
            .user
            .clone()
            .or_else(|| env::var("USER").ok().filter(|u| !u.is_empty()))
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.stream.grace_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.stream.restart_delay_ms)
    }

    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<(), Box<dyn std::error::Error>> {
        if path.as_ref().exists() {
            return Err(format!("{} already exists", path.as_ref().display()).into());
        }
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = toml::to_string_pretty(&PanelConfig::default())?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        managed_config_path()
    }
}

fn parse_flag(name: &str, val: &str) -> Result<bool, String> {
    match val.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(format!("{ENV_PREFIX}{name} is not a boolean: {val}")),
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}{name}")).ok()
}

fn home_dir() -> PathBuf {
    env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn managed_config_path() -> PathBuf {
    if let Some(path) = env_var("CONFIG_PATH") {
        return PathBuf::from(path);
    }
    home_dir()
        .join(".config")
        .join("stream-panel")
        .join(CONFIG_FILE)
}

fn active_config_path() -> PathBuf {
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        local
    } else {
        managed_config_path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let cfg = PanelConfig::default();
        let toml = toml::to_string_pretty(&cfg).unwrap();
        let parsed: PanelConfig = toml::from_str(&toml).unwrap();
        parsed.validate().unwrap();
        assert_eq!(parsed.deployment, Deployment::Container);
        assert_eq!(parsed.server.port, 8081);
    }

    #[test]
    fn partial_toml_keeps_section_defaults() {
        let cfg: PanelConfig = toml::from_str(
            r#"
            deployment = "service"

            [stream]
            video_device = "/dev/video4"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.deployment, Deployment::Service);
        assert_eq!(cfg.stream.video_device, "/dev/video4");
        assert_eq!(cfg.stream.grace_ms, 1000);
        assert_eq!(cfg.service.unit, "gaming-stream-av1");
    }

    #[test]
    fn flags_parse_strictly() {
        assert_eq!(parse_flag("USE_SUDO", "false"), Ok(false));
        assert_eq!(parse_flag("USE_SUDO", " 1 "), Ok(true));
        assert_eq!(parse_flag("USE_SUDO", "No"), Ok(false));
        let err = parse_flag("USE_SUDO", "nope").unwrap_err();
        assert!(err.contains("STREAM_PANEL_USE_SUDO"));
    }

    #[test]
    fn validate_rejects_zero_port_and_grace() {
        let mut cfg = PanelConfig::default();
        cfg.server.port = 0;
        assert!(cfg.validate().is_err());
        cfg.server.port = 8081;
        cfg.stream.grace_ms = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_bounds_probe_timeout() {
        let mut cfg = PanelConfig::default();
        cfg.broadcast.probe_timeout_ms = 200;
        assert!(cfg.validate().is_err());
        cfg.broadcast.probe_timeout_ms = 6000;
        assert!(cfg.validate().is_err());
        cfg.broadcast.probe_timeout_ms = 5000;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_requires_unit_for_service_deployment() {
        let mut cfg = PanelConfig::default();
        cfg.service.unit = " ".to_string();
        assert!(cfg.validate().is_ok());
        cfg.deployment = Deployment::Service;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn deployment_paths() {
        let cfg = PanelConfig::default();
        assert_eq!(cfg.scripts_dir(), PathBuf::from("/app/scripts"));
        assert_eq!(cfg.state_dir(), PathBuf::from("/app/config"));

        let mut cfg = PanelConfig::default();
        cfg.deployment = Deployment::Service;
        cfg.paths.scripts_dir = Some(PathBuf::from("/srv/streaming"));
        assert_eq!(cfg.state_dir(), PathBuf::from("/srv/streaming/config"));
    }

    #[test]
    fn deployment_parses_aliases() {
        assert_eq!("systemd".parse::<Deployment>().unwrap(), Deployment::Service);
        assert_eq!("Docker".parse::<Deployment>().unwrap(), Deployment::Container);
        assert!("k8s".parse::<Deployment>().is_err());
    }

    #[test]
    fn write_default_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);
        PanelConfig::write_default(&path).unwrap();
        assert!(PanelConfig::write_default(&path).is_err());
    }
}
