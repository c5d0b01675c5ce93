use crate::catalog;
use crate::config::{Deployment, PanelConfig};
use crate::controller::{LaunchSettings, StreamController};
use crate::metrics::{GpuCache, MetricsCollector, SystemClock, SystemStats};
use crate::server::ServerState;
use crate::status::{BroadcastProbe, StatusAggregator};
use crate::store::ConfigStore;
use crate::supervisor::{ProcessSupervisor, ServiceSupervisor, Supervisor, Systemctl, UnitSettings};
use crate::tracker::{HandleTracker, PID_RECORD_FILE, UNIT_RECORD_FILE};
use rand::{distributions::Alphanumeric, Rng};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Duration;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let command = args.next();

    if command.as_deref() == Some("config-init") {
        return handle_config_init();
    }

    let config = PanelConfig::load()?;
    let controller = Arc::new(build_controller(&config));

    if let Some(command) = command {
        return match command.as_str() {
            "status" => handle_status(&config, controller).await,
            "scripts" => handle_scripts(&config),
            "start" => {
                let profile = args.next().unwrap_or_default();
                handle_lifecycle(move || {
                    let stored = controller.store().load();
                    controller.start(&profile, stored)
                })
                .await
            }
            "stop" => handle_lifecycle(move || controller.stop()).await,
            "restart" => handle_lifecycle(move || controller.restart()).await,
            other => Err(format!(
                "unknown command '{other}' (expected config-init, status, scripts, start <id>, stop, restart)"
            )
            .into()),
        };
    }

    let status = Arc::new(StatusAggregator::new(
        controller.clone(),
        BroadcastProbe::new(&config.broadcast.base_url, probe_timeout(&config))?,
    ));

    let (stats_tx, stats_rx) = watch::channel(SystemStats::default());
    let metrics_task = spawn_metrics(&config, stats_tx);

    auto_start(controller.clone()).await;

    let token = match config.server.token.clone() {
        Some(token) => Some(token),
        None if config.server.require_token => Some(generate_token(32)),
        None => None,
    };

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    match &token {
        Some(token) => println!("Control panel: http://{addr}/?token={token}"),
        None => println!("Control panel: http://{addr}/"),
    }
    tracing::info!(
        deployment = %config.deployment,
        scripts_dir = %config.scripts_dir().display(),
        state_dir = %config.state_dir().display(),
        "panel starting"
    );

    let state = ServerState {
        controller,
        status,
        stats_rx,
        scripts_dir: config.scripts_dir(),
        token,
        theme: config.theme.clone(),
        poll_interval: Duration::from_millis(config.metrics.poll_interval_ms),
    };

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown: ctrl-c");
    };
    let res = crate::server::start(addr, state, shutdown).await;
    metrics_task.abort();
    res
}

/// Wires the supervisor backend for the configured deployment.
pub fn build_controller(config: &PanelConfig) -> StreamController {
    let scripts_dir = config.scripts_dir();
    let state_dir = config.state_dir();

    let (supervisor, record_file): (Arc<dyn Supervisor>, &str) = match config.deployment {
        Deployment::Container => (
            Arc::new(ProcessSupervisor::new(&scripts_dir, config.grace())),
            PID_RECORD_FILE,
        ),
        Deployment::Service => (
            Arc::new(ServiceSupervisor::new(
                Box::new(Systemctl::new(&config.service.unit_dir, config.service.use_sudo)),
                UnitSettings {
                    unit: config.service.unit.clone(),
                    scripts_dir: scripts_dir.clone(),
                    after_unit: config.service.after_unit.clone(),
                    user: config.service_user(),
                    grace: config.grace(),
                },
            )),
            UNIT_RECORD_FILE,
        ),
    };

    StreamController::new(
        ConfigStore::new(&state_dir, config.deployment),
        HandleTracker::new(state_dir.join(record_file), supervisor.clone()),
        supervisor,
        LaunchSettings {
            server_url: config.stream.server_url.clone(),
            video_device: config.stream.video_device.clone(),
            restart_delay: config.restart_delay(),
        },
    )
}

fn probe_timeout(config: &PanelConfig) -> Duration {
    Duration::from_millis(config.broadcast.probe_timeout_ms)
}

fn spawn_metrics(config: &PanelConfig, tx: watch::Sender<SystemStats>) -> tokio::task::JoinHandle<()> {
    let poll = Duration::from_millis(config.metrics.poll_interval_ms);
    let gpu_ttl = Duration::from_secs(config.metrics.gpu_cache_secs);
    tokio::spawn(async move {
        let mut collector = Some(MetricsCollector::new(GpuCache::new(gpu_ttl), Box::new(SystemClock)));
        let mut ticker = tokio::time::interval(poll);
        loop {
            ticker.tick().await;
            let Some(mut hub) = collector.take() else {
                break;
            };
            // GPU queries may shell out, so collection runs off the runtime.
            match tokio::task::spawn_blocking(move || {
                let stats = hub.collect();
                (hub, stats)
            })
            .await
            {
                Ok((hub, stats)) => {
                    collector = Some(hub);
                    if tx.send(stats).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    tracing::error!(error = %err, "metrics collection panicked");
                    break;
                }
            }
        }
    })
}

async fn auto_start(controller: Arc<StreamController>) {
    let stored = controller.store().load();
    if !stored.auto_start {
        return;
    }
    let profile = stored.selected_script.clone();
    tracing::info!(profile = %profile, "auto-starting stream");
    let res = tokio::task::spawn_blocking(move || controller.start(&profile, stored)).await;
    match res {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::warn!(error = %err, "auto-start failed"),
        Err(err) => tracing::warn!(error = %err, "auto-start task failed"),
    }
}

fn handle_config_init() -> Result<(), Box<dyn std::error::Error>> {
    let path = PanelConfig::default_path();
    PanelConfig::write_default(&path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}

async fn handle_status(
    config: &PanelConfig,
    controller: Arc<StreamController>,
) -> Result<(), Box<dyn std::error::Error>> {
    let probe = BroadcastProbe::new(&config.broadcast.base_url, probe_timeout(config))?;
    let snapshot = StatusAggregator::new(controller, probe).snapshot().await;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

fn handle_scripts(config: &PanelConfig) -> Result<(), Box<dyn std::error::Error>> {
    let supported = catalog::availability(&config.scripts_dir());
    let listing = serde_json::json!({
        "scripts": catalog::by_id(),
        "supported": supported,
    });
    println!("{}", serde_json::to_string_pretty(&listing)?);
    Ok(())
}

async fn handle_lifecycle<F>(op: F) -> Result<(), Box<dyn std::error::Error>>
where
    F: FnOnce() -> Result<(), crate::controller::ControlError> + Send + 'static,
{
    tokio::task::spawn_blocking(op).await??;
    println!("ok");
    Ok(())
}

fn generate_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::StreamState;
    use crate::store::StreamConfig;
    use std::path::PathBuf;

    fn container_config(dir: &std::path::Path) -> PanelConfig {
        let mut config = PanelConfig::default();
        config.paths.scripts_dir = Some(dir.to_path_buf());
        config.paths.state_dir = Some(dir.join("state"));
        config
    }

    #[test]
    fn generated_tokens_are_alphanumeric() {
        let token = generate_token(32);
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(token, generate_token(32));
    }

    #[test]
    fn container_controller_uses_state_dir() {
        let dir = tempfile::tempdir().unwrap();
        let controller = build_controller(&container_config(dir.path()));
        assert_eq!(
            controller.store().path(),
            dir.path().join("state").join(crate::store::STREAM_CONFIG_FILE)
        );
        assert_eq!(controller.store().load(), StreamConfig::defaults_for(Deployment::Container));
        assert_eq!(controller.state(), StreamState::Stopped);
    }

    #[test]
    fn service_controller_uses_service_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = container_config(dir.path());
        config.deployment = Deployment::Service;
        config.service.unit_dir = PathBuf::from(dir.path());
        let controller = build_controller(&config);
        assert_eq!(controller.store().load().selected_script, "av1-optiplex");
        assert!(!controller.is_running());
    }

    #[tokio::test]
    async fn auto_start_skips_when_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let controller = Arc::new(build_controller(&container_config(dir.path())));
        auto_start(controller.clone()).await;
        assert!(!controller.is_running());
        assert!(!dir.path().join("state").join(PID_RECORD_FILE).exists());
    }

    #[tokio::test]
    async fn auto_start_failure_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let controller = Arc::new(build_controller(&container_config(dir.path())));
        let cfg = StreamConfig {
            auto_start: true,
            ..controller.store().load()
        };
        controller.store().save(&cfg).unwrap();
        // no scripts exist in the temp dir, so the launch fails
        auto_start(controller.clone()).await;
        assert!(!controller.is_running());
    }
}
