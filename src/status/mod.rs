use crate::controller::StreamController;
use reqwest::{Client, Url};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

const STATUS_PATH: &str = "api/status";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub streaming: bool,
    pub broadcast_box: bool,
    pub stream_info: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeOutcome {
    pub reachable: bool,
    pub info: Option<Value>,
}

/// Asks the broadcast server for its status. Never errors: anything short of
/// an HTTP response is reported as unreachable.
#[derive(Debug, Clone)]
pub struct BroadcastProbe {
    http: Client,
    status_url: Url,
}

impl BroadcastProbe {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, Box<dyn std::error::Error>> {
        let mut base = Url::parse(base_url.trim())?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path().trim_end_matches('/'));
            base.set_path(&path);
        }
        let status_url = base.join(STATUS_PATH)?;
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self { http, status_url })
    }

    pub fn status_url(&self) -> &Url {
        &self.status_url
    }

    pub async fn probe(&self) -> ProbeOutcome {
        let resp = match self.http.get(self.status_url.clone()).send().await {
            Ok(resp) => resp,
            Err(err) => {
                tracing::debug!(url = %self.status_url, error = %err, "broadcast endpoint unreachable");
                return ProbeOutcome::default();
            }
        };
        let status = resp.status();
        let info = if status.is_success() {
            match resp.text().await {
                Ok(body) => serde_json::from_str::<Value>(&body)
                    .map_err(|err| {
                        tracing::debug!(url = %self.status_url, error = %err, "broadcast status is not json");
                    })
                    .ok(),
                Err(err) => {
                    tracing::debug!(url = %self.status_url, error = %err, "broadcast status body unreadable");
                    None
                }
            }
        } else {
            tracing::debug!(url = %self.status_url, status = status.as_u16(), "broadcast status returned error");
            None
        };
        ProbeOutcome {
            reachable: true,
            info,
        }
    }
}

pub struct StatusAggregator {
    controller: Arc<StreamController>,
    probe: BroadcastProbe,
}

impl StatusAggregator {
    pub fn new(controller: Arc<StreamController>, probe: BroadcastProbe) -> Self {
        Self { controller, probe }
    }

    /// Local liveness and the remote probe run side by side.
    pub async fn snapshot(&self) -> StatusSnapshot {
        let controller = self.controller.clone();
        let local = tokio::task::spawn_blocking(move || controller.is_running());
        let (local, remote) = tokio::join!(local, self.probe.probe());
        let streaming = local.unwrap_or_else(|err| {
            tracing::warn!(error = %err, "liveness check panicked");
            false
        });
        StatusSnapshot {
            streaming,
            broadcast_box: remote.reachable,
            stream_info: remote.info,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Deployment;
    use crate::controller::LaunchSettings;
    use crate::store::ConfigStore;
    use crate::supervisor::ProcessSupervisor;
    use crate::tracker::{HandleTracker, PID_RECORD_FILE};
    use axum::{http::StatusCode, routing::get, Json, Router};
    use std::net::SocketAddr;
    use std::path::Path;
    use tokio::net::TcpListener;

    async fn serve(app: Router) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        addr
    }

    async fn closed_port() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    fn probe_for(addr: SocketAddr) -> BroadcastProbe {
        BroadcastProbe::new(&format!("http://{addr}"), Duration::from_secs(1)).unwrap()
    }

    fn controller(dir: &Path) -> Arc<StreamController> {
        let sup = Arc::new(ProcessSupervisor::new(dir, Duration::from_millis(100)));
        Arc::new(StreamController::new(
            ConfigStore::new(dir, Deployment::Container),
            HandleTracker::new(dir.join(PID_RECORD_FILE), sup.clone()),
            sup,
            LaunchSettings {
                server_url: "http://localhost:8080/api/whip".to_string(),
                video_device: "/dev/video0".to_string(),
                restart_delay: Duration::ZERO,
            },
        ))
    }

    #[test]
    fn status_url_joins_base_path() {
        let p = BroadcastProbe::new("http://localhost:8080", Duration::from_secs(2)).unwrap();
        assert_eq!(p.status_url().as_str(), "http://localhost:8080/api/status");
        let p = BroadcastProbe::new("http://box.lan/bb", Duration::from_secs(2)).unwrap();
        assert_eq!(p.status_url().as_str(), "http://box.lan/bb/api/status");
    }

    #[tokio::test]
    async fn unreachable_endpoint_degrades_quietly() {
        let addr = closed_port().await;
        let out = probe_for(addr).probe().await;
        assert_eq!(out, ProbeOutcome::default());
    }

    #[tokio::test]
    async fn json_status_is_returned() {
        let app = Router::new().route(
            "/api/status",
            get(|| async { Json(serde_json::json!([{"streamKey": "gaming", "videoStreams": 1}])) }),
        );
        let out = probe_for(serve(app).await).probe().await;
        assert!(out.reachable);
        assert_eq!(out.info.unwrap()[0]["streamKey"], "gaming");
    }

    #[tokio::test]
    async fn malformed_body_keeps_reachability_but_drops_info() {
        let app = Router::new()
            .route("/api/status", get(|| async { "<html>not json</html>" }));
        let out = probe_for(serve(app).await).probe().await;
        assert!(out.reachable);
        assert!(out.info.is_none());

        let app = Router::new().route(
            "/api/status",
            get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "{}") }),
        );
        let out = probe_for(serve(app).await).probe().await;
        assert!(out.reachable);
        assert!(out.info.is_none());
    }

    #[tokio::test]
    async fn snapshot_combines_local_and_remote() {
        let dir = tempfile::tempdir().unwrap();
        let agg = StatusAggregator::new(controller(dir.path()), probe_for(closed_port().await));
        let snap = agg.snapshot().await;
        assert_eq!(
            snap,
            StatusSnapshot {
                streaming: false,
                broadcast_box: false,
                stream_info: None,
            }
        );
    }
}
