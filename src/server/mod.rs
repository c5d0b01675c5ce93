use crate::catalog;
use crate::config::ThemeConfig;
use crate::controller::{ControlError, StreamController, StreamState};
use crate::metrics::SystemStats;
use crate::status::StatusAggregator;
use crate::store::StreamConfig;
use axum::{
    extract::{Query, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::HashMap, future::Future, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tokio::sync::watch;

#[derive(Clone)]
pub struct ServerState {
    pub controller: Arc<StreamController>,
    pub status: Arc<StatusAggregator>,
    pub stats_rx: watch::Receiver<SystemStats>,
    pub scripts_dir: PathBuf,
    pub token: Option<String>,
    pub theme: ThemeConfig,
    pub poll_interval: Duration,
}

/// Uniform result body for lifecycle and config calls.
#[derive(Debug, Serialize, PartialEq)]
pub struct ActionResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub streaming: Option<bool>,
}

impl ActionResult {
    fn ok() -> Self {
        Self {
            success: true,
            error: None,
            streaming: None,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            streaming: None,
        }
    }
}

impl From<Result<(), ControlError>> for ActionResult {
    fn from(res: Result<(), ControlError>) -> Self {
        match res {
            Ok(()) => Self::ok(),
            Err(err) => Self::failed(err.to_string()),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct StreamRequest {
    script_id: Option<String>,
    config: Option<Value>,
}

pub fn router(state: ServerState) -> Router {
    let state = Arc::new(state);
    let guarded = Router::new()
        .route("/", get(index_page))
        .route("/api/stats", get(api_stats))
        .route("/api/status", get(api_status))
        .route("/api/config", get(get_config).post(post_config))
        .route("/api/stream/start", post(start_stream))
        .route("/api/stream/stop", post(stop_stream))
        .route("/api/stream/restart", post(restart_stream))
        .route("/api/stream/toggle", post(toggle_stream))
        .route("/api/scripts", get(api_scripts))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .route("/health", get(health_check))
        .merge(guarded)
        .with_state(state)
}

pub async fn start(
    addr: SocketAddr,
    state: ServerState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "control panel listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn require_token(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    match state.token.as_deref() {
        Some(token) if !is_token_valid(&headers, &query, token) => {
            (StatusCode::UNAUTHORIZED, Json(ActionResult::failed("unauthorized"))).into_response()
        }
        _ => next.run(request).await,
    }
}

fn is_token_valid(headers: &HeaderMap, query: &HashMap<String, String>, token: &str) -> bool {
    if let Some(auth_header) = headers.get("authorization") {
        if let Ok(auth_str) = auth_header.to_str() {
            if let Some(provided) = auth_str.strip_prefix("Bearer ") {
                return provided == token;
            }
        }
    }
    query.get("token").map(|t| t == token).unwrap_or(false)
}

async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "healthy",
            "timestamp": std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs()
        })),
    )
}

async fn api_stats(State(state): State<Arc<ServerState>>) -> Json<SystemStats> {
    Json(state.stats_rx.borrow().clone())
}

async fn api_status(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(state.status.snapshot().await)
}

async fn api_scripts(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let scripts_dir = state.scripts_dir.clone();
    let supported = tokio::task::spawn_blocking(move || catalog::availability(&scripts_dir))
        .await
        .unwrap_or_default();
    Json(serde_json::json!({
        "scripts": catalog::by_id(),
        "supported": supported,
    }))
}

async fn get_config(State(state): State<Arc<ServerState>>) -> Json<StreamConfig> {
    Json(state.controller.store().load())
}

async fn post_config(
    State(state): State<Arc<ServerState>>,
    Json(patch): Json<Value>,
) -> Json<ActionResult> {
    let store = state.controller.store();
    let Some(config) = store.load().merged(&patch) else {
        return Json(ActionResult::failed("config must be an object of valid stream settings"));
    };
    match store.save(&config) {
        Ok(()) => Json(ActionResult::ok()),
        Err(err) => {
            tracing::warn!(error = %err, "failed to save stream config");
            Json(ActionResult::failed(format!("failed to save config: {err}")))
        }
    }
}

/// The stored config with any request overrides applied.
fn request_config(state: &ServerState, patch: Option<&Value>) -> Result<StreamConfig, ActionResult> {
    let stored = state.controller.store().load();
    match patch {
        None | Some(Value::Null) => Ok(stored),
        Some(patch) => stored
            .merged(patch)
            .ok_or_else(|| ActionResult::failed("config must be an object of valid stream settings")),
    }
}

async fn start_stream(
    State(state): State<Arc<ServerState>>,
    payload: Option<Json<StreamRequest>>,
) -> Json<ActionResult> {
    let req = payload.map(|Json(req)| req).unwrap_or_default();
    let config = match request_config(&state, req.config.as_ref()) {
        Ok(config) => config,
        Err(result) => return Json(result),
    };
    let profile = req.script_id.unwrap_or_default();
    let controller = state.controller.clone();
    Json(lifecycle(move || controller.start(&profile, config).into()).await)
}

async fn stop_stream(State(state): State<Arc<ServerState>>) -> Json<ActionResult> {
    let controller = state.controller.clone();
    Json(lifecycle(move || controller.stop().into()).await)
}

async fn restart_stream(State(state): State<Arc<ServerState>>) -> Json<ActionResult> {
    let controller = state.controller.clone();
    Json(lifecycle(move || controller.restart().into()).await)
}

async fn toggle_stream(
    State(state): State<Arc<ServerState>>,
    payload: Option<Json<StreamRequest>>,
) -> Json<ActionResult> {
    let req = payload.map(|Json(req)| req).unwrap_or_default();
    let config = match request_config(&state, req.config.as_ref()) {
        Ok(config) => config,
        Err(result) => return Json(result),
    };
    let profile = req.script_id.unwrap_or_default();
    let controller = state.controller.clone();
    Json(
        lifecycle(move || match controller.toggle(&profile, config) {
            Ok(new_state) => ActionResult {
                streaming: Some(new_state == StreamState::Running),
                ..ActionResult::ok()
            },
            Err(err) => ActionResult::failed(err.to_string()),
        })
        .await,
    )
}

/// Lifecycle calls block on process spawns and grace periods, so they run
/// on the blocking pool.
async fn lifecycle<F>(op: F) -> ActionResult
where
    F: FnOnce() -> ActionResult + Send + 'static,
{
    match tokio::task::spawn_blocking(op).await {
        Ok(result) => result,
        Err(err) => {
            tracing::error!(error = %err, "lifecycle task failed");
            ActionResult::failed("internal error")
        }
    }
}

async fn index_page(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let html = r##"<!doctype html>
<html>
<head>
  <meta charset="utf-8" />
  <title>Stream Control</title>
  <style>
    :root { {{THEME_VARS}} }
    body { margin: 0; font-family: var(--font); background: var(--bg); color: #e6edf5; }
    .wrap { max-width: 760px; margin: 24px auto; padding: 0 16px; }
    h1 { font-size: 20px; }
    h2 { font-size: 15px; margin-top: 24px; border-top: 1px solid var(--line); padding-top: 14px; }
    .row { display: flex; gap: 10px; align-items: center; flex-wrap: wrap; }
    .badge { padding: 4px 8px; background: var(--panel); border: 1px solid var(--line); border-radius: 4px; font-size: 12px; }
    .live { border-color: var(--good); color: var(--good); }
    .down { border-color: var(--bad); color: var(--bad); }
    .scripts { display: grid; gap: 6px; }
    .script { background: var(--panel); border: 1px solid var(--line); border-radius: 6px; padding: 8px 10px; font-size: 13px; }
    .script.unavailable { opacity: 0.45; }
    .script .meta { color: var(--muted); font-size: 11px; }
    .rec { color: var(--warn); font-size: 11px; margin-left: 6px; }
    label { display: block; font-size: 12px; color: var(--muted); margin-top: 10px; }
    input { width: 100%; box-sizing: border-box; padding: 6px 8px; background: var(--panel); border: 1px solid var(--line); border-radius: 4px; color: #e6edf5; }
    button { margin-top: 14px; margin-right: 6px; padding: 8px 16px; background: var(--good); color: #0b0e12; border: none; border-radius: 4px; font-weight: bold; cursor: pointer; }
    button.secondary { background: var(--panel); color: #e6edf5; border: 1px solid var(--line); }
    #msg { margin-top: 10px; font-size: 13px; min-height: 18px; }
  </style>
</head>
<body>
  <div class="wrap">
    <h1>Stream Control</h1>
    <div class="row">
      <div class="badge" id="stream">Stream: --</div>
      <div class="badge" id="broadcast">Broadcast Box: --</div>
      <div class="badge" id="sys">SYS: --</div>
      <div class="badge" id="gpu">GPU: --</div>
    </div>
    <div>
      <button id="toggle">Start / Stop</button>
      <button id="restart" class="secondary">Restart</button>
    </div>
    <div id="msg"></div>

    <h2>Encoder</h2>
    <div class="scripts" id="scripts"></div>

    <h2>Settings</h2>
    <form id="cfg">
      <label for="bitrate">Video bitrate (kbps)</label><input id="bitrate" name="bitrate" type="number" />
      <label for="resolution">Resolution</label><input id="resolution" name="resolution" type="text" />
      <label for="fps">Frame rate</label><input id="fps" name="fps" type="number" />
      <label for="audio_bitrate">Audio bitrate (kbps)</label><input id="audio_bitrate" name="audio_bitrate" type="number" />
      <label for="stream_key">Stream key</label><input id="stream_key" name="stream_key" type="password" />
      <label><input id="auto_start" name="auto_start" type="checkbox" style="width:auto" /> Start streaming when the panel boots</label>
      <button type="submit">Save</button>
    </form>
  </div>
  <script>
    const token = new URLSearchParams(window.location.search).get("token") || {{TOKEN}};
    const headers = { "Content-Type": "application/json" };
    if (token) headers["Authorization"] = "Bearer " + token;
    const msg = document.getElementById("msg");
    let selected = null;

    async function call(method, path, body) {
      const res = await fetch(path, { method, headers, body: body ? JSON.stringify(body) : undefined });
      return res.json();
    }

    function report(result) {
      msg.textContent = result.success ? "OK" : ("Error: " + result.error);
      msg.style.color = result.success ? "var(--good)" : "var(--bad)";
    }

    async function refreshStatus() {
      const s = await call("GET", "/api/status");
      const el = document.getElementById("stream");
      el.textContent = "Stream: " + (s.streaming ? "LIVE" : "STOPPED");
      el.className = "badge " + (s.streaming ? "live" : "down");
      const bb = document.getElementById("broadcast");
      bb.textContent = "Broadcast Box: " + (s.broadcast_box ? "UP" : "DOWN");
      bb.className = "badge " + (s.broadcast_box ? "live" : "down");
    }

    async function refreshStats() {
      const s = await call("GET", "/api/stats");
      document.getElementById("sys").textContent =
        `SYS: CPU ${s.cpu.toFixed(0)}% | MEM ${s.memory.toFixed(0)}%`;
      document.getElementById("gpu").textContent = s.gpu
        ? `GPU: ${s.gpu.name} ${s.gpu.utilization}% ${s.gpu.temperature}C`
        : "GPU: n/a";
    }

    async function loadScripts() {
      const data = await call("GET", "/api/scripts");
      const box = document.getElementById("scripts");
      box.innerHTML = "";
      Object.entries(data.scripts).forEach(([id, s]) => {
        const row = document.createElement("label");
        row.className = "script" + (data.supported[id] ? "" : " unavailable");
        const radio = document.createElement("input");
        radio.type = "radio";
        radio.name = "script";
        radio.value = id;
        radio.style.width = "auto";
        radio.disabled = !data.supported[id];
        radio.checked = id === selected;
        radio.onchange = () => { selected = id; };
        row.appendChild(radio);
        row.appendChild(document.createTextNode(" " + s.name));
        if (s.recommended) {
          const rec = document.createElement("span");
          rec.className = "rec";
          rec.textContent = "recommended";
          row.appendChild(rec);
        }
        const meta = document.createElement("div");
        meta.className = "meta";
        meta.textContent = `${s.codec} | ${s.type} | ${s.script}`;
        row.appendChild(meta);
        box.appendChild(row);
      });
    }

    async function loadConfig() {
      const cfg = await call("GET", "/api/config");
      selected = cfg.selected_script;
      ["bitrate", "resolution", "fps", "audio_bitrate", "stream_key"].forEach(k => {
        document.getElementById(k).value = cfg[k];
      });
      document.getElementById("auto_start").checked = cfg.auto_start;
    }

    function formConfig() {
      return {
        selected_script: selected,
        bitrate: Number(document.getElementById("bitrate").value),
        resolution: document.getElementById("resolution").value,
        fps: Number(document.getElementById("fps").value),
        audio_bitrate: Number(document.getElementById("audio_bitrate").value),
        stream_key: document.getElementById("stream_key").value,
        auto_start: document.getElementById("auto_start").checked,
      };
    }

    document.getElementById("cfg").addEventListener("submit", async (e) => {
      e.preventDefault();
      report(await call("POST", "/api/config", formConfig()));
    });
    document.getElementById("toggle").onclick = async () => {
      report(await call("POST", "/api/stream/toggle", { script_id: selected, config: formConfig() }));
      refreshStatus();
    };
    document.getElementById("restart").onclick = async () => {
      msg.textContent = "Restarting...";
      report(await call("POST", "/api/stream/restart"));
      refreshStatus();
    };

    loadConfig().then(loadScripts);
    refreshStatus();
    refreshStats();
    setInterval(refreshStatus, {{POLL_MS}});
    setInterval(refreshStats, {{POLL_MS}});
  </script>
</body>
</html>"##;
    let token = serde_json::to_string(&state.token).unwrap_or_else(|_| "null".to_string());
    let poll_ms = state.poll_interval.as_millis().to_string();
    let html = html
        .replace("{{THEME_VARS}}", &theme_css(&state.theme))
        .replace("{{TOKEN}}", &html_script_escape(&token))
        .replace("{{POLL_MS}}", &poll_ms);
    Html(html)
}

/// Keeps a JSON literal from closing the surrounding script element.
fn html_script_escape(s: &str) -> String {
    s.replace('<', "\\u003c").replace('>', "\\u003e").replace('&', "\\u0026")
}

fn theme_css(theme: &ThemeConfig) -> String {
    format!(
        "--font: {}; --bg: {}; --panel: {}; --muted: {}; --good: {}; --warn: {}; --bad: {}; --line: {};",
        theme.font_family,
        theme.bg,
        theme.panel,
        theme.muted,
        theme.good,
        theme.warn,
        theme.bad,
        theme.line
    )
}
