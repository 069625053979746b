use std::convert::Infallible;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, IntoResponse};
use axum::routing::{get, post};
use rpa_test_agent::AgentEvent;
use serde::Deserialize;
use tokio::sync::{RwLock, broadcast, mpsc};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{error, info, warn};

const PORTS: std::ops::Range<u16> = 3000..3010;

/// Markdown of the most recent run report, shared with `GET /report`.
pub type LatestReport = Arc<RwLock<Option<String>>>;

#[derive(Clone)]
struct AppState {
    commands: mpsc::Sender<String>,
    events: broadcast::Sender<AgentEvent>,
    report: LatestReport,
}

#[derive(Deserialize)]
struct CommandPayload {
    command: String,
}

pub struct Server {
    pub commands: mpsc::Receiver<String>,
    pub events: broadcast::Sender<AgentEvent>,
    pub report: LatestReport,
    pub port: u16,
}

fn to_sse(event: &AgentEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    Event::default().event(event.name()).data(data)
}

/// Binds the first free port in 3000..3010 (or `port` when given) and
/// serves the control page in the background.
pub async fn start_server(port: Option<u16>) -> Result<Server> {
    let (command_tx, commands) = mpsc::channel::<String>(8);
    let (events, _) = broadcast::channel::<AgentEvent>(256);
    let report = LatestReport::default();

    let state = Arc::new(AppState {
        commands: command_tx,
        events: events.clone(),
        report: report.clone(),
    });

    let app = Router::new()
        .route("/", get(index_handler))
        .route("/command", post(command_handler))
        .route("/events", get(sse_handler))
        .route("/report", get(report_handler))
        .route("/favicon.ico", get(|| async { StatusCode::NO_CONTENT }))
        .with_state(state);

    let candidates: Vec<u16> = match port {
        Some(port) => vec![port],
        None => PORTS.collect(),
    };
    let mut bound = None;
    for candidate in candidates {
        match tokio::net::TcpListener::bind(("127.0.0.1", candidate)).await {
            Ok(listener) => {
                bound = Some((listener, candidate));
                break;
            }
            Err(error) => warn!(port = candidate, %error, "port unavailable"),
        }
    }
    let (listener, port) =
        bound.ok_or_else(|| anyhow!("no free port for the web UI; stop the old agent first"))?;

    info!("web UI running at http://localhost:{port}");
    tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, app).await {
            error!(%error, "web server stopped");
        }
    });

    Ok(Server {
        commands,
        events,
        report,
        port,
    })
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn command_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CommandPayload>,
) -> impl IntoResponse {
    let command = payload.command.trim().to_string();
    if command.is_empty() {
        return (StatusCode::BAD_REQUEST, "empty test description");
    }
    info!(%command, "test description received");
    match state.commands.send(command).await {
        Ok(()) => (StatusCode::ACCEPTED, "queued"),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "agent stopped"),
    }
}

async fn report_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.report.read().await.clone() {
        Some(markdown) => (StatusCode::OK, markdown),
        None => (StatusCode::NOT_FOUND, "no test has run yet".to_string()),
    }
}

async fn sse_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.events.subscribe())
        .filter_map(|received| received.ok().map(|event| Ok(to_sse(&event))));
    Sse::new(stream).keep_alive(KeepAlive::default())
}

const INDEX_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<title>Web Test Agent</title>
<style>
  body { margin: 0; background: #0b0d12; color: #dde; font: 14px system-ui, sans-serif; }
  main { max-width: 860px; margin: 0 auto; padding: 24px; display: flex; flex-direction: column; gap: 12px; height: 100vh; box-sizing: border-box; }
  h1 { font-size: 18px; margin: 0; }
  #log { flex: 1; overflow-y: auto; display: flex; flex-direction: column; gap: 6px; }
  .row { padding: 8px 12px; border-radius: 6px; background: #13161e; border-left: 3px solid #3b82f6; }
  .row.pass { border-color: #22c55e; }
  .row.fail { border-color: #ef4444; color: #fca5a5; }
  .row.info { border-color: #a78bfa; }
  .row.retry { border-color: #f59e0b; }
  form { display: flex; gap: 8px; }
  textarea { flex: 1; background: #13161e; color: #fff; border: 1px solid #2a2f3a; border-radius: 6px; padding: 10px; font: inherit; }
  button { background: #4f46e5; color: #fff; border: 0; border-radius: 6px; padding: 0 20px; cursor: pointer; }
  button:disabled { background: #333; }
  a { color: #93c5fd; }
</style>
</head>
<body>
<main>
  <h1>Web Test Agent <small><a href="/report" target="_blank">latest report</a></small></h1>
  <div id="log"></div>
  <form id="form">
    <textarea id="cmd" rows="2" placeholder="Describe a test, e.g. go to the menu page and check the prices are shown"></textarea>
    <button id="send">Run</button>
  </form>
</main>
<script>
  const log = document.getElementById('log');
  const cmd = document.getElementById('cmd');
  const send = document.getElementById('send');
  const esc = t => String(t).replace(/&/g, '&amp;').replace(/</g, '&lt;');
  const row = (cls, html) => {
    const div = document.createElement('div');
    div.className = 'row ' + cls;
    div.innerHTML = html;
    log.appendChild(div);
    log.scrollTop = log.scrollHeight;
  };
  const busy = b => { cmd.disabled = b; send.disabled = b; if (!b) cmd.focus(); };

  document.getElementById('form').addEventListener('submit', async e => {
    e.preventDefault();
    const text = cmd.value.trim();
    if (!text) return;
    cmd.value = '';
    busy(true);
    await fetch('/command', {
      method: 'POST',
      headers: {'Content-Type': 'application/json'},
      body: JSON.stringify({command: text}),
    });
  });

  const es = new EventSource('/events');
  const on = (name, fn) => es.addEventListener(name, e => fn(JSON.parse(e.data)));
  on('planning', d => row('info', '<b>' + esc(d.case_id) + '</b> planning: ' + esc(d.description)));
  on('planned', d => row('info', 'Plan: ' + d.steps.map((s, i) => (i + 1) + '. ' + esc(s)).join('<br>')));
  on('step_started', d => row('', 'Step ' + (d.index + 1) + ': ' + esc(d.summary)));
  on('step_retry', d => row('retry', 'Retry ' + d.attempt + ' of step ' + (d.index + 1) + ': ' + esc(d.reason)));
  on('step_passed', d => row('pass', 'Step ' + (d.index + 1) + ' passed in ' + d.duration_ms + ' ms'));
  on('step_failed', d => row('fail', 'Step ' + (d.index + 1) + ' failed: ' + esc(d.message)));
  on('step_skipped', d => row('', 'Step ' + (d.index + 1) + ' skipped'));
  on('aborted', d => row('fail', 'Aborted: ' + esc(d.reason)));
  on('case_finished', d => row(d.success ? 'pass' : 'fail', '<b>' + esc(d.case_id) + '</b> ' + esc(d.message)));
  on('case_error', d => row('fail', '<b>' + esc(d.case_id) + '</b> ' + esc(d.message)));
  on('ready', () => busy(false));
</script>
</body>
</html>
"##;
