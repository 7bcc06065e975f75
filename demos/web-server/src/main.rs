//! Chat server backed by the in-memory echo runtime.
//!
//! Run with: cargo run -p chat-sync-web-server
//!
//! Then open http://localhost:3000 in your browser. Set `CHAT_SYNC_CONFIG`
//! to a TOML file to override the bind address (`bind`) or polling and
//! timeout settings (`[sync]`).

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use chat_sync_bridge::{ChatService, GatewayBridge, MemoryGateway};
use chat_sync_core::{
    EventHub, Gateway, GatewayError, Message, RateTracker, RunTracker, SyncConfig,
    message::normalize_history, traits::SessionSummary,
};
use chat_sync_transport::{WsState, create_ws_router};
use serde::Deserialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Server settings: bind address plus the `[sync]` table.
#[derive(Debug, Deserialize)]
#[serde(default)]
struct ServerConfig {
    bind: SocketAddr,
    sync: SyncConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 3000)),
            sync: SyncConfig::default(),
        }
    }
}

impl ServerConfig {
    fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }
}

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    gateway: Arc<MemoryGateway>,
    history_limit: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,chat_sync=debug".into()),
        )
        .init();

    let server = match std::env::var_os("CHAT_SYNC_CONFIG").map(PathBuf::from) {
        Some(path) => ServerConfig::load(&path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => ServerConfig::default(),
    };
    tracing::debug!(?server, "loaded config");
    let config = server.sync;

    let gateway = Arc::new(MemoryGateway::new());
    let hub = Arc::new(EventHub::new());
    let runs = Arc::new(RunTracker::new());

    // Keep the sender alive: dropping it stops the bridge.
    let (_bridge_stop, _bridge_task) =
        GatewayBridge::new(Arc::clone(&hub), Arc::clone(&runs)).spawn(Arc::clone(&gateway), config.clone());

    let chat = ChatService::new(gateway.clone(), Arc::clone(&hub), runs, &config);
    let rate = Arc::new(RateTracker::new(config.rate_limit, config.rate_window()));

    let state = AppState {
        gateway,
        history_limit: config.history_limit,
    };

    // Build router
    let app = Router::new()
        .route("/", get(index_handler))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/{key}/history", get(history))
        .route("/api/sessions/{key}/reset", post(reset_session))
        .with_state(state)
        .merge(create_ws_router(WsState::new(hub, chat, rate)))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    // Start server
    let addr = server.bind;
    tracing::info!("Server listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    axum::serve(listener, app).await?;
    Ok(())
}

struct ApiError(GatewayError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = if self.0.is_retryable() {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            StatusCode::BAD_GATEWAY
        };
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        Self(e)
    }
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn list_sessions(State(state): State<AppState>) -> Result<Json<Vec<SessionSummary>>, ApiError> {
    Ok(Json(state.gateway.list_sessions().await?))
}

/// Normalized history; the browser's poll channel.
async fn history(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<Vec<Message>>, ApiError> {
    let entries = state.gateway.get_history(&key, state.history_limit).await?;
    Ok(Json(normalize_history(&key, entries)))
}

async fn reset_session(State(state): State<AppState>, Path(key): Path<String>) -> Result<StatusCode, ApiError> {
    state.gateway.reset_session(&key).await?;
    Ok(StatusCode::NO_CONTENT)
}

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>Chat Sync</title>
    <style>
        body {
            margin: 0;
            padding: 20px;
            background: #1e1e1e;
            color: #d4d4d4;
            font-family: system-ui, sans-serif;
        }
        h1 { color: #fff; margin-bottom: 10px; }
        .status { color: #888; font-size: 14px; margin-bottom: 10px; }
        .connected { color: #4a4; }
        .disconnected { color: #a44; }
        #transcript { height: calc(100vh - 180px); overflow-y: auto; }
        .msg { margin: 6px 0; white-space: pre-wrap; }
        .user { color: #9cdcfe; }
        .assistant { color: #d4d4d4; }
        .failed { color: #a44; }
        .streaming { color: #888; font-style: italic; }
        #notice { color: #e8a33d; min-height: 18px; }
        input { width: 70%; padding: 6px; }
    </style>
</head>
<body>
    <h1>Chat Sync</h1>
    <div class="status" id="status">Connecting...</div>
    <div id="transcript"></div>
    <div id="notice"></div>
    <input id="input" placeholder="Say something" autofocus />
    <button id="abort">Stop</button>

    <script>
        const sessionKey = 'main';
        const FAST_MS = 1000, IDLE_MS = 5000;
        const status = document.getElementById('status');
        const transcript = document.getElementById('transcript');
        const notice = document.getElementById('notice');
        let ws, messages = [], streaming = '', awaiting = false, pollTimer;

        function render() {
            transcript.innerHTML = '';
            for (const m of messages) {
                const div = document.createElement('div');
                div.className = 'msg ' + m.role + (m.failed ? ' failed' : '');
                div.textContent = (m.role === 'user' ? '> ' : '') + m.content;
                transcript.appendChild(div);
            }
            if (streaming) {
                const div = document.createElement('div');
                div.className = 'msg streaming';
                div.textContent = streaming;
                transcript.appendChild(div);
            }
            transcript.scrollTop = transcript.scrollHeight;
        }

        function schedulePoll() {
            clearTimeout(pollTimer);
            pollTimer = setTimeout(poll, awaiting ? FAST_MS : IDLE_MS);
        }

        async function poll() {
            try {
                const res = await fetch(`/api/sessions/${sessionKey}/history`);
                const history = await res.json();
                const assistants = l => l.filter(m => m.role === 'assistant').length;
                const known = new Set(messages.map(m => m.id));
                if (history.some(m => !known.has(m.id)) || assistants(history) > assistants(messages)) {
                    if (awaiting && assistants(history) > assistants(messages)) {
                        awaiting = false;
                        streaming = '';
                    }
                    messages = history;
                    render();
                }
            } catch (e) {
                console.error('poll failed', e);
            }
            schedulePoll();
        }

        function connect() {
            const protocol = window.location.protocol === 'https:' ? 'wss:' : 'ws:';
            ws = new WebSocket(`${protocol}//${window.location.host}/ws`);

            ws.onopen = () => {
                status.textContent = 'Connected';
                status.className = 'status connected';
            };

            ws.onclose = () => {
                status.textContent = 'Disconnected - reconnecting...';
                status.className = 'status disconnected';
                setTimeout(connect, 2000);
            };

            ws.onmessage = (event) => {
                const msg = JSON.parse(event.data);
                if (msg.sessionKey && msg.sessionKey !== sessionKey) return;
                if (msg.type === 'token') {
                    streaming = msg.token;
                } else if (msg.type === 'message') {
                    const last = messages.filter(m => m.role === 'assistant').pop();
                    if (!messages.some(m => m.id === msg.id) && !(last && last.content === msg.content)) {
                        messages.push(msg);
                    }
                    streaming = '';
                    awaiting = false;
                    schedulePoll();
                } else if (msg.type === 'status' && msg.status === 'idle') {
                    streaming = '';
                    if (awaiting) { awaiting = false; poll(); }
                } else if (msg.type === 'error') {
                    notice.textContent = msg.error;
                    setTimeout(() => { notice.textContent = ''; }, 8000);
                    awaiting = false;
                }
                render();
            };
        }

        document.getElementById('input').addEventListener('keydown', (e) => {
            if (e.key !== 'Enter' || !e.target.value.trim()) return;
            const text = e.target.value.trim();
            e.target.value = '';
            messages.push({ id: 'local-' + crypto.randomUUID(), role: 'user', content: text });
            awaiting = true;
            render();
            ws.send(JSON.stringify({
                type: 'send', sessionKey, message: text, idempotencyKey: crypto.randomUUID()
            }));
            schedulePoll();
        });

        document.getElementById('abort').addEventListener('click', () => {
            ws.send(JSON.stringify({ type: 'abort', sessionKey }));
            if (streaming) {
                messages.push({ id: 'aborted-' + crypto.randomUUID(), role: 'assistant', content: streaming + '\n\n[aborted]' });
            }
            streaming = '';
            awaiting = false;
            render();
        });

        connect();
        poll();
    </script>
</body>
</html>
"#;
