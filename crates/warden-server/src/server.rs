use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use warden_core::delta::StreamDelta;
use warden_core::ids::SessionId;
use warden_core::Broker;
use warden_engine::{AgentScheduler, PermissionGate, ToolCallLedger};
use warden_telemetry::MetricsRecorder;

use crate::auth::{self, TokenVerifier, WsParams};
use crate::buffer::{spawn_pruner, DeliveryBuffer};
use crate::error::ServerError;
use crate::event_bridge::{BridgeCommand, BridgeSources, EventBridge};
use crate::handlers::SessionHandler;
use crate::router::ConnectionRouter;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub send_queue: usize,
    pub heartbeat_interval: Duration,
    pub client_timeout: Duration,
    pub disconnect_grace: Duration,
    pub prune_interval: Duration,
    /// Accept unauthenticated connections when no verifier is configured.
    pub auth_disabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 9091,
            send_queue: 256,
            heartbeat_interval: Duration::from_secs(30),
            client_timeout: Duration::from_secs(90),
            disconnect_grace: Duration::from_secs(30),
            prune_interval: Duration::from_secs(60),
            auth_disabled: false,
        }
    }
}

/// Engine components the server drives.
#[derive(Clone)]
pub struct Services {
    pub scheduler: Arc<AgentScheduler>,
    pub gate: Arc<PermissionGate>,
    pub ledger: Arc<ToolCallLedger>,
    pub deltas: Broker<StreamDelta>,
    pub buffer: Arc<DeliveryBuffer>,
    pub metrics: Arc<MetricsRecorder>,
}

#[derive(Clone)]
pub struct AppState {
    router: ConnectionRouter,
    verifier: Option<Arc<dyn TokenVerifier>>,
    bridge: mpsc::Sender<BridgeCommand>,
    services: Services,
    heartbeat: Duration,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Bind, wire the engine to the socket layer, and serve in the background.
pub async fn start(
    config: ServerConfig,
    services: Services,
    verifier: Option<Arc<dyn TokenVerifier>>,
) -> Result<ServerHandle, ServerError> {
    if verifier.is_none() && !config.auth_disabled {
        return Err(ServerError::AuthNotConfigured);
    }
    if verifier.is_none() {
        warn!("authentication disabled, accepting every connection");
    }

    let cancel = CancellationToken::new();
    let router = ConnectionRouter::with_metrics(config.send_queue, Arc::clone(&services.metrics));
    let (bridge_tx, bridge_rx) = mpsc::channel(256);

    let handler = Arc::new(SessionHandler::new(
        Arc::clone(&services.scheduler),
        Arc::clone(&services.gate),
        Arc::clone(&services.ledger),
        Arc::clone(&services.buffer),
        router.clone(),
        bridge_tx.clone(),
        config.disconnect_grace,
    ));
    router.set_message_handler(handler.clone());
    router.set_disconnect_handler(handler.clone());

    let sources = BridgeSources {
        deltas: services.deltas.subscribe(),
        tool_calls: services.ledger.subscribe(),
        requests: services.gate.subscribe_requests(),
        notifications: services.gate.subscribe_notifications(),
        tasks: services.scheduler.subscribe(),
    };
    let bridge = EventBridge::new(
        router.clone(),
        Arc::clone(&services.buffer),
        Arc::clone(&services.gate),
    )
    .start(sources, bridge_rx, cancel.clone());

    let cleanup = router.spawn_cleanup(
        config.heartbeat_interval,
        config.client_timeout,
        cancel.clone(),
    );
    let pruner = spawn_pruner(
        Arc::clone(&services.buffer),
        config.prune_interval,
        cancel.clone(),
    );

    let state = AppState {
        router: router.clone(),
        verifier,
        bridge: bridge_tx,
        services,
        heartbeat: config.heartbeat_interval,
    };

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, "warden server listening");

    let shutdown = cancel.clone();
    let app = build_router(state);
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
        {
            warn!(error = %e, "server exited with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        router,
        handler,
        cancel,
        tasks: vec![server, bridge, cleanup, pruner],
    })
}

/// Keeps the background tasks alive until [`ServerHandle::shutdown`].
pub struct ServerHandle {
    pub port: u16,
    router: ConnectionRouter,
    handler: Arc<SessionHandler>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn router(&self) -> &ConnectionRouter {
        &self.router
    }

    /// Stop accepting connections and wait for background tasks.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "server task failed");
            }
        }
        self.handler.cleanups().close();
        info!("warden server stopped");
    }
}

async fn ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<WsParams>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if let Some(verifier) = &state.verifier {
        if let Err(e) = auth::authenticate(verifier.as_ref(), &headers, params.token.as_deref()) {
            warn!(error = %e, "rejected connection");
            return e.into_response();
        }
    }
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };
    let session_id = params
        .session_id
        .filter(|s| !s.is_empty())
        .map(SessionId::from_raw);
    ws.on_upgrade(move |socket| handle_socket(socket, state, session_id))
}

async fn handle_socket(socket: WebSocket, state: AppState, session_id: Option<SessionId>) {
    let (conn, rx) = state.router.register(session_id.clone());
    info!(conn = %conn, session_id = ?session_id, "client connected");
    if let Some(session_id) = session_id {
        let attach = BridgeCommand::Attach {
            conn: conn.clone(),
            session_id,
        };
        if state.bridge.send(attach).await.is_err() {
            warn!(conn = %conn, "event bridge unavailable");
        }
    }
    state
        .router
        .serve_socket(socket, conn, rx, state.heartbeat)
        .await;
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let services = &state.services;
    Json(json!({
        "status": "ok",
        "connections": state.router.connection_count(),
        "scheduler": services.scheduler.stats(),
        "pending_permissions": services.gate.pending_count(),
        "buffer_enabled": services.buffer.is_enabled(),
    }))
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let metrics = &state.services.metrics;
    let stats = state.services.scheduler.stats();
    metrics.set_gauge("scheduler_running", &[], stats.running as f64);
    metrics.set_gauge("scheduler_queued", &[], stats.queued as f64);
    Json(metrics.snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;
    use serde_json::Value;
    use warden_engine::{
        DirectRuntime, GateConfig, HttpSandbox, SchedulerConfig, ToolInvoker,
    };
    use warden_store::Database;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::auth::StaticTokenVerifier;
    use crate::buffer::MemoryStreamBackend;

    fn services(sandbox_url: &str) -> Services {
        let metrics = Arc::new(MetricsRecorder::new());
        let gate = Arc::new(
            PermissionGate::new(GateConfig {
                skip_all: true,
                ..Default::default()
            })
            .with_metrics(Arc::clone(&metrics)),
        );
        let ledger = Arc::new(ToolCallLedger::new(Database::in_memory().unwrap()));
        let sandbox = Arc::new(HttpSandbox::new(sandbox_url, Duration::from_secs(5)).unwrap());
        let deltas = Broker::default();
        let invoker = Arc::new(ToolInvoker::new(gate.clone(), ledger.clone(), sandbox));
        let runtime = Arc::new(DirectRuntime::new(invoker, deltas.clone()));
        let scheduler = Arc::new(AgentScheduler::start(
            SchedulerConfig::default(),
            runtime,
            Some(Arc::clone(&metrics)),
        ));
        let buffer = Arc::new(DeliveryBuffer::new(
            Some(Arc::new(MemoryStreamBackend::new(100))),
            Duration::from_secs(3600),
        ));
        Services {
            scheduler,
            gate,
            ledger,
            deltas,
            buffer,
            metrics,
        }
    }

    fn config() -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            disconnect_grace: Duration::from_millis(50),
            ..Default::default()
        }
    }

    fn verifier() -> Option<Arc<dyn TokenVerifier>> {
        Some(Arc::new(StaticTokenVerifier::new(SecretString::from(
            "letmein".to_string(),
        ))))
    }

    #[tokio::test]
    async fn refuses_to_start_without_auth() {
        let result = start(config(), services("http://127.0.0.1:1"), None).await;
        assert!(matches!(result, Err(ServerError::AuthNotConfigured)));
    }

    #[tokio::test]
    async fn serves_health_and_metrics() {
        let handle = start(config(), services("http://127.0.0.1:1"), verifier())
            .await
            .unwrap();
        assert!(handle.port > 0);

        let base = format!("http://127.0.0.1:{}", handle.port);
        let health: Value = reqwest::get(format!("{base}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "ok");
        assert_eq!(health["connections"], 0);
        assert_eq!(health["buffer_enabled"], true);

        let metrics = reqwest::get(format!("{base}/metrics")).await.unwrap();
        assert_eq!(metrics.status(), 200);
        let body: Value = metrics.json().await.unwrap();
        assert!(body["gauges"].is_array());

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn ws_without_credential_is_unauthorized_before_upgrade() {
        let handle = start(config(), services("http://127.0.0.1:1"), verifier())
            .await
            .unwrap();
        let url = format!("http://127.0.0.1:{}/ws", handle.port);
        let client = reqwest::Client::new();

        let missing = client.get(&url).send().await.unwrap();
        assert_eq!(missing.status(), 401);

        let wrong = client
            .get(&url)
            .bearer_auth("nope")
            .send()
            .await
            .unwrap();
        assert_eq!(wrong.status(), 401);

        // A valid credential on a plain GET fails the upgrade, not the auth.
        let plain = client
            .get(format!("{url}?token=letmein"))
            .send()
            .await
            .unwrap();
        assert_ne!(plain.status(), 401);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn prompt_streams_tool_call_and_finish_to_session() {
        let sandbox = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/execute"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "success",
                "stdout": "hi\n",
                "stderr": "",
                "exit_code": 0
            })))
            .mount(&sandbox)
            .await;

        let handle = start(config(), services(&sandbox.uri()), verifier())
            .await
            .unwrap();
        let s = SessionId::new();
        let (conn, mut rx) = handle.router().register(Some(s.clone()));
        handle
            .router()
            .dispatch(
                &conn,
                json!({"type": "prompt", "content": "echo hi"}).to_string(),
            )
            .await;

        let mut seen = Vec::new();
        let mut last_seq = 0;
        loop {
            let raw = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("frames keep coming")
                .expect("connection open");
            let frame: Value = serde_json::from_str(&raw).unwrap();
            if let Some(seq) = frame["seq"].as_u64() {
                assert!(seq > last_seq, "sequence must increase");
                last_seq = seq;
            }
            let done = frame["type"] == "task" && frame["payload"]["state"] == "done";
            seen.push(frame);
            if done {
                break;
            }
        }

        assert_eq!(seen[0]["type"], "task_accepted");
        let delta_types: Vec<_> = seen
            .iter()
            .filter(|f| f["type"] == "delta")
            .map(|f| f["payload"]["delta_type"].as_str().unwrap_or_default().to_string())
            .collect();
        assert!(delta_types.contains(&"tool_call_started".to_string()));
        assert!(delta_types.contains(&"text".to_string()));
        assert_eq!(delta_types.last().map(String::as_str), Some("finish"));
        assert!(seen
            .iter()
            .any(|f| f["type"] == "tool_call" && f["payload"]["tool_call"]["status"] == "completed"));

        handle.shutdown().await;
    }
}
