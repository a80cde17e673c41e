// src/status_server.rs - HTTP surface for status, health, binding updates and metrics

use crate::{
    config::StatusServerConfig,
    engine::BridgeHandle,
    error::{BridgeError, ConfigError, Result},
    node_map::{BindingDiff, NodeBinding},
    status::{BridgeStatus, Health},
};
use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, put},
    Router,
};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[cfg(feature = "metrics")]
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

#[derive(Clone)]
struct AppState {
    handle: BridgeHandle,
    #[cfg(feature = "metrics")]
    prometheus: Option<PrometheusHandle>,
}

/// Serves `/status`, `/health`, `/bindings` and, with the `metrics`
/// feature, `/metrics`.
pub struct StatusServer {
    bind_address: SocketAddr,
    state: AppState,
}

impl StatusServer {
    pub fn new(config: &StatusServerConfig, handle: BridgeHandle) -> Result<Self> {
        let bind_address = config.bind_address.parse::<SocketAddr>().map_err(|e| {
            ConfigError::Invalid(format!("status_server.bind_address '{}': {e}", config.bind_address))
        })?;
        Ok(Self {
            bind_address,
            state: AppState {
                handle,
                #[cfg(feature = "metrics")]
                prometheus: None,
            },
        })
    }

    /// Install the global Prometheus recorder and expose it on `/metrics`
    #[cfg(feature = "metrics")]
    pub fn with_prometheus(mut self) -> Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| BridgeError::Config(ConfigError::Invalid(format!("metrics recorder: {e}"))))?;
        self.state.prometheus = Some(handle);
        Ok(self)
    }

    pub fn bind_address(&self) -> SocketAddr {
        self.bind_address
    }

    pub fn router(&self) -> Router {
        let router = Router::new()
            .route("/status", get(status))
            .route("/health", get(health))
            .route("/bindings", put(put_bindings));

        #[cfg(feature = "metrics")]
        let router = router.route("/metrics", get(render_metrics));

        router.with_state(self.state.clone())
    }

    /// Serve until `cancel` fires
    pub async fn serve(self, cancel: CancellationToken) -> Result<()> {
        let app = self.router();
        let listener = TcpListener::bind(self.bind_address).await?;
        info!(address = %self.bind_address, "Status server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await?;
        Ok(())
    }
}

async fn status(State(state): State<AppState>) -> Json<BridgeStatus> {
    Json(state.handle.status())
}

async fn health(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let status = state.handle.status();
    let code = match status.health {
        Health::Healthy | Health::Degraded => StatusCode::OK,
        Health::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (
        code,
        Json(serde_json::json!({
            "status": status.health,
            "source": status.source_state,
            "sink": status.sink_state,
            "queue_depth": status.queue_depth,
            "backpressure": status.backpressure,
        })),
    )
}

async fn put_bindings(
    State(state): State<AppState>,
    Json(bindings): Json<Vec<NodeBinding>>,
) -> std::result::Result<Json<BindingDiff>, (StatusCode, Json<serde_json::Value>)> {
    match state.handle.apply_bindings(bindings) {
        Ok(diff) => {
            info!(
                added = diff.added.len(),
                removed = diff.removed.len(),
                changed = diff.changed.len(),
                "Bindings replaced over HTTP"
            );
            Ok(Json(diff))
        }
        Err(BridgeError::ShutDown) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": "bridge is shutting down" })),
        )),
        Err(e) => Err((
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": e.to_string() })),
        )),
    }
}

#[cfg(feature = "metrics")]
async fn render_metrics(State(state): State<AppState>) -> (StatusCode, String) {
    match &state.prometheus {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed\n".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Config,
        engine::BridgeEngine,
        node_map::QosLevel,
        sink::SinkConfig,
        source::SourceConfig,
        test_utils::{MockSink, MockSource},
    };

    fn state() -> AppState {
        let config = Config::new(
            SourceConfig::new("opc.tcp://plc.local:4840"),
            SinkConfig::new("broker.local", 1883),
        );
        let handle = BridgeEngine::new(&config, MockSource::new(), MockSink::new())
            .start(vec![NodeBinding::new("ns=2;s=Line1.Temp", "plant/line1/temp")])
            .unwrap();
        AppState {
            handle,
            #[cfg(feature = "metrics")]
            prometheus: None,
        }
    }

    #[tokio::test]
    async fn test_rejects_bad_bind_address() {
        let state = state();
        let config = StatusServerConfig {
            bind_address: "not an address".into(),
        };
        assert!(StatusServer::new(&config, state.handle.clone()).is_err());

        let server = StatusServer::new(&StatusServerConfig::default(), state.handle.clone()).unwrap();
        assert_eq!(server.bind_address().port(), 8080);
        state.handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_status_lists_bindings() {
        let state = state();
        let Json(status) = status(State(state.clone())).await;
        assert!(status.binding("ns=2;s=Line1.Temp").is_some());
        assert_eq!(status.queue_capacity, 1000);
        state.handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_put_bindings_returns_diff() {
        let state = state();
        let bindings = vec![
            NodeBinding::new("ns=2;s=Line1.Temp", "plant/line1/temp").with_qos(QosLevel::AtMostOnce),
            NodeBinding::new("ns=2;s=Line1.Speed", "plant/line1/speed"),
        ];
        let Json(diff) = put_bindings(State(state.clone()), Json(bindings)).await.unwrap();
        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.changed.len(), 1);
        state.handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_put_invalid_bindings_is_bad_request() {
        let state = state();
        let bindings = vec![
            NodeBinding::new("ns=2;s=A", "plant/a"),
            NodeBinding::new("ns=2;s=A", "plant/b"),
        ];
        let (code, _) = put_bindings(State(state.clone()), Json(bindings)).await.unwrap_err();
        assert_eq!(code, StatusCode::BAD_REQUEST);
        assert!(state.handle.status().binding("ns=2;s=A").is_none());

        state.handle.shutdown().await;
        let (code, _) = put_bindings(State(state.clone()), Json(vec![])).await.unwrap_err();
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_health_reports_components() {
        let state = state();
        let (_, Json(body)) = health(State(state.clone())).await;
        assert!(body.get("status").is_some());
        assert!(body.get("sink").is_some());
        state.handle.shutdown().await;
    }
}
