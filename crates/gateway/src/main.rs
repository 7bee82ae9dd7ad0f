//! Scholarbot API Gateway
//!
//! HTTP front of the answer pipeline.
//! Handles:
//! - Chat requests, answered as JSON or as a server-sent event stream
//! - Feedback on logged answers
//! - Liveness and readiness probes
//! - Observability (logging, metrics, request ids)

mod handlers;

use anyhow::Context;
use axum::{
    http::HeaderValue,
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use scholarbot_common::{
    config::{AppConfig, ObservabilityConfig},
    db::{DbPool, QaLogStore, Repository},
    metrics, ChatPipeline,
};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::{signal, sync::watch};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub logs: Arc<dyn QaLogStore>,
    pub pipeline: Arc<ChatPipeline>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(e) => {
            tracing_subscriber::fmt().json().init();
            tracing::error!(error = %e, "Failed to load configuration");
            return Err(e.into());
        }
    };

    init_tracing(&config.observability);
    info!("Starting Scholarbot API Gateway v{}", scholarbot_common::VERSION);

    let config = Arc::new(config);

    // Initialize metrics
    install_metrics_exporter(config.observability.metrics_port)?;
    metrics::register_metrics();

    // Initialize database connection
    info!("Connecting to database...");
    let db = DbPool::new(&config.database).await?;
    if config.database.run_migrations {
        db.run_migrations().await?;
    }
    let logs: Arc<dyn QaLogStore> = Arc::new(Repository::new(db));

    let pipeline = Arc::new(ChatPipeline::from_config(&config, logs.clone())?);

    // Create app state
    let state = AppState {
        config: config.clone(),
        logs,
        pipeline,
    };

    // Build the router
    let app = create_router(state);

    // Start the server
    let listener = tokio::net::TcpListener::bind((config.server.host.as_str(), config.server.port))
        .await
        .with_context(|| format!("failed to bind {}:{}", config.server.host, config.server.port))?;
    info!("Listening on {}", listener.local_addr()?);

    // Graceful shutdown waits on open event streams; bounded by shutdown_timeout_secs.
    let (stopping_tx, mut stopping_rx) = watch::channel(false);
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = stopping_tx.send(true);
        })
        .into_future();

    let grace = config.shutdown_timeout();
    let deadline = async move {
        let _ = stopping_rx.wait_for(|stopping| *stopping).await;
        tokio::time::sleep(grace).await;
    };

    tokio::select! {
        result = server => result?,
        _ = deadline => warn!(grace_secs = grace.as_secs(), "Shutdown grace period elapsed, dropping open connections"),
    }

    info!("Server shutdown complete");
    Ok(())
}

/// JSON or plain output, level from `RUST_LOG` or the configured default
fn init_tracing(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    if config.json_logging {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Serve Prometheus metrics on their own port; 0 disables the exporter
fn install_metrics_exporter(port: u16) -> anyhow::Result<()> {
    if port == 0 {
        info!("Metrics exporter disabled");
        return Ok(());
    }

    let prefixed = |name: &str| format!("{}_{}", metrics::METRICS_PREFIX, name);

    PrometheusBuilder::new()
        .with_http_listener(SocketAddr::from(([0, 0, 0, 0], port)))
        .set_buckets_for_metric(
            Matcher::Full(prefixed("chat_duration_seconds")),
            metrics::CHAT_BUCKETS,
        )?
        .set_buckets_for_metric(
            Matcher::Full(prefixed("retrieval_duration_seconds")),
            metrics::RETRIEVAL_BUCKETS,
        )?
        .set_buckets_for_metric(
            Matcher::Full(prefixed("embedding_duration_seconds")),
            metrics::RETRIEVAL_BUCKETS,
        )?
        .install()
        .context("failed to install Prometheus exporter")?;

    info!(port, "Metrics exporter listening");
    Ok(())
}

/// Create the main application router
fn create_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.server.cors_allowed_origins);

    // Request ID propagation
    let request_id = SetRequestIdLayer::x_request_id(MakeRequestUuid);
    let propagate_id = PropagateRequestIdLayer::x_request_id();

    // Chat streams run as long as the model talks; only the short
    // endpoints get the request timeout.
    let feedback_routes = Router::new()
        .route("/feedback", post(handlers::feedback::submit_feedback))
        .layer(TimeoutLayer::new(state.config.request_timeout()));

    let api_routes = Router::new()
        .route("/chat", post(handlers::chat::chat))
        .merge(feedback_routes);

    // Compose the app
    Router::new()
        // Health endpoints
        .route("/health", get(handlers::health::health))
        .route("/ready", get(handlers::health::ready))
        .nest("/v1", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(request_id)
        .layer(propagate_id)
        .with_state(state)
}

/// Any origin when none are configured
fn cors_layer(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() {
        return cors.allow_origin(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    cors.allow_origin(AllowOrigin::list(allowed))
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting shutdown..."),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! In-process router with the mock model and an in-memory log

    use super::*;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use scholarbot_common::config::PipelineConfig;
    use scholarbot_common::db::{Feedback, NewQaLog};
    use scholarbot_common::embeddings::MockEmbedder;
    use scholarbot_common::errors::{AppError, Result};
    use scholarbot_common::index::{FilterExpression, SearchHit, VectorIndex};
    use scholarbot_common::llm::{
        ChatModel, Completion, CompletionRequest, CompletionStream, MockChatModel,
    };
    use scholarbot_common::prompts::PromptCatalog;
    use scholarbot_common::context::PipelineServices;
    use std::sync::Mutex;
    use tower::ServiceExt;

    pub struct EmptyIndex;

    #[async_trait]
    impl VectorIndex for EmptyIndex {
        async fn search(
            &self,
            _vector: &[f32],
            _limit: usize,
            _filter: Option<&FilterExpression>,
        ) -> Result<Vec<SearchHit>> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    pub struct MemoryLogs {
        pub records: Mutex<Vec<NewQaLog>>,
        pub feedback: Mutex<Vec<(i32, Feedback)>>,
        pub unreachable: bool,
    }

    #[async_trait]
    impl QaLogStore for MemoryLogs {
        async fn insert(&self, record: NewQaLog) -> Result<i32> {
            let mut records = self.records.lock().unwrap();
            records.push(record);
            Ok(records.len() as i32)
        }

        async fn record_feedback(&self, id: i32, feedback: Feedback) -> Result<bool> {
            let exists = id >= 1 && (id as usize) <= self.records.lock().unwrap().len();
            if exists {
                self.feedback.lock().unwrap().push((id, feedback));
            }
            Ok(exists)
        }

        async fn ping(&self) -> Result<()> {
            if self.unreachable {
                return Err(AppError::DatabaseConnection {
                    message: "connection refused".to_string(),
                });
            }
            Ok(())
        }
    }

    /// Completion service that is down
    pub struct UnavailableModel;

    #[async_trait]
    impl ChatModel for UnavailableModel {
        async fn complete(&self, _request: CompletionRequest) -> Result<Completion> {
            Err(AppError::CompletionError {
                message: "status 503 from upstream".to_string(),
            })
        }

        async fn stream(&self, _request: CompletionRequest) -> Result<CompletionStream> {
            Err(AppError::CompletionError {
                message: "status 503 from upstream".to_string(),
            })
        }

        fn model_name(&self) -> &str {
            "unavailable"
        }
    }

    pub fn router(logs: Arc<MemoryLogs>) -> Router {
        router_with(logs, Arc::new(MockChatModel))
    }

    pub fn router_with(logs: Arc<MemoryLogs>, chat_model: Arc<dyn ChatModel>) -> Router {
        let config = AppConfig::default();
        let services = PipelineServices {
            chat_model,
            embedder: Arc::new(MockEmbedder::new(8)),
            index: Arc::new(EmptyIndex),
            log_store: logs.clone(),
        };
        let pipeline_config = PipelineConfig {
            metadata_filtering: false,
            ..PipelineConfig::default()
        };
        let prompts = PromptCatalog::builtin("zh").unwrap();
        let pipeline = ChatPipeline::new(&pipeline_config, prompts, services);

        create_router(AppState {
            config: Arc::new(config),
            logs,
            pipeline: Arc::new(pipeline),
        })
    }

    pub async fn post_json(router: Router, uri: &str, body: serde_json::Value) -> (StatusCode, String) {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        send(router, request).await
    }

    pub async fn get_path(router: Router, uri: &str) -> (StatusCode, String) {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        send(router, request).await
    }

    async fn send(router: Router, request: Request<Body>) -> (StatusCode, String) {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }
}
