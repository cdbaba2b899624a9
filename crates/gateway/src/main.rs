//! PropBot API Gateway
//!
//! The HTTP entry point for the property assistant.
//! Handles:
//! - Chat turns and session resets
//! - Rate limiting
//! - Observability (logging, metrics, request ids)

mod handlers;
mod middleware;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use propbot_common::{
    cache::Cache,
    chat::{InMemorySessionStore, MessageRouter, RedisSessionStore, SessionRegistry, SessionStore},
    config::{AppConfig, ObservabilityConfig, SessionBackend},
    embeddings::create_embedder,
    errors::{AppError, Result},
    generation::create_generator,
    metrics,
    retrieval::{VectorContextProvider, VectorIndex},
    vision::{create_captioner, CaptioningAnalyzer},
};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub registry: Arc<SessionRegistry>,
    pub router: Arc<MessageRouter>,
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = AppConfig::load()?;

    init_tracing(&config.observability);
    info!(
        service = %config.observability.service_name,
        "Starting PropBot API Gateway v{}",
        propbot_common::VERSION
    );

    let config = Arc::new(config);

    // Initialize metrics
    if config.observability.metrics_port != 0 {
        install_metrics_exporter(config.observability.metrics_port)?;
    }
    metrics::register_metrics();

    let state = build_state(config.clone()).await.map_err(|e| {
        tracing::error!(error = %e, "Failed to initialize services");
        e
    })?;

    if config.session.store == SessionBackend::Memory {
        spawn_session_sweeper(
            state.registry.clone(),
            Duration::from_secs(config.session.sweep_interval_secs.max(1)),
        );
    }

    // Build the router
    let app = create_router(state);

    // Start the server
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| AppError::Configuration {
            message: format!("Invalid listen address: {}", e),
        })?;
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

fn init_tracing(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    if config.json_logging {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn install_metrics_exporter(port: u16) -> std::result::Result<(), Box<dyn std::error::Error>> {
    PrometheusBuilder::new()
        .with_http_listener(SocketAddr::from(([0, 0, 0, 0], port)))
        .set_buckets_for_metric(
            Matcher::Suffix("request_duration_seconds".to_string()),
            metrics::LATENCY_BUCKETS,
        )?
        .set_buckets_for_metric(
            Matcher::Suffix("chat_duration_seconds".to_string()),
            metrics::LATENCY_BUCKETS,
        )?
        .set_buckets_for_metric(
            Matcher::Suffix("collaborator_duration_seconds".to_string()),
            metrics::COLLABORATOR_BUCKETS,
        )?
        .install()?;

    info!(port, "Prometheus exporter listening");
    Ok(())
}

/// Wire collaborators, the session store, and the registry from configuration
async fn build_state(config: Arc<AppConfig>) -> Result<AppState> {
    let embedder = create_embedder(&config.embedding)?;
    let index = VectorIndex::load(Path::new(&config.retrieval.index_path))?;
    let context_provider = Arc::new(VectorContextProvider::new(
        embedder,
        Arc::new(index),
        config.retrieval.top_k,
    ));

    let analyzer = Arc::new(CaptioningAnalyzer::new(create_captioner(&config.vision)?));
    let generator = create_generator(&config.generation)?;

    let router = Arc::new(MessageRouter::new(
        context_provider,
        analyzer,
        generator,
        config.collaborator_timeout(),
    ));

    let store: Arc<dyn SessionStore> = match config.session.store {
        SessionBackend::Memory => Arc::new(InMemorySessionStore::new(
            config.session_ttl(),
            config.session.max_sessions,
        )),
        SessionBackend::Redis => {
            info!("Connecting to Redis...");
            let cache = Cache::new(config.redis.clone()).await?;
            Arc::new(RedisSessionStore::new(Arc::new(cache), config.session_ttl()))
        }
    };
    info!(backend = store.backend(), "Session store ready");

    let registry = Arc::new(SessionRegistry::new(store, config.session.system_prompt.clone()));

    Ok(AppState {
        config,
        registry,
        router,
    })
}

/// Periodically drop idle sessions
fn spawn_session_sweeper(registry: Arc<SessionRegistry>, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            let evicted = registry.evict_expired().await;
            if evicted > 0 {
                info!(evicted, "Expired sessions evicted");
            }
        }
    });
}

/// Largest accepted request body
///
/// Base64 inflates images by a third; leave room for the rest of the body.
pub fn body_limit(config: &AppConfig) -> usize {
    config.server.max_image_bytes / 3 * 4 + 64 * 1024
}

/// Create the main application router
fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Request ID propagation
    let request_id = SetRequestIdLayer::x_request_id(MakeRequestUuid);
    let propagate_id = PropagateRequestIdLayer::x_request_id();

    let body_limit = body_limit(&state.config);
    let request_timeout = TimeoutLayer::new(state.config.request_timeout());
    let rate_limit = &state.config.rate_limit;

    // /chat is bounded by the per-collaborator timeouts and always stores its turn
    let mut api_routes = Router::new()
        .route("/chat", post(handlers::chat::chat))
        .route("/reset", post(handlers::chat::reset).layer(request_timeout.clone()));

    if rate_limit.enabled {
        let limiter = middleware::create_rate_limiter(rate_limit.requests_per_second, rate_limit.burst);
        api_routes = api_routes.layer(axum::middleware::from_fn_with_state(
            limiter,
            middleware::rate_limit_middleware,
        ));
    }

    // Compose the app
    Router::new()
        .merge(api_routes)
        .route("/health", get(handlers::health::health))
        .route("/ready", get(handlers::health::ready).layer(request_timeout))
        .layer(
            ServiceBuilder::new()
                .layer(axum::middleware::from_fn(middleware::track_metrics))
                .layer(TraceLayer::new_for_http())
                .layer(cors)
                .layer(request_id)
                .layer(propagate_id)
                .layer(DefaultBodyLimit::max(body_limit)),
        )
        .with_state(state)
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting shutdown..."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use propbot_common::{
        chat::Message,
        generation::{MockGenerator, ResponseGenerator},
        retrieval::ContextProvider,
        vision::MockCaptioner,
    };
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    #[derive(Default)]
    struct CountingContext {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ContextProvider for CountingContext {
        async fn context_for(&self, _query: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok("Deposits must be protected within 30 days.".to_string())
        }
    }

    /// Fails every message mentioning "outage"; takes 3s over "slowly"
    struct FlakyGenerator;

    #[async_trait]
    impl ResponseGenerator for FlakyGenerator {
        async fn generate(&self, message: &str, history: &[Message], context: &str) -> Result<String> {
            if message.contains("slowly") {
                tokio::time::sleep(Duration::from_secs(3)).await;
            }
            if message.contains("outage") {
                return Err(AppError::GenerationError {
                    message: "upstream returned 503".to_string(),
                });
            }
            MockGenerator.generate(message, history, context).await
        }
    }

    struct TestApp {
        app: Router,
        state: AppState,
        context: Arc<CountingContext>,
    }

    fn test_app(caption: &str) -> TestApp {
        test_app_with(caption, Duration::from_secs(5), |_| {})
    }

    fn test_app_with(
        caption: &str,
        collaborator_timeout: Duration,
        configure: impl FnOnce(&mut AppConfig),
    ) -> TestApp {
        let mut config = AppConfig::default();
        config.rate_limit.enabled = false;
        config.server.max_image_bytes = 1024;
        configure(&mut config);
        let config = Arc::new(config);

        let context = Arc::new(CountingContext::default());
        let router = Arc::new(MessageRouter::new(
            context.clone(),
            Arc::new(CaptioningAnalyzer::new(Arc::new(MockCaptioner::new(caption)))),
            Arc::new(FlakyGenerator),
            collaborator_timeout,
        ));
        let store = Arc::new(InMemorySessionStore::new(Duration::from_secs(3600), 100));
        let registry = Arc::new(SessionRegistry::new(store, config.session.system_prompt.clone()));

        let state = AppState {
            config,
            registry,
            router,
        };

        TestApp {
            app: create_router(state.clone()),
            state,
            context,
        }
    }

    async fn post(app: &Router, uri: &str, body: &str) -> (StatusCode, Value) {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn test_chat_creates_session() {
        let t = test_app("a room");
        let (status, body) = post(&t.app, "/chat", r#"{"message":"What's the deposit policy?"}"#).await;

        assert_eq!(status, StatusCode::OK);
        assert!(!body["session_id"].as_str().unwrap().is_empty());
        assert!(body["response"].as_str().unwrap().contains("What's the deposit policy?"));
        assert_eq!(t.context.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_conversation_continues_on_same_session() {
        let t = test_app("a room");
        let (_, first) = post(&t.app, "/chat", r#"{"message":"Hi"}"#).await;
        let id = first["session_id"].as_str().unwrap().to_string();

        let (status, second) = post(
            &t.app,
            "/chat",
            &json!({"message": "And the deposit?", "session_id": id}).to_string(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(second["session_id"], id.as_str());

        let session = t.state.registry.store().get(&id).await.unwrap().unwrap();
        assert_eq!(session.history().len(), 5);
    }

    #[tokio::test]
    async fn test_unknown_session_gets_new_id() {
        let t = test_app("a room");
        let (status, body) = post(&t.app, "/chat", r#"{"message":"Hi","session_id":"stale"}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_ne!(body["session_id"], "stale");
    }

    #[tokio::test]
    async fn test_image_skips_retrieval() {
        let t = test_app("a crack along the ceiling");
        let image = "data:image/png;base64,iVBORw0KGgo=";
        let (status, body) = post(
            &t.app,
            "/chat",
            &json!({"message": "Is this a problem?", "image": image}).to_string(),
        )
        .await;

        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(t.context.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_malformed_input_is_client_error() {
        let t = test_app("a room");

        let (status, body) = post(&t.app, "/chat", r#"{"session_id":"x"}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "MISSING_FIELD");

        let (status, body) = post(&t.app, "/chat", "{not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_FORMAT");

        let (status, body) = post(&t.app, "/chat", r#"{"message":"hi","image":"%%%"}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("base64"));

        let (status, _) = post(&t.app, "/chat", r#"{"message":""}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_oversized_image_is_rejected() {
        use base64::Engine as _;
        let t = test_app("a room");
        let image = base64::engine::general_purpose::STANDARD.encode(vec![7u8; 2048]);

        let (status, body) = post(
            &t.app,
            "/chat",
            &json!({"message": "look", "image": image}).to_string(),
        )
        .await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body["code"], "PAYLOAD_TOO_LARGE");
    }

    #[tokio::test]
    async fn test_body_over_limit_is_payload_too_large() {
        use base64::Engine as _;
        let t = test_app("a room");
        let image = base64::engine::general_purpose::STANDARD.encode(vec![7u8; 200_000]);

        let (status, body) = post(
            &t.app,
            "/chat",
            &json!({"message": "look", "image": image}).to_string(),
        )
        .await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body["code"], "PAYLOAD_TOO_LARGE");
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_turn_outlives_request_timeout() {
        let t = test_app_with("a room", Duration::from_secs(5), |config| {
            config.server.request_timeout_secs = 1;
        });
        let (_, first) = post(&t.app, "/chat", r#"{"message":"Hi"}"#).await;
        let id = first["session_id"].as_str().unwrap().to_string();

        let (status, body) = post(
            &t.app,
            "/chat",
            &json!({"message": "answer slowly", "session_id": id}).to_string(),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");

        let session = t.state.registry.store().get(&id).await.unwrap().unwrap();
        assert_eq!(session.history().len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_collaborator_timeout_keeps_user_message() {
        let t = test_app_with("a room", Duration::from_secs(2), |config| {
            config.server.request_timeout_secs = 1;
        });
        let (_, first) = post(&t.app, "/chat", r#"{"message":"Hi"}"#).await;
        let id = first["session_id"].as_str().unwrap().to_string();

        let (status, body) = post(
            &t.app,
            "/chat",
            &json!({"message": "answer slowly", "session_id": id}).to_string(),
        )
        .await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body["code"], "UPSTREAM_TIMEOUT");
        assert_eq!(body["session_id"], id.as_str());

        let session = t.state.registry.store().get(&id).await.unwrap().unwrap();
        assert_eq!(session.history().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_request_still_stores_turn() {
        let t = test_app_with("a room", Duration::from_secs(2), |_| {});
        let (_, first) = post(&t.app, "/chat", r#"{"message":"Hi"}"#).await;
        let id = first["session_id"].as_str().unwrap().to_string();

        let body = json!({"message": "answer slowly", "session_id": id}).to_string();
        let abandoned = tokio::time::timeout(Duration::from_millis(500), post(&t.app, "/chat", &body)).await;
        assert!(abandoned.is_err());

        // Let the detached turn hit its collaborator timeout
        tokio::time::sleep(Duration::from_secs(5)).await;

        let session = t.state.registry.store().get(&id).await.unwrap().unwrap();
        assert_eq!(session.history().len(), 4);
    }

    #[tokio::test]
    async fn test_collaborator_failure_reports_session() {
        let t = test_app("a room");
        let (_, first) = post(&t.app, "/chat", r#"{"message":"Hi"}"#).await;
        let id = first["session_id"].as_str().unwrap().to_string();

        let (status, body) = post(
            &t.app,
            "/chat",
            &json!({"message": "is there an outage?", "session_id": id}).to_string(),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["session_id"], id.as_str());
        assert!(body["error"].as_str().unwrap().contains("503"));

        // The failed user message is still recorded
        let session = t.state.registry.store().get(&id).await.unwrap().unwrap();
        assert_eq!(session.history().len(), 4);
    }

    #[tokio::test]
    async fn test_reset_is_idempotent() {
        let t = test_app("a room");
        let (_, first) = post(&t.app, "/chat", r#"{"message":"Hi"}"#).await;
        let id = first["session_id"].as_str().unwrap().to_string();
        let body = json!({"session_id": id}).to_string();

        let (status, reset) = post(&t.app, "/reset", &body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reset["reset"], true);

        let (status, again) = post(&t.app, "/reset", &body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(again["reset"], false);

        let (status, _) = post(&t.app, "/reset", r#"{}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_probes() {
        let t = test_app("a room");

        let response = t
            .app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = t
            .app
            .clone()
            .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_excess() {
        let mut config = AppConfig::default();
        config.rate_limit.requests_per_second = 1;
        config.rate_limit.burst = 1;

        let t = test_app("a room");
        let state = AppState {
            config: Arc::new(config),
            ..t.state
        };
        let app = create_router(state);

        let (first, _) = post(&app, "/chat", r#"{"message":"Hi"}"#).await;
        let (second, body) = post(&app, "/chat", r#"{"message":"Hi again"}"#).await;
        assert_eq!(first, StatusCode::OK);
        assert_eq!(second, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["code"], "RATE_LIMITED");
    }
}
