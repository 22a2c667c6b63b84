//! HTTP server for the anchoring read API.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderValue, Method};
use axum::Router;
use chrono::{DateTime, Utc};
use keel_anchor::AnchoringNode;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::rest::ApiError;

/// Where the anchoring API listens and which browsers may call it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Socket to bind.
    pub listen_addr: SocketAddr,
    /// Emit CORS headers.
    pub cors_enabled: bool,
    /// Allowed origins (if CORS enabled); `*` allows any.
    pub allowed_origins: Vec<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8090)),
            cors_enabled: true,
            allowed_origins: vec!["*".to_string()],
        }
    }
}

impl ApiConfig {
    /// Bind to `addr` instead of the loopback default.
    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    /// Restrict CORS to the given origins.
    pub fn with_origins(mut self, origins: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.allowed_origins = origins.into_iter().map(Into::into).collect();
        self
    }

    /// Disable CORS headers.
    pub fn without_cors(mut self) -> Self {
        self.cors_enabled = false;
        self
    }

    /// Check the origin list parses as header values.
    pub fn validate(&self) -> Result<(), ApiError> {
        if !self.cors_enabled {
            return Ok(());
        }
        if self.allowed_origins.is_empty() {
            return Err(ApiError::BadRequest(
                "CORS enabled without allowed origins".into(),
            ));
        }
        self.origin_values().map(|_| ())
    }

    fn origin_values(&self) -> Result<Vec<HeaderValue>, ApiError> {
        self.allowed_origins
            .iter()
            .filter(|o| o.as_str() != "*")
            .map(|o| {
                HeaderValue::from_str(o)
                    .map_err(|_| ApiError::BadRequest(format!("invalid origin: {o}")))
            })
            .collect()
    }

    fn cors_layer(&self) -> Result<CorsLayer, ApiError> {
        if !self.cors_enabled {
            return Ok(CorsLayer::new());
        }
        let origin = if self.allowed_origins.iter().any(|o| o == "*") {
            AllowOrigin::from(Any)
        } else {
            AllowOrigin::list(self.origin_values()?)
        };
        Ok(CorsLayer::new()
            .allow_origin(origin)
            .allow_methods([Method::GET])
            .allow_headers([CONTENT_TYPE]))
    }
}

/// State shared by every handler.
pub struct ApiState {
    /// Settings the server was started with.
    pub config: ApiConfig,
    node: Arc<Mutex<AnchoringNode>>,
    started_at: DateTime<Utc>,
    start_time: Instant,
}

impl ApiState {
    /// Create new API state over a node handle.
    pub fn new(config: ApiConfig, node: Arc<Mutex<AnchoringNode>>) -> Self {
        Self {
            config,
            node,
            started_at: Utc::now(),
            start_time: Instant::now(),
        }
    }

    /// Run `f` against the node under its lock.
    pub fn with_node<T>(&self, f: impl FnOnce(&AnchoringNode) -> T) -> T {
        f(&self.node.lock())
    }

    /// When the server started.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Time since the server started.
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }
}

/// Serves the anchoring API for one validator.
pub struct ApiServer {
    config: ApiConfig,
    state: Arc<ApiState>,
}

impl ApiServer {
    /// Validate `config` and wrap the node handle.
    pub fn new(config: ApiConfig, node: Arc<Mutex<AnchoringNode>>) -> Result<Self, ApiError> {
        config.validate()?;
        let state = Arc::new(ApiState::new(config.clone(), node));
        Ok(Self { config, state })
    }

    /// Handle to the handler state.
    pub fn state(&self) -> Arc<ApiState> {
        Arc::clone(&self.state)
    }

    /// All routes behind tracing and, when enabled, CORS.
    pub fn router(&self) -> Result<Router, ApiError> {
        let middleware = ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(self.config.cors_layer()?);

        Ok(crate::rest::create_router()
            .layer(middleware)
            .with_state(self.state()))
    }

    /// Serve until `shutdown` resolves.
    pub async fn run<F>(&self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let router = self
            .router()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))?;
        let listener = TcpListener::bind(self.config.listen_addr).await?;

        info!("API server listening on {}", self.config.listen_addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
    }
}
