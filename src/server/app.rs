//! Reference HTTP gateway.

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use super::layer::RateLimitLayer;
use crate::error::{RatewardenError, Result};
use crate::ratelimit::{RateLimiter, RouteTable};

/// HTTP server that applies the route table in front of a placeholder handler.
pub struct GatewayServer {
    /// Address to bind to
    addr: SocketAddr,
    limiter: Arc<RateLimiter>,
    routes: Arc<RouteTable>,
}

impl GatewayServer {
    pub fn new(addr: SocketAddr, limiter: Arc<RateLimiter>, routes: Arc<RouteTable>) -> Self {
        Self {
            addr,
            limiter,
            routes,
        }
    }

    /// Build the router. `/health` sits outside the limiter.
    pub fn router(&self) -> Router {
        let limited = Router::new()
            .fallback(downstream)
            .layer(RateLimitLayer::for_routes(
                self.limiter.clone(),
                self.routes.clone(),
            ));

        Router::new()
            .route("/health", get(health))
            .with_state(self.limiter.clone())
            .merge(limited)
    }

    /// Serve until the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let app = self.router();
        let listener = TcpListener::bind(self.addr).await?;

        info!(
            addr = %self.addr,
            routes = self.routes.len(),
            "Starting rate limiting gateway with graceful shutdown"
        );

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            RatewardenError::Io(e)
        })
    }
}

async fn health(State(limiter): State<Arc<RateLimiter>>) -> Response {
    match limiter.store().ping().await {
        Ok(()) => Json(json!({ "status": "ok" })).into_response(),
        Err(e) => {
            warn!(error = %e, "Health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unavailable" })),
            )
                .into_response()
        }
    }
}

/// Stands in for the protected application.
async fn downstream(request: Request) -> Response {
    Json(json!({ "status": "ok", "path": request.uri().path() })).into_response()
}
