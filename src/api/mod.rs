//! HTTP front door. Handlers only translate between JSON and [`CertificateService`] calls.

use crate::config::AuthConfiguration;
use crate::error::ServiceError;
use crate::service::CertificateService;
use axum::extract::{Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

mod certs;

#[derive(Clone)]
pub struct ApiState {
    pub service: Arc<CertificateService>,
}

pub fn router(service: Arc<CertificateService>, auth: AuthConfiguration) -> Router {
    let auth = Arc::new(auth);
    let protected = Router::new()
        .route("/certs/list", get(certs::list))
        .route("/certs/privatekey", post(certs::private_key))
        .route("/certs/certificate", post(certs::certificate))
        .route("/certs/generate", post(certs::generate))
        .route("/certs/delete", post(certs::delete))
        .route("/certs/webhook/update", post(certs::update_webhook))
        .route("/certs/webhook/delete", post(certs::delete_webhook))
        .route_layer(middleware::from_fn_with_state(auth, basic_auth))
        .with_state(ApiState { service });
    Router::new()
        .route("/health", get(health))
        .merge(protected)
}

/// Serves `router` until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    info!("Listening on {}", listener.local_addr()?);
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn basic_auth(
    State(auth): State<Arc<AuthConfiguration>>,
    request: Request,
    next: Next,
) -> Response {
    if !auth.is_enabled() {
        return next.run(request).await;
    }
    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Basic "))
        .and_then(|encoded| BASE64_STANDARD.decode(encoded.trim()).ok())
        .is_some_and(|decoded| credentials_match(&auth, &decoded));
    if authorized {
        next.run(request).await
    } else {
        debug!("Rejecting unauthenticated request to {}", request.uri());
        (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"certsteward\"")],
        )
            .into_response()
    }
}

fn credentials_match(auth: &AuthConfiguration, decoded: &[u8]) -> bool {
    let expected = format!("{}:{}", auth.username, auth.password);
    aws_lc_rs::constant_time::verify_slices_are_equal(expected.as_bytes(), decoded).is_ok()
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServiceError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ServiceError::Busy => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({"message": self.to_string()}))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth(username: &str, password: &str) -> AuthConfiguration {
        AuthConfiguration {
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    #[test]
    fn test_credentials_match() {
        let auth = auth("admin", "secret");

        assert!(credentials_match(&auth, b"admin:secret"));
        assert!(!credentials_match(&auth, b"admin:wrong"));
        assert!(!credentials_match(&auth, b"admin"));
    }

    #[test]
    fn test_error_status() {
        assert_eq!(
            ServiceError::Busy.into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ServiceError::InvalidInput("x".to_string())
                .into_response()
                .status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServiceError::NotFound("x".to_string())
                .into_response()
                .status(),
            StatusCode::NOT_FOUND
        );
    }
}
