use crate::api::ApiState;
use crate::error::ServiceError;
use crate::state::types::{CertificateRecord, WebhookHeaders};
use crate::time::now_millis;
use crate::webhook::WebhookOverride;
use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

#[derive(Debug, Serialize)]
struct CertificateSummary {
    main: String,
    sans: String,
    email: String,
    not_before_ts: i64,
    not_after_ts: i64,
    upserted_ts: i64,
}

impl From<CertificateRecord> for CertificateSummary {
    fn from(record: CertificateRecord) -> Self {
        Self {
            main: record.main,
            sans: record.sans,
            email: record.email,
            not_before_ts: record.not_before_ts,
            not_after_ts: record.not_after_ts,
            upserted_ts: record.upserted_ts,
        }
    }
}

#[derive(Debug, Deserialize)]
struct MainRequest {
    #[serde(default)]
    main: String,
}

#[derive(Debug, Deserialize)]
struct DomainRequest {
    #[serde(default)]
    domain: String,
}

#[derive(Debug, Deserialize)]
struct GenerateRequest {
    domain: Option<String>,
    #[serde(default)]
    domains: Vec<Value>,
    #[serde(default)]
    email: String,
    #[serde(default)]
    webhook_url: String,
    #[serde(default)]
    webhook_headers: Map<String, Value>,
}

impl GenerateRequest {
    /// A single `domain` wins over the `domains` list. Non-string list entries are ignored.
    fn domains(&self) -> Vec<String> {
        match &self.domain {
            Some(domain) => vec![domain.clone()],
            None => self
                .domains
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WebhookUpdateRequest {
    #[serde(default)]
    domain: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    headers: Map<String, Value>,
}

/// Header values may be any JSON scalar, non-strings are sent in their JSON form.
fn webhook_headers(headers: Map<String, Value>) -> WebhookHeaders {
    headers
        .into_iter()
        .map(|(name, value)| match value {
            Value::String(value) => (name, value),
            other => (name, other.to_string()),
        })
        .collect()
}

fn parse<T: DeserializeOwned>(body: &Bytes) -> Result<T, ServiceError> {
    serde_json::from_slice(body)
        .map_err(|e| ServiceError::InvalidInput(format!("malformed request body: {e}")))
}

pub(super) async fn list(State(state): State<ApiState>) -> Result<Json<Value>, ServiceError> {
    let certs: Vec<CertificateSummary> = state
        .service
        .list()
        .await?
        .into_iter()
        .map(CertificateSummary::from)
        .collect();
    Ok(Json(json!({ "certs": certs })))
}

/// Key and chain lookups answer 404 for anything they cannot serve, malformed bodies included.
async fn lookup(state: &ApiState, body: &Bytes) -> Result<CertificateRecord, StatusCode> {
    let request: MainRequest = parse(body).map_err(|_| StatusCode::NOT_FOUND)?;
    if request.main.is_empty() {
        return Err(StatusCode::NOT_FOUND);
    }
    match state.service.find_by_domain(&request.main).await {
        Ok(record) => Ok(record),
        Err(ServiceError::Storage(_)) => Err(StatusCode::INTERNAL_SERVER_ERROR),
        Err(_) => Err(StatusCode::NOT_FOUND),
    }
}

pub(super) async fn private_key(State(state): State<ApiState>, body: Bytes) -> Response {
    match lookup(&state, &body).await {
        Ok(record) => ([(header::CONTENT_TYPE, "text/plain")], record.private_key).into_response(),
        Err(status) => status.into_response(),
    }
}

pub(super) async fn certificate(State(state): State<ApiState>, body: Bytes) -> Response {
    match lookup(&state, &body).await {
        Ok(record) => ([(header::CONTENT_TYPE, "text/plain")], record.certificate).into_response(),
        Err(status) => status.into_response(),
    }
}

pub(super) async fn generate(
    State(state): State<ApiState>,
    body: Bytes,
) -> Result<Json<Value>, ServiceError> {
    let timestamp = now_millis();
    let request: GenerateRequest = parse(&body)?;
    let domains = request.domains();
    let webhook = WebhookOverride {
        url: request.webhook_url,
        headers: webhook_headers(request.webhook_headers),
    };
    let main = state
        .service
        .submit(timestamp, &request.email, &domains, Some(webhook))
        .await?;
    Ok(Json(json!({ "main": main })))
}

pub(super) async fn delete(
    State(state): State<ApiState>,
    body: Bytes,
) -> Result<Json<Value>, ServiceError> {
    let request: MainRequest = parse(&body)?;
    if request.main.is_empty() {
        return Err(ServiceError::InvalidInput("no main domain was given".to_string()));
    }
    state.service.delete(&request.main).await?;
    Ok(Json(json!({ "main": request.main })))
}

pub(super) async fn update_webhook(
    State(state): State<ApiState>,
    body: Bytes,
) -> Result<Json<Value>, ServiceError> {
    let request: WebhookUpdateRequest = parse(&body)?;
    if request.domain.is_empty() {
        return Err(ServiceError::InvalidInput("no domain was given".to_string()));
    }
    let webhook = state
        .service
        .update_webhook(&request.domain, &request.url, webhook_headers(request.headers))
        .await?;
    Ok(Json(json!({ "main": webhook.main, "url": webhook.url })))
}

pub(super) async fn delete_webhook(
    State(state): State<ApiState>,
    body: Bytes,
) -> Result<Json<Value>, ServiceError> {
    let request: DomainRequest = parse(&body)?;
    if request.domain.is_empty() {
        return Err(ServiceError::InvalidInput("no domain was given".to_string()));
    }
    state.service.delete_webhook(&request.domain).await?;
    Ok(Json(json!({ "domain": request.domain })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_domain_wins() {
        let request: GenerateRequest = serde_json::from_value(json!({
            "domain": "a.com",
            "domains": ["b.com"],
            "email": "x@y.com"
        }))
        .unwrap();

        assert_eq!(request.domains(), vec!["a.com"]);
    }

    #[test]
    fn test_non_string_domains_are_ignored() {
        let request: GenerateRequest = serde_json::from_value(json!({
            "domains": ["a.com", 5, null, "b.com"],
            "email": "x@y.com"
        }))
        .unwrap();

        assert_eq!(request.domains(), vec!["a.com", "b.com"]);
    }

    #[test]
    fn test_webhook_headers_are_stringified() {
        let headers = webhook_headers(
            json!({"x-token": "abc", "x-retries": 3, "x-debug": true})
                .as_object()
                .unwrap()
                .clone(),
        );

        assert_eq!(headers["x-token"], "abc");
        assert_eq!(headers["x-retries"], "3");
        assert_eq!(headers["x-debug"], "true");
    }
}
