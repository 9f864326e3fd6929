//! Delivery of certificate lifecycle events to an HTTP endpoint configured per certificate.

use crate::state::WebhookStore;
use crate::state::types::{WebhookHeaders, WebhookRecord};
use anyhow::{Context, bail};
use async_trait::async_trait;
use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EventType {
    Generate,
    Renew,
}

/// A freshly issued or renewed certificate.
#[derive(Debug, Clone, Copy)]
pub struct WebhookEvent<'a> {
    pub event_type: EventType,
    pub main: &'a str,
    pub email: &'a str,
    pub private_key: &'a [u8],
    pub certificate: &'a [u8],
}

/// Endpoint given along with a request. It replaces the stored endpoint for the certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebhookOverride {
    pub url: String,
    pub headers: WebhookHeaders,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// No endpoint is configured for the certificate.
    Skipped,
    Delivered,
}

#[derive(Serialize)]
struct Payload<'a> {
    #[serde(rename = "type")]
    typ: EventType,
    main: &'a str,
    email: &'a str,
    private_key: String,
    certificate: String,
}

impl<'a> From<&WebhookEvent<'a>> for Payload<'a> {
    fn from(event: &WebhookEvent<'a>) -> Self {
        Self {
            typ: event.event_type,
            main: event.main,
            email: event.email,
            private_key: BASE64_STANDARD.encode(event.private_key),
            certificate: BASE64_STANDARD.encode(event.certificate),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        event: &WebhookEvent<'_>,
        override_endpoint: Option<&WebhookOverride>,
    ) -> anyhow::Result<Delivery>;
}

/// Used when webhooks are disabled in the configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(
        &self,
        _event: &WebhookEvent<'_>,
        _override_endpoint: Option<&WebhookOverride>,
    ) -> anyhow::Result<Delivery> {
        Ok(Delivery::Skipped)
    }
}

pub struct WebhookNotifier {
    webhooks: Arc<dyn WebhookStore>,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn try_new(webhooks: Arc<dyn WebhookStore>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(crate::USER_AGENT)
            .timeout(timeout)
            .build()
            .context("Building webhook HTTP client")?;
        Ok(Self { webhooks, client })
    }

    /// An override is authoritative and is stored before delivery. Without one, the stored
    /// endpoint for the certificate is used, if there is any.
    async fn resolve_endpoint(
        &self,
        main: &str,
        override_endpoint: Option<&WebhookOverride>,
    ) -> anyhow::Result<Option<WebhookRecord>> {
        match override_endpoint.filter(|endpoint| !endpoint.url.is_empty()) {
            Some(endpoint) => {
                let record = WebhookRecord {
                    main: main.to_string(),
                    url: endpoint.url.clone(),
                    headers: endpoint.headers.clone(),
                };
                self.webhooks
                    .upsert_webhook(&record)
                    .await
                    .context(format!("Saving webhook endpoint for {main}"))?;
                Ok(Some(record))
            }
            None => self
                .webhooks
                .get_webhook(main)
                .await
                .context(format!("Loading webhook endpoint for {main}")),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(
        &self,
        event: &WebhookEvent<'_>,
        override_endpoint: Option<&WebhookOverride>,
    ) -> anyhow::Result<Delivery> {
        let Some(endpoint) = self.resolve_endpoint(event.main, override_endpoint).await? else {
            debug!("No webhook configured for {}, not notifying", event.main);
            return Ok(Delivery::Skipped);
        };
        info!(
            "Pushing {} event for {} to {}",
            event.event_type, event.main, endpoint.url
        );
        let headers = header_map(&endpoint.headers)?;
        let response = self
            .client
            .post(&endpoint.url)
            .headers(headers)
            .json(&Payload::from(event))
            .send()
            .await
            .context(format!("Sending webhook to {}", endpoint.url))?;
        let status = response.status();
        if !status.is_success() {
            bail!("Webhook endpoint {} answered with {status}", endpoint.url);
        }
        Ok(Delivery::Delivered)
    }
}

fn header_map(headers: &WebhookHeaders) -> anyhow::Result<HeaderMap> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .context(format!("Invalid webhook header name {name}"))?;
        let header_value =
            HeaderValue::from_str(value).context(format!("Invalid value for header {name}"))?;
        map.insert(header_name, header_value);
    }
    Ok(map)
}
