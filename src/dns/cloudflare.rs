use crate::dns::{DnsProvider, RecordHandle};
use anyhow::{Context, anyhow, bail};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use url::Url;

pub const DEFAULT_API_URL: &str = "https://api.cloudflare.com/client/v4/";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const TXT_TTL: u32 = 120;

/// Cloudflare v4 API provider, authenticated with a scoped API token.
#[derive(Debug, Clone)]
pub struct Cloudflare {
    api_url: Url,
    api_token: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<ApiError>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: u32,
    message: String,
}

#[derive(Debug, Deserialize)]
struct Zone {
    id: String,
    name: String,
}

#[derive(Debug, Serialize)]
struct NewRecord<'a> {
    #[serde(rename = "type")]
    record_type: &'static str,
    name: &'a str,
    content: &'a str,
    ttl: u32,
}

#[derive(Debug, Deserialize)]
struct CreatedRecord {
    id: String,
}

impl Cloudflare {
    pub fn try_new(api_url: Url, api_token: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(crate::USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            api_url,
            api_token,
            client,
        })
    }

    fn endpoint(&self, path: &str) -> anyhow::Result<Url> {
        self.api_url
            .join(path)
            .context(format!("Invalid Cloudflare API path {path}"))
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        action: &str,
    ) -> anyhow::Result<Option<T>> {
        let response = request
            .bearer_auth(&self.api_token)
            .send()
            .await
            .context(format!("Cloudflare: {action}"))?;
        let status = response.status();
        let envelope: Envelope<T> = response
            .json()
            .await
            .context(format!("Cloudflare: {action}: unreadable response ({status})"))?;
        if !status.is_success() || !envelope.success {
            let errors = envelope
                .errors
                .iter()
                .map(|err| format!("{}: {}", err.code, err.message))
                .collect::<Vec<_>>()
                .join(", ");
            bail!("Cloudflare: {action} failed with {status}: {errors}");
        }
        Ok(envelope.result)
    }

    /// Finds the zone hosting `record_name` by trying ever shorter parent names.
    async fn find_zone(&self, record_name: &str) -> anyhow::Result<Zone> {
        let labels: Vec<&str> = record_name.trim_end_matches('.').split('.').collect();
        // neither the challenge label nor a bare TLD can be the zone apex
        for start in 1..labels.len().saturating_sub(1) {
            let candidate = labels[start..].join(".");
            let mut url = self.endpoint("zones")?;
            url.query_pairs_mut().append_pair("name", &candidate);
            let zones: Vec<Zone> = self
                .send(self.client.get(url), &format!("looking up zone {candidate}"))
                .await?
                .unwrap_or_default();
            if let Some(zone) = zones.into_iter().find(|zone| zone.name == candidate) {
                debug!("Cloudflare zone for {record_name} is {} ({})", zone.name, zone.id);
                return Ok(zone);
            }
        }
        Err(anyhow!("Cloudflare: no zone found for {record_name}"))
    }
}

#[async_trait]
impl DnsProvider for Cloudflare {
    fn name(&self) -> &'static str {
        "cloudflare"
    }

    async fn present(&self, record_name: &str, value: &str) -> anyhow::Result<RecordHandle> {
        let zone = self.find_zone(record_name).await?;
        let url = self.endpoint(&format!("zones/{}/dns_records", zone.id))?;
        let record = NewRecord {
            record_type: "TXT",
            name: record_name,
            content: value,
            ttl: TXT_TTL,
        };
        let created: CreatedRecord = self
            .send(
                self.client.post(url).json(&record),
                &format!("creating TXT record {record_name}"),
            )
            .await?
            .ok_or(anyhow!("Cloudflare did not return the created record"))?;
        Ok(RecordHandle {
            zone_id: zone.id,
            record_id: created.id,
            name: record_name.to_string(),
        })
    }

    async fn cleanup(&self, handle: RecordHandle) -> anyhow::Result<()> {
        let url = self.endpoint(&format!(
            "zones/{}/dns_records/{}",
            handle.zone_id, handle.record_id
        ))?;
        self.send::<serde_json::Value>(
            self.client.delete(url),
            &format!("deleting TXT record {}", handle.name),
        )
        .await?;
        Ok(())
    }
}
