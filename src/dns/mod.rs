//! DNS-01 challenge provisioning: provider-side record management and propagation checks.

use crate::dns::resolver::TxtLookup;
use crate::time::ParsedDuration;
use anyhow::{Context, bail};
use async_trait::async_trait;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub mod cloudflare;
pub mod resolver;

const ACME_CHALLENGE_LABEL: &str = "_acme-challenge";

/// A TXT record created by a [`DnsProvider`], remembered so it can be removed again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHandle {
    pub zone_id: String,
    pub record_id: String,
    pub name: String,
}

#[async_trait]
pub trait DnsProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn present(&self, record_name: &str, value: &str) -> anyhow::Result<RecordHandle>;

    async fn cleanup(&self, handle: RecordHandle) -> anyhow::Result<()>;
}

/// Used when no provider is configured. Every challenge fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProvider;

#[async_trait]
impl DnsProvider for NoProvider {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn present(&self, record_name: &str, _value: &str) -> anyhow::Result<RecordHandle> {
        bail!("No DNS provider is configured, cannot publish {record_name}")
    }

    async fn cleanup(&self, _handle: RecordHandle) -> anyhow::Result<()> {
        Ok(())
    }
}

/// How long to wait for a TXT record to become visible, and how often to look.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChallengeTiming {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Display for ChallengeTiming {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "timeout {}, interval {}",
            ParsedDuration::from(self.timeout),
            ParsedDuration::from(self.interval)
        )
    }
}

/// Picks the challenge timing for a domain. Some registries take much longer than others to
/// publish zone changes, so suffixes can be given their own timing.
#[derive(Debug, Clone)]
pub struct TimingPolicy {
    default: ChallengeTiming,
    slow_zones: Vec<(String, ChallengeTiming)>,
}

impl TimingPolicy {
    pub fn new(default: ChallengeTiming, slow_zones: Vec<(String, ChallengeTiming)>) -> Self {
        Self {
            default,
            slow_zones,
        }
    }

    /// The longest matching suffix wins.
    pub fn for_domain(&self, domain: &str) -> ChallengeTiming {
        self.slow_zones
            .iter()
            .filter(|(suffix, _)| domain.ends_with(suffix.as_str()))
            .max_by_key(|(suffix, _)| suffix.len())
            .map_or(self.default, |(_, timing)| *timing)
    }
}

/// The name of the TXT record answering a DNS-01 challenge for `domain`.
pub fn challenge_record_name(domain: &str) -> String {
    let base = domain.strip_prefix("*.").unwrap_or(domain);
    format!("{ACME_CHALLENGE_LABEL}.{}", base.trim_end_matches('.'))
}

/// Polls until `name` serves a TXT record with `expected` as value.
pub async fn wait_for_txt(
    lookup: &dyn TxtLookup,
    name: &str,
    expected: &str,
    timing: ChallengeTiming,
) -> anyhow::Result<()> {
    let deadline = Instant::now() + timing.timeout;
    loop {
        match lookup.lookup_txt(name).await {
            Ok(values) if values.iter().any(|value| value == expected) => {
                debug!("TXT record at {name} is visible");
                return Ok(());
            }
            Ok(_) | Err(resolver::Error::NxDomain | resolver::Error::NoRecords(_)) => {
                debug!("TXT record at {name} not visible yet");
            }
            Err(e) => {
                warn!("Looking up TXT record at {name} failed: {e:#}");
            }
        }
        if Instant::now() + timing.interval > deadline {
            bail!(
                "TXT record at {name} did not become visible within {}",
                ParsedDuration::from(timing.timeout)
            );
        }
        tokio::time::sleep(timing.interval).await;
    }
}

/// Solves DNS-01 challenges through a provider, waiting for propagation before returning.
#[derive(Clone)]
pub struct Dns01Solver {
    provider: Arc<dyn DnsProvider>,
    lookup: Arc<dyn TxtLookup>,
    timing: ChallengeTiming,
}

impl Dns01Solver {
    pub fn new(
        provider: Arc<dyn DnsProvider>,
        lookup: Arc<dyn TxtLookup>,
        timing: ChallengeTiming,
    ) -> Self {
        Self {
            provider,
            lookup,
            timing,
        }
    }

    /// Publishes `value` for `domain` and waits until resolvers can see it.
    ///
    /// The record is removed again if it never becomes visible.
    pub async fn deploy(&self, domain: &str, value: &str) -> anyhow::Result<RecordHandle> {
        let record_name = challenge_record_name(domain);
        let provider = self.provider.name();
        info!("Publishing TXT record {record_name} via {provider} ({})", self.timing);
        let handle = self
            .provider
            .present(&record_name, value)
            .await
            .context(format!("Creating TXT record {record_name} via {provider}"))?;
        if let Err(e) = wait_for_txt(self.lookup.as_ref(), &record_name, value, self.timing).await
        {
            self.cleanup(handle).await;
            return Err(e);
        }
        Ok(handle)
    }

    /// Removes a previously deployed record. Failures only leave a stale record behind.
    pub async fn cleanup(&self, handle: RecordHandle) {
        let name = handle.name.clone();
        if let Err(e) = self.provider.cleanup(handle).await {
            warn!(
                "Removing TXT record {name} via {} failed: {e:#}",
                self.provider.name()
            );
        }
    }
}
