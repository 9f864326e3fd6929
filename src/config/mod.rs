use crate::config::default::DefaultConfig;
use crate::config::toml::TomlConfiguration;
use crate::crypto::asymmetric::{Curve, KeyType};
use crate::dns::{ChallengeTiming, TimingPolicy};
use crate::time::ParsedDuration;
use anyhow::bail;
use aws_lc_rs::rsa::KeySize;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use url::Url;

mod default;
mod toml;

pub const DEFAULT_CONFIG_FILE: &str = "certsteward.toml";
pub const CLOUDFLARE_TOKEN_ENV: &str = "CLOUDFLARE_DNS_API_TOKEN";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    pub listen_address: SocketAddr,
    pub database: PathBuf,
    pub acme: AcmeConfiguration,
    pub auth: AuthConfiguration,
    pub queue: QueueConfiguration,
    pub renewal: RenewalConfiguration,
    pub webhook: WebhookConfiguration,
    pub dns: DnsConfiguration,
}

impl Configuration {
    /// Rejects settings the scheduler or the propagation wait cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.renewal.interval.is_zero() {
            bail!("renewal.interval must be greater than zero");
        }
        if self.dns.interval.is_zero() {
            bail!("dns.interval must be greater than zero");
        }
        if let Some(zone) = self.dns.slow_zones.iter().find(|zone| zone.interval.is_zero()) {
            bail!(
                "dns.slow_zones interval for {} must be greater than zero",
                zone.suffix
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcmeConfiguration {
    pub directory: Url,
    pub account_key: KeyAlgorithm,
    pub certificate_key: KeyAlgorithm,
}

/// HTTP Basic credentials for the API. An empty username disables authentication.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfiguration {
    pub username: String,
    pub password: String,
}

impl AuthConfiguration {
    pub fn is_enabled(&self) -> bool {
        !self.username.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfiguration {
    pub capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenewalConfiguration {
    pub interval: ParsedDuration,
    /// Certificates expiring within this window are renewed.
    pub window: ParsedDuration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfiguration {
    pub enabled: bool,
    pub timeout: ParsedDuration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DnsProviderKind {
    Cloudflare,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfiguration {
    pub provider: DnsProviderKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,
    pub api_url: Url,
    pub timeout: ParsedDuration,
    pub interval: ParsedDuration,
    pub slow_zones: Vec<SlowZone>,
}

/// Registries that publish zone changes slowly get their own propagation timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlowZone {
    pub suffix: String,
    pub timeout: ParsedDuration,
    pub interval: ParsedDuration,
}

impl DnsConfiguration {
    /// The configured token, or the one from the environment.
    pub fn api_token(&self) -> Option<String> {
        self.api_token
            .clone()
            .filter(|token| !token.is_empty())
            .or_else(|| std::env::var(CLOUDFLARE_TOKEN_ENV).ok())
            .filter(|token| !token.is_empty())
    }

    pub fn timing_policy(&self) -> TimingPolicy {
        let default = ChallengeTiming {
            timeout: *self.timeout,
            interval: *self.interval,
        };
        let slow_zones = self
            .slow_zones
            .iter()
            .map(|zone| {
                (
                    zone.suffix.clone(),
                    ChallengeTiming {
                        timeout: *zone.timeout,
                        interval: *zone.interval,
                    },
                )
            })
            .collect();
        TimingPolicy::new(default, slow_zones)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyAlgorithm {
    #[serde(rename = "rsa2048")]
    Rsa2048,
    #[serde(rename = "rsa3072")]
    Rsa3072,
    #[serde(rename = "rsa4096")]
    Rsa4096,
    #[serde(rename = "ecdsa-p256")]
    EcdsaP256,
    #[serde(rename = "ecdsa-p384")]
    EcdsaP384,
}

impl From<KeyAlgorithm> for KeyType {
    fn from(value: KeyAlgorithm) -> Self {
        match value {
            KeyAlgorithm::Rsa2048 => KeyType::Rsa(KeySize::Rsa2048),
            KeyAlgorithm::Rsa3072 => KeyType::Rsa(KeySize::Rsa3072),
            KeyAlgorithm::Rsa4096 => KeyType::Rsa(KeySize::Rsa4096),
            KeyAlgorithm::EcdsaP256 => KeyType::Ecdsa(Curve::P256),
            KeyAlgorithm::EcdsaP384 => KeyType::Ecdsa(Curve::P384),
        }
    }
}

pub trait ConfigBackend {
    fn load<P: AsRef<Path>>(file: P) -> Result<Configuration, anyhow::Error>;
    fn save<P: AsRef<Path>>(config: &Configuration, file: P) -> Result<(), anyhow::Error>;
}

/// Loads the configuration from `file`, writing the defaults there first if it does not exist.
pub fn load<P: AsRef<Path>>(file: P) -> Result<Configuration, anyhow::Error> {
    let config = if file.as_ref().exists() {
        TomlConfiguration::load(file)?
    } else {
        let default = DefaultConfig::load(&file)?;
        TomlConfiguration::save(&default, &file)?;
        default
    };
    config.validate()?;
    Ok(config)
}

pub fn save<P: AsRef<Path>>(config: &Configuration, file: P) -> Result<(), anyhow::Error> {
    TomlConfiguration::save(config, file)
}
