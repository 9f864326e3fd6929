use crate::config::{
    AcmeConfiguration, AuthConfiguration, ConfigBackend, Configuration, DnsConfiguration,
    DnsProviderKind, KeyAlgorithm, QueueConfiguration, RenewalConfiguration, SlowZone,
    WebhookConfiguration,
};
use crate::dns::cloudflare;
use anyhow::{Error, bail};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

const LETS_ENCRYPT_DIRECTORY: &str = "https://acme-v02.api.letsencrypt.org/directory";
const ONE_DAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Default)]
pub struct DefaultConfig {}

impl DefaultConfig {
    pub fn get_config(&self) -> Configuration {
        Configuration::default()
    }
}

impl ConfigBackend for DefaultConfig {
    fn load<P: AsRef<Path>>(_file: P) -> Result<Configuration, Error> {
        Ok(Self::default().get_config())
    }

    fn save<P: AsRef<Path>>(_config: &Configuration, _file: P) -> Result<(), Error> {
        bail!("default backend cannot save to file")
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            listen_address: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8080)),
            database: "acme.db".into(),
            acme: AcmeConfiguration::default(),
            auth: AuthConfiguration::default(),
            queue: QueueConfiguration::default(),
            renewal: RenewalConfiguration::default(),
            webhook: WebhookConfiguration::default(),
            dns: DnsConfiguration::default(),
        }
    }
}

impl Default for AcmeConfiguration {
    fn default() -> Self {
        Self {
            directory: Url::from_str(LETS_ENCRYPT_DIRECTORY)
                .expect("BUG: built-in directory URL is invalid"),
            account_key: KeyAlgorithm::Rsa4096,
            certificate_key: KeyAlgorithm::Rsa4096,
        }
    }
}

impl Default for QueueConfiguration {
    fn default() -> Self {
        Self { capacity: 5 }
    }
}

impl Default for RenewalConfiguration {
    fn default() -> Self {
        Self {
            interval: ONE_DAY.into(),
            window: (30 * ONE_DAY).into(),
        }
    }
}

impl Default for WebhookConfiguration {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout: 10.into(),
        }
    }
}

impl Default for DnsConfiguration {
    fn default() -> Self {
        Self {
            provider: DnsProviderKind::Cloudflare,
            api_token: None,
            api_url: Url::from_str(cloudflare::DEFAULT_API_URL)
                .expect("BUG: built-in Cloudflare API URL is invalid"),
            timeout: 120.into(),
            interval: 2.into(),
            slow_zones: vec![SlowZone {
                suffix: ".id".to_string(),
                timeout: 3600.into(),
                interval: 30.into(),
            }],
        }
    }
}
