use async_trait::async_trait;
use hickory_resolver::config::ResolverConfig;
use hickory_resolver::lookup::Lookup;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::rr::RecordType;
use tracing::warn;

/// Source of TXT records, used to check whether a challenge record has propagated.
#[async_trait]
pub trait TxtLookup: Send + Sync {
    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, Error>;
}

#[derive(Debug)]
pub struct Resolver {
    resolver: hickory_resolver::Resolver<TokioConnectionProvider>,
}

impl Resolver {
    /// Create a new DNS resolver with default settings. The resolver will use the system configuration (`/etc/resolv.conf` or equivalent)
    /// if available, otherwise it falls back to a compiled-in default (currently Cloudflare DNS).
    pub fn new() -> Self {
        let resolver = hickory_resolver::Resolver::builder_tokio()
            .unwrap_or_else(|e| {
                warn!("Failed to create DNS resolver using system configuration, using default servers instead: {e:#}");
                hickory_resolver::Resolver::builder_with_config(
                    ResolverConfig::cloudflare(),
                    TokioConnectionProvider::default(),
                )
            })
            .build();
        Self { resolver }
    }

    async fn lookup_generic(&self, name: &str, rtype: RecordType) -> Result<Lookup, Error> {
        match self.resolver.lookup(name, rtype).await {
            Ok(lookup) => Ok(lookup),
            // Note: Order matters, because is_no_records_found includes is_nx_domain
            Err(e) if e.is_nx_domain() => Err(Error::NxDomain),
            Err(e) if e.is_no_records_found() => Err(Error::NoRecords(rtype)),
            Err(e) => Err(e.into()),
        }
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TxtLookup for Resolver {
    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, Error> {
        let lookup = self.lookup_generic(name, RecordType::TXT).await?;
        Ok(lookup
            .record_iter()
            .filter_map(|record| record.data().as_txt())
            // a TXT record may be split into several character-strings
            .map(|txt| {
                txt.txt_data()
                    .iter()
                    .map(|chunk| String::from_utf8_lossy(chunk))
                    .collect::<String>()
            })
            .collect())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("the domain does not exist (NXDOMAIN)")]
    NxDomain,
    #[error("No DNS records found for RR type {0}")]
    NoRecords(RecordType),
    #[error("DNS resolution failed")]
    LookupFailure(#[from] hickory_resolver::ResolveError),
}
