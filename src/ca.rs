//! The certificate authority capability the orchestrator drives.
//!
//! [`CertificateAuthority`] covers account registration, [`CaSession`] the issuance work done
//! with a ready account. The ACME implementation solves DNS-01 challenges through a
//! [`DnsProvider`] and waits for propagation before asking the CA to validate.

use crate::acme::client::{AccountRegisterOptions, AcmeClient};
use crate::acme::object::{
    AccountStatus, AuthorizationStatus, ChallengeStatus, Identifier, InnerChallenge,
    NewOrderRequest, Order, OrderStatus,
};
use crate::cert::{create_and_sign_csr, load_certificates_from_memory};
use crate::crypto::asymmetric::{KeyPair, KeyType, new_key};
use crate::crypto::jws::JsonWebKey;
use crate::dns::resolver::TxtLookup;
use crate::dns::{ChallengeTiming, Dns01Solver, DnsProvider};
use crate::state::types::{AccountRecord, CertificateRecord};
use anyhow::{Context, anyhow, bail};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use url::Url;

/// Key and chain returned by a successful issuance, both PEM encoded.
#[derive(Clone, PartialEq, Eq)]
pub struct CertificateMaterial {
    pub private_key: Vec<u8>,
    pub certificate: Vec<u8>,
}

impl std::fmt::Debug for CertificateMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateMaterial")
            .field("private_key", &format!("<{} bytes>", self.private_key.len()))
            .field("certificate", &format!("<{} bytes>", self.certificate.len()))
            .finish()
    }
}

#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// Generates a fresh account key, PEM encoded.
    fn new_account_key(&self) -> anyhow::Result<Vec<u8>>;

    /// Registers a new account for `email`, agreeing to the terms of service.
    /// Returns the account URI assigned by the CA.
    async fn register(&self, account_key: &[u8], email: &str) -> anyhow::Result<String>;

    /// Checks that a stored account is still usable. Never registers and never rotates the key.
    async fn query_registration(&self, account: &AccountRecord) -> anyhow::Result<()>;

    /// Binds a ready account to challenge solving with the given propagation timing.
    async fn connect(
        &self,
        account: &AccountRecord,
        timing: ChallengeTiming,
    ) -> anyhow::Result<Box<dyn CaSession>>;
}

#[async_trait]
pub trait CaSession: Send + Sync {
    async fn obtain(&self, domains: &[String]) -> anyhow::Result<CertificateMaterial>;

    async fn renew(&self, existing: &CertificateRecord) -> anyhow::Result<CertificateMaterial>;
}

pub struct AcmeCertificateAuthority {
    directory: Url,
    account_key_type: KeyType,
    certificate_key_type: KeyType,
    client: OnceCell<Arc<AcmeClient>>,
    provider: Arc<dyn DnsProvider>,
    lookup: Arc<dyn TxtLookup>,
}

impl AcmeCertificateAuthority {
    pub fn new(
        directory: Url,
        account_key_type: KeyType,
        certificate_key_type: KeyType,
        provider: Arc<dyn DnsProvider>,
        lookup: Arc<dyn TxtLookup>,
    ) -> Self {
        Self {
            directory,
            account_key_type,
            certificate_key_type,
            client: OnceCell::new(),
            provider,
            lookup,
        }
    }

    /// The directory is only fetched once a CA interaction actually happens.
    async fn client(&self) -> anyhow::Result<&Arc<AcmeClient>> {
        self.client
            .get_or_try_init(|| async {
                let client = AcmeClient::try_new(self.directory.clone())
                    .await
                    .context(format!("Fetching ACME directory {}", self.directory))?;
                Ok(Arc::new(client))
            })
            .await
    }

    fn account_key(account: &AccountRecord) -> anyhow::Result<JsonWebKey> {
        let keypair = KeyPair::from_pem_bytes(&account.private_key)
            .context(format!("Loading stored account key for {}", account.email))?;
        let url = Url::parse(&account.uri)
            .context(format!("Stored account URI for {} is invalid", account.email))?;
        Ok(JsonWebKey::new_existing(keypair, url))
    }
}

#[async_trait]
impl CertificateAuthority for AcmeCertificateAuthority {
    fn new_account_key(&self) -> anyhow::Result<Vec<u8>> {
        let key = new_key(self.account_key_type)?;
        Ok(key.to_pem_string()?.into_bytes())
    }

    async fn register(&self, account_key: &[u8], email: &str) -> anyhow::Result<String> {
        let key = KeyPair::from_pem_bytes(account_key)?;
        let contact = Url::parse(&format!("mailto:{email}"))
            .context(format!("{email} is not a usable contact address"))?;
        let client = self.client().await?;
        let (_, account_url, account) = client
            .register_account(AccountRegisterOptions {
                key,
                contact: vec![contact],
                terms_of_service_agreed: Some(true),
            })
            .await
            .context(format!("Registering ACME account for {email}"))?;
        if account.status != AccountStatus::Valid {
            bail!(
                "Newly registered account {account_url} has status {}",
                account.status
            );
        }
        info!("Registered ACME account {account_url} for {email}");
        Ok(account_url.to_string())
    }

    async fn query_registration(&self, account: &AccountRecord) -> anyhow::Result<()> {
        let key = Self::account_key(account)?;
        let url = Url::parse(&account.uri)?;
        let client = self.client().await?;
        let current = client
            .query_account(&key, &url)
            .await
            .context(format!("Querying ACME account {url}"))?;
        match current.status {
            AccountStatus::Valid => {
                debug!("ACME account {url} for {} is valid", account.email);
                Ok(())
            }
            status => bail!("ACME account {url} for {} is {status}", account.email),
        }
    }

    async fn connect(
        &self,
        account: &AccountRecord,
        timing: ChallengeTiming,
    ) -> anyhow::Result<Box<dyn CaSession>> {
        let client = self.client().await?.clone();
        let account_key = Self::account_key(account)?;
        let solver = Dns01Solver::new(self.provider.clone(), self.lookup.clone(), timing);
        Ok(Box::new(AcmeSession {
            client,
            account_key,
            certificate_key_type: self.certificate_key_type,
            solver,
        }))
    }
}

struct AcmeSession {
    client: Arc<AcmeClient>,
    account_key: JsonWebKey,
    certificate_key_type: KeyType,
    solver: Dns01Solver,
}

#[async_trait]
impl CaSession for AcmeSession {
    async fn obtain(&self, domains: &[String]) -> anyhow::Result<CertificateMaterial> {
        info!("Issuing certificate for {}", domains.join(", "));
        let cert_key = new_key(self.certificate_key_type)?;
        let csr = create_and_sign_csr(&cert_key.to_rcgen_keypair()?, domains)?;
        let request = NewOrderRequest {
            identifiers: domains
                .iter()
                .map(|domain| Identifier::from(domain.as_str()))
                .collect(),
        };
        let certificate = self.order_and_authorize(csr, request).await?;
        Ok(CertificateMaterial {
            private_key: cert_key.to_pem_string()?.into_bytes(),
            certificate,
        })
    }

    async fn renew(&self, existing: &CertificateRecord) -> anyhow::Result<CertificateMaterial> {
        let domains = renewal_domains(existing);
        if domains.is_empty() {
            bail!("Certificate {} does not name any domain", existing.main);
        }
        info!("Renewing certificate {}", existing.main);
        self.obtain(&domains).await
    }
}

impl AcmeSession {
    async fn order_and_authorize(
        &self,
        csr: rcgen::CertificateSigningRequest,
        request: NewOrderRequest,
    ) -> anyhow::Result<Vec<u8>> {
        let client = &self.client;
        let key = &self.account_key;
        let (order_url, mut order) = client
            .new_order(key, &request)
            .await
            .context("Error creating new order")?;
        debug!("Order URL: {order_url}");
        match order.status {
            OrderStatus::Valid => {
                debug!("CA claims new order is already valid, downloading certificate anyway");
                return self.download(order).await;
            }
            OrderStatus::Ready | OrderStatus::Processing => {
                debug!("New order is already ready, finalizing");
                let final_order = client
                    .finalize_order(key, &order, &order_url, &csr)
                    .await
                    .context("Error finalizing order")?;
                return self.download(final_order).await;
            }
            OrderStatus::Invalid => {
                return Err(order.error.map_or(
                    anyhow!("New order has unacceptable status (invalid)"),
                    |problem| anyhow!("New order is invalid: {problem}"),
                ));
            }
            OrderStatus::Pending => {
                self.authorize(&order)
                    .await
                    .context("Error authorizing certificate issuance")?;
                info!("Finished authorizing all identifiers");
            }
        }
        order = client
            .get_order(key, &order_url)
            .await
            .context("Re-fetching fully authorized order")?;
        match order.status {
            OrderStatus::Valid => self.download(order).await,
            OrderStatus::Ready | OrderStatus::Processing => {
                debug!("Finalizing order");
                let final_order = client
                    .finalize_order(key, &order, &order_url, &csr)
                    .await
                    .context("Error finalizing order")?;
                self.download(final_order).await
            }
            OrderStatus::Pending => {
                bail!("Order is still pending after having authorized all identifiers")
            }
            OrderStatus::Invalid => Err(order.error.map_or(
                anyhow!("Order has invalid status (no error reported by CA)"),
                |problem| anyhow!("Order has invalid status: {problem}"),
            )),
        }
    }

    async fn authorize(&self, order: &Order) -> anyhow::Result<()> {
        for authz_url in &order.authorizations {
            debug!("Checking authorization @ {authz_url}");
            let authz = self
                .client
                .get_authorization(&self.account_key, authz_url)
                .await
                .context("Retrieving authorization from server")?;
            let id = authz.identifier;
            match authz.status {
                AuthorizationStatus::Valid => {
                    debug!("Authorization for {id} already valid");
                }
                AuthorizationStatus::Pending => {
                    let Identifier::Dns { value: domain } = &id else {
                        bail!("Order contains an authorization for an unsupported identifier type");
                    };
                    info!("Found pending authorization for {id}, solving dns-01 challenge");
                    let (challenge_url, token) = authz
                        .challenges
                        .into_iter()
                        .filter(|challenge| matches!(challenge.status, ChallengeStatus::Pending))
                        .find_map(|challenge| match challenge.inner_challenge {
                            InnerChallenge::Dns(dns) => Some((challenge.url, dns.token)),
                            InnerChallenge::Unknown => None,
                        })
                        .ok_or(anyhow!(
                            "Authorization for {id} did not contain a pending dns-01 challenge"
                        ))?;
                    let value = self.account_key.dns01_txt_value(&token.to_string());
                    let handle = self
                        .solver
                        .deploy(domain, &value)
                        .await
                        .context(format!("Deploying dns-01 challenge for {id}"))?;
                    let validated = self
                        .client
                        .validate_challenge(&self.account_key, &challenge_url)
                        .await
                        .context(format!("Error validating dns-01 challenge for {id}"));
                    self.solver.cleanup(handle).await;
                    validated?;
                    info!("Successfully validated challenge for {id}");
                }
                AuthorizationStatus::Invalid => {
                    let problems = authz
                        .challenges
                        .into_iter()
                        .filter_map(|challenge| challenge.error)
                        .map(|problem| format!("\n{problem}"))
                        .collect::<String>();
                    bail!("Failed to authorize {id}. The CA reported these problems: {problems}");
                }
                AuthorizationStatus::Deactivated
                | AuthorizationStatus::Expired
                | AuthorizationStatus::Revoked => {
                    bail!(
                        "Authorization for {id} is in an invalid status (deactivated, expired, or revoked)"
                    );
                }
            }
        }
        Ok(())
    }

    async fn download(&self, order: Order) -> anyhow::Result<Vec<u8>> {
        let certificate_url = order.certificate.ok_or(anyhow!(
            "CA did not provide a certificate URL for final order"
        ))?;
        debug!("Final certificate available @ {certificate_url}");
        let chain = self
            .client
            .download_certificate(&self.account_key, &certificate_url)
            .await
            .context("Downloading certificate")?;
        info!("Successfully issued a certificate");
        Ok(chain)
    }
}

/// The domains to request again when renewing: the SANs of the stored leaf, or the record's
/// own list when the stored chain cannot be read.
pub fn renewal_domains(existing: &CertificateRecord) -> Vec<String> {
    let from_chain = load_certificates_from_memory(&existing.certificate, Some(1))
        .ok()
        .and_then(|certs| certs.into_iter().next())
        .map(|leaf| leaf.subject_alternative_names)
        .filter(|sans| !sans.is_empty());
    match from_chain {
        Some(sans) => sans,
        None => {
            warn!(
                "Cannot read SANs of stored certificate {}, using the recorded domain list",
                existing.main
            );
            existing.domains().map(str::to_string).collect()
        }
    }
}


/// A certificate authority that signs locally, for exercising the orchestration without a CA.
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helper {
    use super::{CaSession, CertificateAuthority, CertificateMaterial};
    use crate::dns::ChallengeTiming;
    use crate::state::types::{AccountRecord, CertificateRecord};
    use anyhow::bail;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::ops::Deref;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::{Notify, Semaphore};

    /// Signs a self-signed certificate for `domains` valid in the given window.
    ///
    /// # Panics
    ///
    /// If rcgen cannot generate the key or certificate.
    pub fn self_signed(
        domains: &[String],
        not_before: time::OffsetDateTime,
        not_after: time::OffsetDateTime,
    ) -> CertificateMaterial {
        let key = rcgen::KeyPair::generate().expect("generating test key");
        let mut params =
            rcgen::CertificateParams::new(domains.to_vec()).expect("building test certificate");
        params.not_before = not_before;
        params.not_after = not_after;
        let cert = params.self_signed(&key).expect("signing test certificate");
        CertificateMaterial {
            private_key: key.serialize_pem().into_bytes(),
            certificate: cert.pem().into_bytes(),
        }
    }

    /// Cheap to clone; all clones share the same state.
    #[derive(Debug, Clone, Default)]
    pub struct FakeAuthority {
        state: Arc<FakeState>,
    }

    impl Deref for FakeAuthority {
        type Target = FakeState;

        fn deref(&self) -> &Self::Target {
            &self.state
        }
    }

    #[derive(Debug)]
    pub struct FakeState {
        pub registrations: AtomicUsize,
        pub queries: AtomicUsize,
        /// Domain sets of every obtain and renew call, in order.
        pub issued: Mutex<Vec<Vec<String>>>,
        pub renewed: Mutex<Vec<String>>,
        pub connected: Mutex<Vec<ChallengeTiming>>,
        pub lifetime: Mutex<time::Duration>,
        pub fail_registration: AtomicBool,
        pub fail_query: AtomicBool,
        pub fail_issuance: AtomicBool,
        pub empty_material: AtomicBool,
        pub unparsable_chain: AtomicBool,
        /// Every issuance takes one permit, so a gate without permits holds issuance back.
        pub gate: Semaphore,
        /// Signalled whenever an issuance starts.
        pub entered: Notify,
    }

    impl Default for FakeState {
        fn default() -> Self {
            Self {
                registrations: AtomicUsize::new(0),
                queries: AtomicUsize::new(0),
                issued: Mutex::new(Vec::new()),
                renewed: Mutex::new(Vec::new()),
                connected: Mutex::new(Vec::new()),
                lifetime: Mutex::new(time::Duration::days(90)),
                fail_registration: AtomicBool::new(false),
                fail_query: AtomicBool::new(false),
                fail_issuance: AtomicBool::new(false),
                empty_material: AtomicBool::new(false),
                unparsable_chain: AtomicBool::new(false),
                gate: Semaphore::new(Semaphore::MAX_PERMITS),
                entered: Notify::new(),
            }
        }
    }

    impl FakeAuthority {
        /// An authority whose issuance blocks until permits are added to `gate`.
        pub fn gated() -> Self {
            Self {
                state: Arc::new(FakeState {
                    gate: Semaphore::new(0),
                    ..FakeState::default()
                }),
            }
        }

        fn issue(&self, domains: &[String]) -> anyhow::Result<CertificateMaterial> {
            self.issued.lock().push(domains.to_vec());
            if self.fail_issuance.load(Ordering::SeqCst) {
                bail!("CA refused the order");
            }
            if self.empty_material.load(Ordering::SeqCst) {
                return Ok(CertificateMaterial {
                    private_key: Vec::new(),
                    certificate: Vec::new(),
                });
            }
            if self.unparsable_chain.load(Ordering::SeqCst) {
                return Ok(CertificateMaterial {
                    private_key: b"not a key".to_vec(),
                    certificate: b"not a chain".to_vec(),
                });
            }
            let not_before = time::OffsetDateTime::now_utc().replace_nanosecond(0)?;
            let not_after = not_before + *self.lifetime.lock();
            Ok(self_signed(domains, not_before, not_after))
        }

        async fn pass_gate(&self) -> anyhow::Result<()> {
            self.entered.notify_one();
            let _permit = self.gate.acquire().await?;
            Ok(())
        }
    }

    #[async_trait]
    impl CertificateAuthority for FakeAuthority {
        fn new_account_key(&self) -> anyhow::Result<Vec<u8>> {
            let key = rcgen::KeyPair::generate()?;
            Ok(key.serialize_pem().into_bytes())
        }

        async fn register(&self, _account_key: &[u8], email: &str) -> anyhow::Result<String> {
            if self.fail_registration.load(Ordering::SeqCst) {
                bail!("registration for {email} refused");
            }
            let n = self.registrations.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("https://ca.test/acct/{n}"))
        }

        async fn query_registration(&self, account: &AccountRecord) -> anyhow::Result<()> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            if self.fail_query.load(Ordering::SeqCst) {
                bail!("account {} does not exist", account.uri);
            }
            Ok(())
        }

        async fn connect(
            &self,
            _account: &AccountRecord,
            timing: ChallengeTiming,
        ) -> anyhow::Result<Box<dyn CaSession>> {
            self.connected.lock().push(timing);
            Ok(Box::new(self.clone()))
        }
    }

    #[async_trait]
    impl CaSession for FakeAuthority {
        async fn obtain(&self, domains: &[String]) -> anyhow::Result<CertificateMaterial> {
            self.pass_gate().await?;
            self.issue(domains)
        }

        async fn renew(&self, existing: &CertificateRecord) -> anyhow::Result<CertificateMaterial> {
            self.pass_gate().await?;
            self.renewed.lock().push(existing.main.clone());
            let domains = super::renewal_domains(existing);
            self.issue(&domains)
        }
    }
}
