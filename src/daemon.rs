use crate::account::AccountManager;
use crate::ca::{AcmeCertificateAuthority, CertificateAuthority};
use crate::config::{Configuration, DnsProviderKind};
use crate::dns::cloudflare::Cloudflare;
use crate::dns::resolver::Resolver;
use crate::dns::{DnsProvider, NoProvider};
use crate::queue::{JobQueue, JobReceiver, spawn_worker};
use crate::scheduler::{RenewalScheduler, SweepReport};
use crate::service::CertificateService;
use crate::state::types::CertificateRecord;
use crate::state::{Database, InstanceLock};
use crate::webhook::{NoopNotifier, Notifier, WebhookNotifier};
use crate::{api, config};
use anyhow::{Context, anyhow};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Builds the DNS-01 provider selected in the configuration.
pub fn dns_provider(config: &config::DnsConfiguration) -> anyhow::Result<Arc<dyn DnsProvider>> {
    match config.provider {
        DnsProviderKind::Cloudflare => {
            let token = config.api_token().ok_or(anyhow!(
                "The Cloudflare DNS provider needs an API token (dns.api_token or {})",
                config::CLOUDFLARE_TOKEN_ENV
            ))?;
            Ok(Arc::new(Cloudflare::try_new(config.api_url.clone(), token)?))
        }
        DnsProviderKind::None => {
            warn!("No DNS provider configured, certificates cannot be issued");
            Ok(Arc::new(NoProvider))
        }
    }
}

pub fn acme_authority(config: &Configuration) -> anyhow::Result<Arc<dyn CertificateAuthority>> {
    let provider = dns_provider(&config.dns)?;
    Ok(Arc::new(AcmeCertificateAuthority::new(
        config.acme.directory.clone(),
        config.acme.account_key.into(),
        config.acme.certificate_key.into(),
        provider,
        Arc::new(Resolver::new()),
    )))
}

/// The assembled service: storage, CA access, job queue and the pieces running on top of them.
pub struct Steward {
    config: Configuration,
    database: Arc<Database>,
    service: Arc<CertificateService>,
    jobs: JobReceiver,
    _lock: Option<InstanceLock>,
}

impl Steward {
    /// Opens the configured database (holding its instance lock) and connects to the ACME CA.
    pub async fn open(config: Configuration) -> anyhow::Result<Self> {
        let lock = InstanceLock::exclusive_lock(&config.database)
            .await
            .context("Acquiring database lock")?;
        let database = Database::open(&config.database).await?;
        let authority = acme_authority(&config)?;
        let mut steward = Self::assemble(config, database, authority)?;
        steward._lock = Some(lock);
        Ok(steward)
    }

    /// Wires the service on top of an already opened database and a CA.
    pub fn assemble(
        config: Configuration,
        database: Database,
        authority: Arc<dyn CertificateAuthority>,
    ) -> anyhow::Result<Self> {
        config.validate().context("Invalid configuration")?;
        let database = Arc::new(database);
        let accounts = Arc::new(AccountManager::new(
            authority,
            database.clone(),
            config.dns.timing_policy(),
        ));
        let notifier: Arc<dyn Notifier> = if config.webhook.enabled {
            Arc::new(WebhookNotifier::try_new(
                database.clone(),
                *config.webhook.timeout,
            )?)
        } else {
            info!("Webhook notifications are disabled");
            Arc::new(NoopNotifier)
        };
        let (queue, jobs) = JobQueue::new(config.queue.capacity.max(1));
        let service = Arc::new(CertificateService::new(
            database.clone(),
            database.clone(),
            accounts,
            notifier,
            queue,
        ));
        Ok(Self {
            config,
            database,
            service,
            jobs,
            _lock: None,
        })
    }

    pub fn service(&self) -> &Arc<CertificateService> {
        &self.service
    }

    fn scheduler(&self) -> RenewalScheduler {
        RenewalScheduler::new(
            self.service.clone(),
            *self.config.renewal.interval,
            *self.config.renewal.window,
        )
    }

    pub async fn serve(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let address = self.config.listen_address;
        let listener = TcpListener::bind(address)
            .await
            .context(format!("Binding {address}"))?;
        self.serve_on(listener, shutdown).await
    }

    /// Runs the job worker, the renewal scheduler and the HTTP API until `shutdown` fires.
    /// Queued jobs are finished before returning.
    pub async fn serve_on(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        let scheduler = self.scheduler().spawn(shutdown.clone());
        let Self {
            config,
            database,
            service,
            jobs,
            _lock,
        } = self;
        let worker = spawn_worker(jobs, service.clone(), shutdown.clone());
        let router = api::router(service, config.auth.clone());
        let result = api::serve(listener, router, shutdown.clone()).await;
        shutdown.cancel();
        if let Err(e) = scheduler.await {
            warn!("Renewal scheduler ended abnormally: {e}");
        }
        if let Err(e) = worker.await {
            warn!("Job worker ended abnormally: {e}");
        }
        database.close().await;
        result
    }

    /// A single renewal sweep, outside of the daily schedule.
    pub async fn renew_once(&self) -> anyhow::Result<SweepReport> {
        self.scheduler().sweep().await
    }

    pub async fn certificates(&self) -> anyhow::Result<Vec<CertificateRecord>> {
        Ok(self.service.list().await?)
    }
}
