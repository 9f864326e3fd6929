//! The certificate orchestrator: request validation, main-domain resolution, and the
//! issuance and renewal paths that end in a stored record and a webhook event.

use crate::account::AccountManager;
use crate::ca::CertificateMaterial;
use crate::cert::parse_leaf;
use crate::error::{JobContext, JobError, JobResult, ServiceError, ServiceResult};
use crate::queue::{Job, JobHandler, JobQueue};
use crate::state::types::{CertificateRecord, WebhookHeaders, WebhookRecord, join_sans};
use crate::state::{CertificateStore, WebhookStore};
use crate::webhook::{Delivery, EventType, Notifier, WebhookEvent, WebhookOverride};
use anyhow::{Context, anyhow};
use async_trait::async_trait;
use itertools::Itertools;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Removes duplicates, keeping the first occurrence of each domain in place. Blank names are
/// rejected.
pub fn validate_domains(domains: &[String]) -> ServiceResult<Vec<String>> {
    if domains.is_empty() {
        return Err(ServiceError::InvalidInput("no domain was given".to_string()));
    }
    if domains.iter().any(|domain| domain.trim().is_empty()) {
        return Err(ServiceError::InvalidInput("blank domain name".to_string()));
    }
    Ok(domains.iter().unique().cloned().collect())
}

/// Builds the record to store for freshly issued material.
///
/// Validity comes from the new leaf. If it cannot be read, the material is kept anyway with
/// both bounds set to `timestamp`, which makes the next renewal sweep pick it up.
pub fn certificate_record(
    main: String,
    sans: String,
    email: String,
    material: CertificateMaterial,
    timestamp: i64,
) -> CertificateRecord {
    let (not_before_ts, not_after_ts) =
        match parse_leaf(&material.certificate, &material.private_key) {
            Ok(leaf)
                if leaf.validity.not_before_millis() <= leaf.validity.not_after_millis() =>
            {
                (
                    leaf.validity.not_before_millis(),
                    leaf.validity.not_after_millis(),
                )
            }
            Ok(_) => {
                warn!("Certificate for {main} ends before it starts, storing it as already due");
                (timestamp, timestamp)
            }
            Err(e) => {
                warn!(
                    "Cannot read validity of the certificate for {main}, storing it as already due: {e:#}"
                );
                (timestamp, timestamp)
            }
        };
    CertificateRecord {
        main,
        sans,
        email,
        private_key: material.private_key,
        certificate: material.certificate,
        not_before_ts,
        not_after_ts,
        upserted_ts: timestamp,
    }
}

fn check_material(main: &str, material: &CertificateMaterial) -> JobResult<()> {
    if material.private_key.is_empty() || material.certificate.is_empty() {
        return anyhow!("CA returned empty key or certificate material for {main}")
            .issuance_failure();
    }
    Ok(())
}

pub struct CertificateService {
    certs: Arc<dyn CertificateStore>,
    webhooks: Arc<dyn WebhookStore>,
    accounts: Arc<AccountManager>,
    notifier: Arc<dyn Notifier>,
    queue: JobQueue,
}

impl CertificateService {
    pub fn new(
        certs: Arc<dyn CertificateStore>,
        webhooks: Arc<dyn WebhookStore>,
        accounts: Arc<AccountManager>,
        notifier: Arc<dyn Notifier>,
        queue: JobQueue,
    ) -> Self {
        Self {
            certs,
            webhooks,
            accounts,
            notifier,
            queue,
        }
    }

    /// An existing record covering any of `domains` keeps its main domain, so a request for the
    /// same names in another order updates that record instead of creating a second one.
    pub async fn resolve_main(&self, domains: &[String]) -> ServiceResult<String> {
        let existing = self
            .certs
            .find_certificate_by_domains(domains)
            .await
            .context("Looking up existing certificates")?;
        match (existing, domains.first()) {
            (Some(record), _) => {
                debug!("Requested domains are covered by existing certificate {}", record.main);
                Ok(record.main)
            }
            (None, Some(first)) => Ok(first.clone()),
            (None, None) => Err(ServiceError::InvalidInput("no domain was given".to_string())),
        }
    }

    /// Validates a request and queues it. Returns the main domain the certificate is stored under.
    pub async fn submit(
        &self,
        timestamp: i64,
        email: &str,
        domains: &[String],
        webhook: Option<WebhookOverride>,
    ) -> ServiceResult<String> {
        if email.is_empty() {
            return Err(ServiceError::InvalidInput("no email was given".to_string()));
        }
        let domains = validate_domains(domains)?;
        let main = self.resolve_main(&domains).await?;
        info!("Generate certificate {main} for {}", domains.join(", "));
        let job = Job {
            timestamp,
            email: email.to_string(),
            main: main.clone(),
            domains,
            webhook: webhook.filter(|webhook| !webhook.url.is_empty()),
        };
        if self.queue.enqueue(job) {
            Ok(main)
        } else {
            Err(ServiceError::Busy)
        }
    }

    /// Issues the certificate for a queued job, stores it and notifies.
    pub async fn execute(&self, job: Job) -> JobResult<()> {
        let Job {
            timestamp,
            email,
            main,
            domains,
            webhook,
        } = job;
        let session = self.accounts.get_client(timestamp, &email, &main).await?;
        let material = session
            .obtain(&domains)
            .await
            .context(format!("Obtaining certificate for {main}"))
            .issuance_failure()?;
        check_material(&main, &material)?;
        let record = certificate_record(main, join_sans(&domains), email, material, timestamp);
        self.store(&record).await?;
        info!("Issued certificate {}", record.main);
        self.notify(EventType::Generate, &record, webhook.as_ref())
            .await;
        Ok(())
    }

    /// Renews `existing` in place. Main domain, SANs and email are carried over unchanged.
    pub async fn renew_record(
        &self,
        timestamp: i64,
        existing: &CertificateRecord,
    ) -> JobResult<CertificateRecord> {
        let main = &existing.main;
        let session = self
            .accounts
            .get_client(timestamp, &existing.email, main)
            .await?;
        let material = session
            .renew(existing)
            .await
            .context(format!("Renewing certificate for {main}"))
            .issuance_failure()?;
        check_material(main, &material)?;
        let record = certificate_record(
            main.clone(),
            existing.sans.clone(),
            existing.email.clone(),
            material,
            timestamp,
        );
        self.store(&record).await?;
        info!("Renewed certificate {main}");
        self.notify(EventType::Renew, &record, None).await;
        Ok(record)
    }

    async fn store(&self, record: &CertificateRecord) -> JobResult<()> {
        self.certs
            .upsert_certificate(record)
            .await
            .context(format!("Saving certificate {}", record.main))
            .persistence_failure()
    }

    /// The certificate is already stored at this point, so failures are only logged.
    async fn notify(
        &self,
        event_type: EventType,
        record: &CertificateRecord,
        webhook: Option<&WebhookOverride>,
    ) {
        let event = WebhookEvent {
            event_type,
            main: &record.main,
            email: &record.email,
            private_key: &record.private_key,
            certificate: &record.certificate,
        };
        match self.notifier.notify(&event, webhook).await.notification_failure() {
            Ok(Delivery::Delivered) => debug!("Delivered {event_type} event for {}", record.main),
            Ok(Delivery::Skipped) => {}
            Err(err) => warn!("{} event for {}: {err}", event_type, record.main),
        }
    }

    pub async fn find_by_domain(&self, domain: &str) -> ServiceResult<CertificateRecord> {
        if domain.is_empty() {
            return Err(ServiceError::InvalidInput("no domain was given".to_string()));
        }
        self.certs
            .find_certificate_by_domain(domain)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("certificate for {domain}")))
    }

    pub async fn list(&self) -> ServiceResult<Vec<CertificateRecord>> {
        Ok(self.certs.list_certificates().await?)
    }

    /// Removes the certificate stored under `main` together with its webhook endpoint.
    pub async fn delete(&self, main: &str) -> ServiceResult<()> {
        let deleted = self.certs.delete_certificate(main).await?;
        self.webhooks.delete_webhook(main).await?;
        if deleted {
            info!("Deleted certificate {main}");
            Ok(())
        } else {
            Err(ServiceError::NotFound(format!("certificate {main}")))
        }
    }

    /// Sets the webhook endpoint of the certificate covering `domain`.
    pub async fn update_webhook(
        &self,
        domain: &str,
        url: &str,
        headers: WebhookHeaders,
    ) -> ServiceResult<WebhookRecord> {
        if url.is_empty() {
            return Err(ServiceError::InvalidInput("no webhook URL was given".to_string()));
        }
        let record = self.find_by_domain(domain).await?;
        let webhook = WebhookRecord {
            main: record.main,
            url: url.to_string(),
            headers,
        };
        self.webhooks.upsert_webhook(&webhook).await?;
        info!("Webhook for {} now points to {url}", webhook.main);
        Ok(webhook)
    }

    pub async fn delete_webhook(&self, domain: &str) -> ServiceResult<()> {
        let main = match self.certs.find_certificate_by_domain(domain).await? {
            Some(record) => record.main,
            None => domain.to_string(),
        };
        if self.webhooks.delete_webhook(&main).await? {
            info!("Deleted webhook for {main}");
            Ok(())
        } else {
            Err(ServiceError::NotFound(format!("webhook for {domain}")))
        }
    }
}

#[async_trait]
impl JobHandler for CertificateService {
    async fn handle(&self, job: Job) -> JobResult<()> {
        let result = self.execute(job).await;
        if let Err(JobError::Persistence(e)) = &result {
            error!("Issued certificate could not be stored, its key material is lost: {e:#}");
        }
        result
    }
}
