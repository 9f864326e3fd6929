//! Durable storage for certificates, CA accounts and webhook configuration.
//!
//! Every write is a keyed upsert, so two writers racing on the same key converge on the last
//! complete record instead of merging partial state.

use crate::state::types::{AccountRecord, CertificateRecord, WebhookRecord};
use async_trait::async_trait;

mod db;
mod lock;
mod migration;
pub mod types;

pub type Database = db::Database;
pub type InstanceLock = lock::InstanceLock;
pub use db::test_helper::TemporaryDatabase;

pub async fn open_test_db() -> TemporaryDatabase {
    db::test_helper::open_db().await
}

#[async_trait]
pub trait CertificateStore: Send + Sync {
    async fn get_certificate(&self, main: &str) -> anyhow::Result<Option<CertificateRecord>>;

    /// Finds the record covering `domain`, either as its main domain or as one of its SANs.
    /// A record whose main domain matches exactly is preferred.
    async fn find_certificate_by_domain(
        &self,
        domain: &str,
    ) -> anyhow::Result<Option<CertificateRecord>>;

    /// Finds the first record covering any of `domains`, checked in the given order.
    async fn find_certificate_by_domains(
        &self,
        domains: &[String],
    ) -> anyhow::Result<Option<CertificateRecord>> {
        for domain in domains {
            if let Some(record) = self.find_certificate_by_domain(domain).await? {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    async fn list_certificates(&self) -> anyhow::Result<Vec<CertificateRecord>>;

    async fn upsert_certificate(&self, record: &CertificateRecord) -> anyhow::Result<()>;

    /// Returns whether a record was actually removed.
    async fn delete_certificate(&self, main: &str) -> anyhow::Result<bool>;
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn get_account(&self, email: &str) -> anyhow::Result<Option<AccountRecord>>;

    async fn upsert_account(&self, record: &AccountRecord) -> anyhow::Result<()>;
}

#[async_trait]
pub trait WebhookStore: Send + Sync {
    async fn get_webhook(&self, main: &str) -> anyhow::Result<Option<WebhookRecord>>;

    async fn upsert_webhook(&self, record: &WebhookRecord) -> anyhow::Result<()>;

    async fn delete_webhook(&self, main: &str) -> anyhow::Result<bool>;
}
