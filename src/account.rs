use crate::ca::{CaSession, CertificateAuthority};
use crate::dns::TimingPolicy;
use crate::error::{JobContext, JobResult};
use crate::state::AccountStore;
use crate::state::types::AccountRecord;
use anyhow::Context;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Hands out CA sessions for an email, registering the account on first use.
///
/// The job worker and the renewal sweep both call in here, so account creation is serialized to
/// keep two callers from registering the same email twice.
pub struct AccountManager {
    ca: Arc<dyn CertificateAuthority>,
    accounts: Arc<dyn AccountStore>,
    timing: TimingPolicy,
    registration: Mutex<()>,
}

impl AccountManager {
    pub fn new(
        ca: Arc<dyn CertificateAuthority>,
        accounts: Arc<dyn AccountStore>,
        timing: TimingPolicy,
    ) -> Self {
        Self {
            ca,
            accounts,
            timing,
            registration: Mutex::new(()),
        }
    }

    /// Returns a session for `email`, ready to issue certificates for `main`.
    pub async fn get_client(
        &self,
        timestamp: i64,
        email: &str,
        main: &str,
    ) -> JobResult<Box<dyn CaSession>> {
        let account = self.ensure_account(timestamp, email).await?;
        let timing = self.timing.for_domain(main);
        debug!("Challenges for {main} use {timing}");
        self.ca
            .connect(&account, timing)
            .await
            .context(format!("Preparing CA session for {email}"))
            .account_failure()
    }

    async fn ensure_account(&self, timestamp: i64, email: &str) -> JobResult<AccountRecord> {
        let _guard = self.registration.lock().await;
        let stored = self
            .accounts
            .get_account(email)
            .await
            .context(format!("Loading account for {email}"))
            .account_failure()?;
        match stored {
            Some(account) => {
                self.ca
                    .query_registration(&account)
                    .await
                    .context(format!("Account {} for {email} is not usable", account.uri))
                    .account_failure()?;
                Ok(account)
            }
            None => {
                info!("No account for {email} yet, registering a new one");
                let private_key = self.ca.new_account_key().account_failure()?;
                let uri = self
                    .ca
                    .register(&private_key, email)
                    .await
                    .account_failure()?;
                let account = AccountRecord {
                    email: email.to_string(),
                    uri,
                    private_key,
                    upserted_ts: timestamp,
                };
                self.accounts
                    .upsert_account(&account)
                    .await
                    .context(format!("Saving new account for {email}"))
                    .account_failure()?;
                Ok(account)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::test_helper::FakeAuthority;
    use crate::dns::ChallengeTiming;
    use crate::error::JobError;
    use crate::state::{Database, open_test_db};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn timing_policy() -> TimingPolicy {
        TimingPolicy::new(
            ChallengeTiming {
                timeout: Duration::from_secs(120),
                interval: Duration::from_secs(2),
            },
            vec![(
                ".id".to_string(),
                ChallengeTiming {
                    timeout: Duration::from_secs(3600),
                    interval: Duration::from_secs(30),
                },
            )],
        )
    }

    async fn manager(fake: &FakeAuthority) -> (AccountManager, Arc<Database>) {
        let db = Arc::new(Database::from(open_test_db().await));
        let manager = AccountManager::new(Arc::new(fake.clone()), db.clone(), timing_policy());
        (manager, db)
    }

    #[tokio::test]
    async fn test_unknown_account_is_registered_and_stored() {
        let fake = FakeAuthority::default();
        let (manager, db) = manager(&fake).await;

        manager.get_client(42, "x@y.com", "a.com").await.unwrap();

        let stored = db.get_account("x@y.com").await.unwrap().unwrap();
        assert_eq!(stored.uri, "https://ca.test/acct/1");
        assert_eq!(stored.upserted_ts, 42);
        assert!(!stored.private_key.is_empty());
        assert_eq!(fake.registrations.load(Ordering::SeqCst), 1);
        assert_eq!(fake.queries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_known_account_is_queried_not_rotated() {
        let fake = FakeAuthority::default();
        let (manager, db) = manager(&fake).await;
        manager.get_client(1, "x@y.com", "a.com").await.unwrap();
        let first = db.get_account("x@y.com").await.unwrap().unwrap();

        manager.get_client(2, "x@y.com", "b.com").await.unwrap();

        let second = db.get_account("x@y.com").await.unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(fake.registrations.load(Ordering::SeqCst), 1);
        assert_eq!(fake.queries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_query_keeps_stored_account() {
        let fake = FakeAuthority::default();
        let (manager, db) = manager(&fake).await;
        manager.get_client(1, "x@y.com", "a.com").await.unwrap();
        let before = db.get_account("x@y.com").await.unwrap().unwrap();
        fake.fail_query.store(true, Ordering::SeqCst);

        let result = manager.get_client(2, "x@y.com", "a.com").await;

        assert!(matches!(result, Err(JobError::Account(_))));
        assert_eq!(db.get_account("x@y.com").await.unwrap().unwrap(), before);
        assert_eq!(fake.registrations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_registration_stores_nothing() {
        let fake = FakeAuthority::default();
        fake.fail_registration.store(true, Ordering::SeqCst);
        let (manager, db) = manager(&fake).await;

        let result = manager.get_client(1, "x@y.com", "a.com").await;

        assert!(matches!(result, Err(JobError::Account(_))));
        assert!(db.get_account("x@y.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_slow_registry_gets_long_timing() {
        let fake = FakeAuthority::default();
        let (manager, _db) = manager(&fake).await;

        manager.get_client(1, "x@y.com", "shop.id").await.unwrap();
        manager.get_client(2, "x@y.com", "shop.com").await.unwrap();

        let connected = fake.connected.lock().clone();
        assert_eq!(connected[0].timeout, Duration::from_secs(3600));
        assert_eq!(connected[0].interval, Duration::from_secs(30));
        assert_eq!(connected[1].timeout, Duration::from_secs(120));
    }

    #[tokio::test]
    async fn test_concurrent_first_use_registers_once() {
        let fake = FakeAuthority::default();
        let (manager, _db) = manager(&fake).await;
        let manager = Arc::new(manager);

        let first = tokio::spawn({
            let manager = manager.clone();
            async move { manager.get_client(1, "x@y.com", "a.com").await.map(|_| ()) }
        });
        let second = tokio::spawn({
            let manager = manager.clone();
            async move { manager.get_client(1, "x@y.com", "b.com").await.map(|_| ()) }
        });
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        assert_eq!(fake.registrations.load(Ordering::SeqCst), 1);
    }
}
