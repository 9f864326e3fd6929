use crate::state::types::internal::WebhookRow;
use crate::state::types::{AccountRecord, CertificateRecord, WebhookRecord};
use crate::state::{AccountStore, CertificateStore, WebhookStore};
use anyhow::{Context, anyhow};
use async_trait::async_trait;
use sqlx::sqlite::SqliteAutoVacuum;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

const DATABASE_TIMEOUT: Duration = Duration::from_secs(60);

const CERTIFICATE_COLUMNS: &str =
    "main, sans, email, private_key, certificate, not_before_ts, not_after_ts, upserted_ts";

#[derive(Debug, Clone)]
pub struct Database {
    pool: sqlx::SqlitePool,
}

impl Database {
    pub async fn open<P: AsRef<Path>>(database_file: P) -> anyhow::Result<Database> {
        let database_file = database_file.as_ref();
        let directory = match database_file.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => std::env::current_dir().context("Determining working directory failed")?,
        };
        let file_name = database_file
            .file_name()
            .ok_or_else(|| anyhow!("Database path {} has no file name", database_file.display()))?;
        let mut file = directory.canonicalize().context(format!(
            "Normalizing database directory path {} failed",
            directory.display()
        ))?;
        file.push(file_name);
        let file_uri = url::Url::from_file_path(&file)
            .map_err(|()| anyhow!("Failed to parse database URI {}", file.display()))?;
        let url = &file_uri.to_string().replacen("file", "sqlite", 1);
        Self::open_url(url).await
    }

    async fn open_url(url: &str) -> anyhow::Result<Database> {
        let connect_options = sqlx::sqlite::SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .auto_vacuum(SqliteAutoVacuum::Incremental)
            .busy_timeout(DATABASE_TIMEOUT)
            .optimize_on_close(true, None);
        let pool_options = sqlx::sqlite::SqlitePoolOptions::new();

        #[cfg(debug_assertions)]
        let connect_options = sqlx::ConnectOptions::log_slow_statements(
            connect_options,
            tracing::log::LevelFilter::Debug,
            Duration::from_millis(500),
        );

        let pool = pool_options.connect_with(connect_options).await?;
        let db = Database { pool };
        super::migration::migrate(&db.pool).await?;
        Ok(db)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl CertificateStore for Database {
    async fn get_certificate(&self, main: &str) -> anyhow::Result<Option<CertificateRecord>> {
        let record = sqlx::query_as::<_, CertificateRecord>(&format!(
            "SELECT {CERTIFICATE_COLUMNS} FROM certs WHERE main = $1;"
        ))
        .bind(main)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn find_certificate_by_domain(
        &self,
        domain: &str,
    ) -> anyhow::Result<Option<CertificateRecord>> {
        // Wrapping both sides in commas turns the SAN list lookup into an exact element match
        let record = sqlx::query_as::<_, CertificateRecord>(&format!(
            "SELECT {CERTIFICATE_COLUMNS} FROM certs \
            WHERE main = $1 OR instr(',' || replace(sans, ' ', '') || ',', ',' || $1 || ',') > 0 \
            ORDER BY main = $1 DESC, id LIMIT 1;"
        ))
        .bind(domain)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn list_certificates(&self) -> anyhow::Result<Vec<CertificateRecord>> {
        let records = sqlx::query_as::<_, CertificateRecord>(&format!(
            "SELECT {CERTIFICATE_COLUMNS} FROM certs ORDER BY id;"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn upsert_certificate(&self, record: &CertificateRecord) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO certs (main, sans, email, private_key, certificate, not_before_ts, not_after_ts, upserted_ts) \
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
            ON CONFLICT(main) DO UPDATE \
            SET sans = $2, email = $3, private_key = $4, certificate = $5, \
            not_before_ts = $6, not_after_ts = $7, upserted_ts = $8;",
        )
        .bind(&record.main)
        .bind(&record.sans)
        .bind(&record.email)
        .bind(&record.private_key)
        .bind(&record.certificate)
        .bind(record.not_before_ts)
        .bind(record.not_after_ts)
        .bind(record.upserted_ts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_certificate(&self, main: &str) -> anyhow::Result<bool> {
        let result = sqlx::query("DELETE FROM certs WHERE main = $1;")
            .bind(main)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl AccountStore for Database {
    async fn get_account(&self, email: &str) -> anyhow::Result<Option<AccountRecord>> {
        let record = sqlx::query_as::<_, AccountRecord>(
            "SELECT email, uri, private_key, upserted_ts FROM client WHERE email = $1;",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn upsert_account(&self, record: &AccountRecord) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO client (email, uri, private_key, upserted_ts) VALUES ($1, $2, $3, $4) \
            ON CONFLICT(email) DO UPDATE \
            SET uri = $2, private_key = $3, upserted_ts = $4;",
        )
        .bind(&record.email)
        .bind(&record.uri)
        .bind(&record.private_key)
        .bind(record.upserted_ts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl WebhookStore for Database {
    async fn get_webhook(&self, main: &str) -> anyhow::Result<Option<WebhookRecord>> {
        let row = sqlx::query_as::<_, WebhookRow>(
            "SELECT main, url, headers FROM webhook WHERE main = $1;",
        )
        .bind(main)
        .fetch_optional(&self.pool)
        .await?;
        row.map(WebhookRecord::try_from).transpose()
    }

    async fn upsert_webhook(&self, record: &WebhookRecord) -> anyhow::Result<()> {
        let headers = serde_json::to_vec(&record.headers)?;
        sqlx::query(
            "INSERT INTO webhook (main, url, headers) VALUES ($1, $2, $3) \
            ON CONFLICT(main) DO UPDATE \
            SET url = $2, headers = $3;",
        )
        .bind(&record.main)
        .bind(&record.url)
        .bind(headers)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_webhook(&self, main: &str) -> anyhow::Result<bool> {
        let result = sqlx::query("DELETE FROM webhook WHERE main = $1;")
            .bind(main)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

pub mod test_helper {
    use crate::state::db::Database;
    use std::ops::{Deref, DerefMut};
    use std::sync::atomic::AtomicUsize;

    pub struct TemporaryDatabase {
        db: Database,
    }

    impl From<TemporaryDatabase> for Database {
        fn from(value: TemporaryDatabase) -> Self {
            value.db
        }
    }

    impl Deref for TemporaryDatabase {
        type Target = Database;

        fn deref(&self) -> &Self::Target {
            &self.db
        }
    }

    impl DerefMut for TemporaryDatabase {
        fn deref_mut(&mut self) -> &mut Self::Target {
            &mut self.db
        }
    }

    impl TemporaryDatabase {
        /// # Panics
        ///
        /// If SQLite cannot create the in-memory database.
        pub async fn new() -> Self {
            static COUNTER: AtomicUsize = AtomicUsize::new(0);
            let instance = COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            let process = std::process::id();
            // The memdb VFS lets all pool connections share one named in-memory database
            let file_name = format!("sqlite:///inmem-{process}-{instance}.db?vfs=memdb");
            Self {
                db: Database::open_url(&file_name)
                    .await
                    .expect("Failed to create new in-memory database"),
            }
        }
    }

    pub async fn open_db() -> TemporaryDatabase {
        TemporaryDatabase::new().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::db::test_helper::open_db;
    use crate::state::types::WebhookHeaders;

    fn cert_record(main: &str, sans: &str) -> CertificateRecord {
        CertificateRecord {
            main: main.to_string(),
            sans: sans.to_string(),
            email: "x@y.com".to_string(),
            private_key: b"key".to_vec(),
            certificate: b"cert".to_vec(),
            not_before_ts: 1_000,
            not_after_ts: 2_000,
            upserted_ts: 1_500,
        }
    }

    #[tokio::test]
    async fn test_open_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("certsteward_test.db"))
            .await
            .unwrap();
        db.upsert_certificate(&cert_record("a.com", "a.com"))
            .await
            .unwrap();
        db.close().await;

        let reopened = Database::open(dir.path().join("certsteward_test.db"))
            .await
            .unwrap();
        assert!(reopened.get_certificate("a.com").await.unwrap().is_some());
        reopened.close().await;
    }

    // Sanity check to verify that sqlx actually separates the in-memory databases from each other
    #[tokio::test(flavor = "current_thread")]
    async fn databases_isolated_in_test() {
        let db_1 = open_db().await;
        let db_2 = open_db().await;

        db_1.upsert_certificate(&cert_record("a.com", "a.com"))
            .await
            .unwrap();

        assert_eq!(db_1.list_certificates().await.unwrap().len(), 1);
        assert!(db_2.list_certificates().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upsert_certificate_overwrites_by_main() {
        let db = open_db().await;
        db.upsert_certificate(&cert_record("a.com", "a.com"))
            .await
            .unwrap();
        let mut updated = cert_record("a.com", "a.com,b.com");
        updated.not_after_ts = 9_000;
        db.upsert_certificate(&updated).await.unwrap();

        let records = db.list_certificates().await.unwrap();
        assert_eq!(records, vec![updated]);
    }

    #[tokio::test]
    async fn test_find_certificate_by_domain_matches_sans() {
        let db = open_db().await;
        db.upsert_certificate(&cert_record("a.com", "a.com,b.com"))
            .await
            .unwrap();

        let found = db.find_certificate_by_domain("b.com").await.unwrap();
        assert_eq!(found.map(|r| r.main), Some("a.com".to_string()));
        let partial = db.find_certificate_by_domain("com").await.unwrap();
        assert!(partial.is_none());
        let suffix = db.find_certificate_by_domain("b.co").await.unwrap();
        assert!(suffix.is_none());
    }

    #[tokio::test]
    async fn test_find_certificate_by_domain_prefers_exact_main() {
        let db = open_db().await;
        db.upsert_certificate(&cert_record("a.com", "a.com,b.com"))
            .await
            .unwrap();
        db.upsert_certificate(&cert_record("b.com", "b.com"))
            .await
            .unwrap();

        let found = db.find_certificate_by_domain("b.com").await.unwrap();
        assert_eq!(found.map(|r| r.main), Some("b.com".to_string()));
    }

    #[tokio::test]
    async fn test_find_certificate_by_domains_checks_in_order() {
        let db = open_db().await;
        db.upsert_certificate(&cert_record("a.com", "a.com"))
            .await
            .unwrap();
        db.upsert_certificate(&cert_record("c.com", "c.com,d.com"))
            .await
            .unwrap();

        let domains = ["x.com", "d.com", "a.com"].map(str::to_string);
        let found = db.find_certificate_by_domains(&domains).await.unwrap();
        assert_eq!(found.map(|r| r.main), Some("c.com".to_string()));

        let none = db
            .find_certificate_by_domains(&["x.com".to_string()])
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn test_delete_certificate() {
        let db = open_db().await;
        db.upsert_certificate(&cert_record("a.com", "a.com"))
            .await
            .unwrap();

        assert!(db.delete_certificate("a.com").await.unwrap());
        assert!(!db.delete_certificate("a.com").await.unwrap());
        assert!(db.get_certificate("a.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_account_roundtrip() {
        let db = open_db().await;
        assert!(db.get_account("x@y.com").await.unwrap().is_none());
        let account = AccountRecord {
            email: "x@y.com".to_string(),
            uri: "https://ca.example/acct/1".to_string(),
            private_key: b"account-key".to_vec(),
            upserted_ts: 42,
        };
        db.upsert_account(&account).await.unwrap();

        assert_eq!(db.get_account("x@y.com").await.unwrap(), Some(account));
    }

    #[tokio::test]
    async fn test_webhook_upsert_and_delete() {
        let db = open_db().await;
        let mut headers = WebhookHeaders::new();
        headers.insert("Authorization".to_string(), "Bearer token".to_string());
        let webhook = WebhookRecord {
            main: "a.com".to_string(),
            url: "https://hooks.example/1".to_string(),
            headers,
        };
        db.upsert_webhook(&webhook).await.unwrap();
        let replacement = WebhookRecord {
            url: "https://hooks.example/2".to_string(),
            headers: WebhookHeaders::new(),
            ..webhook
        };
        db.upsert_webhook(&replacement).await.unwrap();

        assert_eq!(db.get_webhook("a.com").await.unwrap(), Some(replacement));
        assert!(db.delete_webhook("a.com").await.unwrap());
        assert!(db.get_webhook("a.com").await.unwrap().is_none());
    }
}
