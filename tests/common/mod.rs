#![allow(dead_code)]

use certsteward::ca::test_helper::FakeAuthority;
use certsteward::config::{Configuration, DnsProviderKind};
use certsteward::daemon::Steward;
use certsteward::state::types::CertificateRecord;
use certsteward::state::{CertificateStore, Database, open_test_db};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const WAIT_TIMEOUT: Duration = Duration::from_secs(10);
const WAIT_INTERVAL: Duration = Duration::from_millis(20);

pub fn test_config() -> Configuration {
    let mut config = Configuration::default();
    config.dns.provider = DnsProviderKind::None;
    config.webhook.timeout = Duration::from_secs(2).into();
    config
}

pub async fn test_database() -> Database {
    Database::from(open_test_db().await)
}

/// Polls `check` until it yields a value. Panics after a generous timeout.
pub async fn wait_for<T, F, Fut>(what: &str, mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    loop {
        if let Some(value) = check().await {
            return value;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(WAIT_INTERVAL).await;
    }
}

/// A running instance on a random local port, backed by an in-memory database and a fake CA.
pub struct TestServer {
    pub base_url: String,
    pub fake: FakeAuthority,
    pub database: Database,
    pub http: reqwest::Client,
    credentials: Option<(String, String)>,
    shutdown: CancellationToken,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl TestServer {
    pub async fn start(config: Configuration, fake: FakeAuthority) -> Self {
        let database = test_database().await;
        let credentials = config
            .auth
            .is_enabled()
            .then(|| (config.auth.username.clone(), config.auth.password.clone()));
        let steward = Steward::assemble(config, database.clone(), Arc::new(fake.clone())).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(steward.serve_on(listener, shutdown.clone()));
        Self {
            base_url,
            fake,
            database,
            http: reqwest::Client::new(),
            credentials,
            shutdown,
            handle,
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.credentials {
            Some((username, password)) => request.basic_auth(username, Some(password)),
            None => request,
        }
    }

    pub async fn post(&self, path: &str, body: &Value) -> reqwest::Response {
        let request = self.http.post(format!("{}{path}", self.base_url)).json(body);
        self.authorize(request).send().await.unwrap()
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        let request = self.http.get(format!("{}{path}", self.base_url));
        self.authorize(request).send().await.unwrap()
    }

    pub async fn wait_for_certificate(&self, main: &str) -> CertificateRecord {
        let database = &self.database;
        wait_for(&format!("certificate {main}"), move || async move {
            database.get_certificate(main).await.unwrap()
        })
        .await
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        self.handle.await.unwrap().unwrap();
    }
}
