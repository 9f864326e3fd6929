use crate::acme::error::ProtocolResult;
use crate::acme::error::Error;
use crate::acme::http::HttpClient;
use crate::acme::object::{
    Account, AccountRequest, Authorization, Challenge, ChallengeStatus, Directory, EmptyObject,
    FinalizeRequest, NewOrderRequest, Nonce, Order, OrderStatus,
};
use crate::crypto::asymmetric::KeyPair;
use crate::crypto::jws::{EMPTY_PAYLOAD, JsonWebKey, ProtectedHeader};
use base64::Engine;
use base64::prelude::BASE64_URL_SAFE_NO_PAD;
use parking_lot::Mutex;
use rcgen::CertificateSigningRequest;
use reqwest::StatusCode;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::VecDeque;
use std::time::{Duration, SystemTime};
use tokio::time::Instant;
use tracing::{debug, trace};
use url::Url;

/// The maximum number of retries we do, per request
const MAX_RETRIES: usize = 3;
/// The default time we wait between retries, if a retry is needed
const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(3);
/// The maximum amount of time we're willing to wait in between retries
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(2 * 60);
/// Maximum time we wait for the server to progress in the state machine
const MAX_POLL_DURATION: Duration = Duration::from_secs(5 * 60);

#[derive(Debug)]
#[allow(clippy::module_name_repetitions)]
pub struct AcmeClient {
    http_client: HttpClient,
    directory: Directory,
    nonce_pool: Mutex<VecDeque<Nonce>>,
}

impl AcmeClient {
    /// Fetches the directory at `directory_url` and returns a client bound to it.
    pub async fn try_new(directory_url: Url) -> ProtocolResult<Self> {
        let http_client = HttpClient::try_new()?;
        let directory_response = http_client.get(directory_url).await?;
        let directory = match directory_response.status() {
            StatusCode::OK => directory_response.json().await?,
            _ => return Err(Error::get_error_from_http(directory_response).await),
        };
        Ok(Self {
            http_client,
            directory,
            nonce_pool: Mutex::new(VecDeque::default()),
        })
    }

    pub fn get_directory(&self) -> &Directory {
        &self.directory
    }

    pub async fn get_nonce(&self) -> ProtocolResult<Nonce> {
        let mut last_error;
        let mut retry = 0;
        loop {
            let pooled_nonce = self.nonce_pool.lock().pop_front();
            if let Some(pooled_nonce) = pooled_nonce {
                return Ok(pooled_nonce);
            }

            let response = self
                .http_client
                .head(self.directory.new_nonce.clone())
                .await?;
            if let Some(nonce) = HttpClient::extract_nonce(&response) {
                return Ok(nonce);
            }

            let retry_after = HttpClient::extract_backoff(&response);
            last_error = Error::get_error_from_http(response).await;
            retry += 1;
            if retry > MAX_RETRIES {
                break;
            }
            tokio::time::sleep(backoff_from_retry_after(retry_after)).await;
        }
        Err(last_error)
    }

    fn try_store_nonce(&self, maybe_nonce: Option<Nonce>) {
        if let Some(nonce) = maybe_nonce {
            self.nonce_pool.lock().push_back(nonce);
        }
    }

    /// Signs and POSTs `payload`, retrying on `badNonce` and on transient server errors.
    ///
    /// The body of a successful response is returned as-is. Certificate downloads are the
    /// only place where ACME does not speak JSON, so everything else goes through
    /// [`Self::post_with_retry`].
    async fn post_with_retry_raw<T: Serialize>(
        &self,
        target_url: &Url,
        key: &JsonWebKey,
        payload: Option<&T>,
    ) -> ProtocolResult<AcmeResponse<Vec<u8>>> {
        let mut last_error;
        let mut retry = 0;
        let mut header = ProtectedHeader::new(
            key.get_algorithm(),
            self.get_nonce().await?,
            target_url.clone(),
            key.get_parameters().clone(),
        );
        loop {
            let signed = key.sign(&header, payload)?;
            trace!("POST {target_url}");
            let response = self.http_client.post(target_url.clone(), &signed).await?;
            let retry_after = HttpClient::extract_backoff(&response);
            let new_nonce = HttpClient::extract_nonce(&response);
            let location = HttpClient::extract_location(&response);
            let status = response.status();
            if matches!(status, StatusCode::OK | StatusCode::CREATED) {
                self.try_store_nonce(new_nonce);
                let body = response.bytes().await?.to_vec();
                return Ok(AcmeResponse {
                    status,
                    location,
                    retry_after,
                    body,
                });
            }

            last_error = Error::get_error_from_http(response).await;
            if last_error.is_bad_nonce() {
                header.nonce = new_nonce.ok_or(Error::ProtocolViolation(
                    "Server did not provide a (valid) Replay-Nonce on a badNonce error",
                ))?;
                retry += 1;
                if retry > MAX_RETRIES {
                    break;
                }
                debug!("CA rejected our nonce, retrying with a fresh one");
                continue;
            }
            self.try_store_nonce(new_nonce);
            retry += 1;
            // Client errors (rate limits included) are not going to fix themselves
            if status.is_client_error() || retry > MAX_RETRIES {
                break;
            }
            tokio::time::sleep(backoff_from_retry_after(retry_after)).await;
            header.nonce = self.get_nonce().await?;
        }
        Err(last_error)
    }

    async fn post_with_retry<T: Serialize, R: DeserializeOwned>(
        &self,
        target_url: &Url,
        key: &JsonWebKey,
        payload: Option<&T>,
    ) -> ProtocolResult<AcmeResponse<R>> {
        let response = self.post_with_retry_raw(target_url, key, payload).await?;
        let body = serde_json::from_slice(&response.body)?;
        Ok(AcmeResponse {
            status: response.status,
            location: response.location,
            retry_after: response.retry_after,
            body,
        })
    }

    /// Creates a new account for `options.key`. The returned key is bound to the new account URL.
    pub async fn register_account(
        &self,
        options: AccountRegisterOptions,
    ) -> ProtocolResult<(JsonWebKey, Url, Account)> {
        let jwk = JsonWebKey::new(options.key);
        let target_url = &self.get_directory().new_account;
        let payload = AccountRequest {
            contact: options.contact,
            terms_of_service_agreed: options.terms_of_service_agreed,
            only_return_existing: None,
        };
        let response = self
            .post_with_retry(target_url, &jwk, Some(&payload))
            .await?;
        let account_url = response.location.ok_or(Error::ProtocolViolation(
            "ACME server did not provide an account URL for created account",
        ))?;
        let account_key = jwk.into_existing(account_url.clone());
        Ok((account_key, account_url, response.body))
    }

    /// Fetches the current state of an existing account (RFC 8555, section 7.3.3).
    pub async fn query_account(
        &self,
        account_key: &JsonWebKey,
        account_url: &Url,
    ) -> ProtocolResult<Account> {
        let response = self
            .post_with_retry(account_url, account_key, Some(&EmptyObject {}))
            .await?;
        Ok(response.body)
    }

    pub async fn new_order(
        &self,
        account_key: &JsonWebKey,
        request: &NewOrderRequest,
    ) -> ProtocolResult<(Url, Order)> {
        let target_url = &self.get_directory().new_order;
        let response = self
            .post_with_retry(target_url, account_key, Some(request))
            .await?;
        let order_url = response.location.ok_or(Error::ProtocolViolation(
            "ACME server did not provide an order URL for created order",
        ))?;
        Ok((order_url, response.body))
    }

    pub async fn get_order(
        &self,
        account_key: &JsonWebKey,
        order_url: &Url,
    ) -> ProtocolResult<Order> {
        let response = self
            .post_with_retry(order_url, account_key, EMPTY_PAYLOAD)
            .await?;
        Ok(response.body)
    }

    pub async fn get_authorization(
        &self,
        account_key: &JsonWebKey,
        authz_url: &Url,
    ) -> ProtocolResult<Authorization> {
        let response = self
            .post_with_retry(authz_url, account_key, EMPTY_PAYLOAD)
            .await?;
        Ok(response.body)
    }

    /// Downloads the PEM chain of a valid order.
    pub async fn download_certificate(
        &self,
        account_key: &JsonWebKey,
        certificate_url: &Url,
    ) -> ProtocolResult<Vec<u8>> {
        let response = self
            .post_with_retry_raw(certificate_url, account_key, EMPTY_PAYLOAD)
            .await?;
        Ok(response.body)
    }

    /// Tells the CA to validate a challenge, then polls until it is valid or invalid.
    pub async fn validate_challenge(
        &self,
        account_key: &JsonWebKey,
        challenge_url: &Url,
    ) -> ProtocolResult<Challenge> {
        let response = self
            .post_with_retry(challenge_url, account_key, Some(&EmptyObject {}))
            .await?;
        let mut retry_after = response.retry_after;
        let mut challenge: Challenge = response.body;
        let deadline = Instant::now() + MAX_POLL_DURATION;
        let mut last_error = None;
        while Instant::now() < deadline {
            match challenge.status {
                ChallengeStatus::Pending => {}
                ChallengeStatus::Processing => {
                    // processing + error means the CA is still retrying on its own
                    if let Some(err) = challenge.error {
                        last_error = Some(err.into());
                    }
                }
                ChallengeStatus::Valid => {
                    return Ok(challenge);
                }
                ChallengeStatus::Invalid => {
                    return Err(challenge.error.map_or(
                        Error::ProtocolViolation(
                            "challenge is invalid, but CA did not provide an error message why",
                        ),
                        Error::from,
                    ));
                }
            }
            tokio::time::sleep(backoff_from_retry_after(retry_after)).await;
            let response = self
                .post_with_retry(challenge_url, account_key, EMPTY_PAYLOAD)
                .await?;
            challenge = response.body;
            retry_after = response.retry_after;
        }
        Err(last_error
            .unwrap_or(Error::TimedOut("Timed out waiting for challenge validation")))
    }

    pub async fn finalize_order(
        &self,
        account_key: &JsonWebKey,
        order: &Order,
        order_url: &Url,
        csr: &CertificateSigningRequest,
    ) -> ProtocolResult<Order> {
        let request = FinalizeRequest {
            csr: BASE64_URL_SAFE_NO_PAD.encode(csr.der()),
        };
        let response = self
            .post_with_retry(&order.finalize, account_key, Some(&request))
            .await?;
        self.poll_order(account_key, response.body, order_url).await
    }

    /// Polls a finalized order until the CA has issued the certificate.
    pub async fn poll_order(
        &self,
        account_key: &JsonWebKey,
        mut order: Order,
        order_url: &Url,
    ) -> ProtocolResult<Order> {
        let deadline = Instant::now() + MAX_POLL_DURATION;
        while Instant::now() < deadline {
            match order.status {
                OrderStatus::Pending => {
                    return Err(Error::ProtocolViolation(
                        "BUG: Requested finalized order polling but CA reported order is still pending",
                    ));
                }
                OrderStatus::Ready => {
                    return Err(Error::ProtocolViolation(
                        "BUG: Requested finalized order polling but CA reported order has not been finalized yet",
                    ));
                }
                OrderStatus::Processing => {
                    tokio::time::sleep(DEFAULT_RETRY_BACKOFF).await;
                    order = self.get_order(account_key, order_url).await?;
                }
                OrderStatus::Valid => {
                    return Ok(order);
                }
                OrderStatus::Invalid => {
                    return Err(order.error.map_or(
                        Error::ProtocolViolation(
                            "Order is invalid, but CA did not provide an error message",
                        ),
                        Error::from,
                    ));
                }
            }
        }
        Err(Error::TimedOut("Timed out waiting for order finalization"))
    }
}

#[derive(Debug)]
pub struct AcmeResponse<T> {
    pub status: StatusCode,
    pub location: Option<Url>,
    pub retry_after: Option<SystemTime>,
    pub body: T,
}

#[derive(Debug)]
pub struct AccountRegisterOptions {
    pub key: KeyPair,
    pub contact: Vec<Url>,
    pub terms_of_service_agreed: Option<bool>,
}

fn backoff_from_retry_after(retry_after: Option<SystemTime>) -> Duration {
    retry_after
        .and_then(|date| date.duration_since(SystemTime::now()).ok())
        .map_or(DEFAULT_RETRY_BACKOFF, |backoff| {
            backoff.min(MAX_RETRY_BACKOFF)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::object::{AccountStatus, Identifier};
    use crate::crypto::asymmetric::{Curve, KeyType, new_key};
    use mockito::{Matcher, ServerGuard};
    use serde_json::json;

    const NONCE_VALUE: &str = "notActuallyRandom";

    fn url_of(server: &ServerGuard, path: &str) -> Url {
        Url::parse(&server.url()).unwrap().join(path).unwrap()
    }

    async fn create_acme_server() -> ServerGuard {
        let mut server = mockito::Server::new_async().await;
        let directory = json!({
            "newNonce": url_of(&server, "/new-nonce"),
            "newAccount": url_of(&server, "/new-account"),
            "newOrder": url_of(&server, "/new-order"),
        });
        server
            .mock("GET", "/directory")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(directory.to_string())
            .create_async()
            .await;
        server
    }

    async fn build_acme_client(server: &ServerGuard) -> AcmeClient {
        AcmeClient::try_new(url_of(server, "/directory"))
            .await
            .unwrap()
    }

    fn test_jwk(server: &ServerGuard) -> JsonWebKey {
        JsonWebKey::new_existing(
            new_key(KeyType::Ecdsa(Curve::P256)).unwrap(),
            url_of(server, "/account/1"),
        )
    }

    /// The base64 protected header a request signed with `jwk` carries for `nonce` and `url`.
    fn protected_header(jwk: &JsonWebKey, nonce: &str, url: &Url) -> String {
        let header = ProtectedHeader::new(
            jwk.get_algorithm(),
            Nonce::try_from(nonce.to_string()).unwrap(),
            url.clone(),
            jwk.get_parameters().clone(),
        );
        BASE64_URL_SAFE_NO_PAD.encode(serde_json::to_string(&header).unwrap())
    }

    #[tokio::test]
    async fn test_try_new_with_broken_directory() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/directory")
            .with_status(503)
            .create_async()
            .await;

        let err = AcmeClient::try_new(url_of(&server, "/directory"))
            .await
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "The CA reported a problem: HTTP error: 503 Service Unavailable"
        );
    }

    #[tokio::test]
    async fn test_new_nonce() {
        let mut server = create_acme_server().await;
        let nonce_mock = server
            .mock("HEAD", "/new-nonce")
            .with_status(200)
            .with_header("Replay-Nonce", NONCE_VALUE)
            .expect(1)
            .create_async()
            .await;

        let client = build_acme_client(&server).await;
        let nonce = client.get_nonce().await.unwrap();

        assert_eq!(nonce.to_string(), NONCE_VALUE);
        nonce_mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_post_with_retry_when_bad_nonce_retries() {
        let mut server = create_acme_server().await;
        server
            .mock("HEAD", "/new-nonce")
            .with_status(200)
            .with_header("Replay-Nonce", NONCE_VALUE)
            .expect(1)
            .create_async()
            .await;
        let jwk = test_jwk(&server);
        let target = url_of(&server, "/retry-test");
        let bad_nonce_error = json!({"type": "urn:ietf:params:acme:error:badNonce"}).to_string();
        let first = server
            .mock("POST", "/retry-test")
            .match_body(Matcher::PartialJson(
                json!({"protected": protected_header(&jwk, NONCE_VALUE, &target)}),
            ))
            .with_status(400)
            .with_header("Content-Type", "application/problem+json")
            .with_header("Replay-Nonce", "ThisNonceIsValid")
            .with_body(bad_nonce_error)
            .expect(1)
            .create_async()
            .await;
        let second = server
            .mock("POST", "/retry-test")
            .match_body(Matcher::PartialJson(
                json!({"protected": protected_header(&jwk, "ThisNonceIsValid", &target)}),
            ))
            .with_status(200)
            .with_header("Replay-Nonce", "PooledForLater")
            .with_body("null")
            .expect(1)
            .create_async()
            .await;

        let client = build_acme_client(&server).await;
        let response: AcmeResponse<()> = client
            .post_with_retry(&target, &jwk, EMPTY_PAYLOAD)
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::OK);
        first.assert_async().await;
        second.assert_async().await;
        // The nonce of the successful response must be reused instead of asking for a new one
        assert_eq!(client.get_nonce().await.unwrap().to_string(), "PooledForLater");
    }

    #[tokio::test]
    async fn test_post_with_retry_stops_on_rate_limit() {
        let mut server = create_acme_server().await;
        server
            .mock("HEAD", "/new-nonce")
            .with_status(200)
            .with_header("Replay-Nonce", NONCE_VALUE)
            .create_async()
            .await;
        let rate_limited = server
            .mock("POST", "/new-order")
            .with_status(429)
            .with_header("Content-Type", "application/problem+json")
            .with_header("Retry-After", "3600")
            .with_body(
                json!({
                    "type": "urn:ietf:params:acme:error:rateLimited",
                    "detail": "too many new orders recently"
                })
                .to_string(),
            )
            .expect(1)
            .create_async()
            .await;

        let client = build_acme_client(&server).await;
        let jwk = test_jwk(&server);
        let request = NewOrderRequest {
            identifiers: vec![Identifier::from("a.com")],
        };
        let err = client.new_order(&jwk, &request).await.unwrap_err();

        let Error::RateLimited(rate_limit) = err else {
            panic!("expected rate limit error, got {err}");
        };
        assert!(rate_limit.retry_after.is_some());
        rate_limited.assert_async().await;
    }

    #[tokio::test]
    async fn test_register_account() {
        let mut server = create_acme_server().await;
        server
            .mock("HEAD", "/new-nonce")
            .with_status(200)
            .with_header("Replay-Nonce", NONCE_VALUE)
            .create_async()
            .await;
        server
            .mock("POST", "/new-account")
            .with_status(201)
            .with_header("Location", "/account/42")
            .with_body(json!({"status": "valid", "contact": ["mailto:a@b.com"]}).to_string())
            .create_async()
            .await;

        let client = build_acme_client(&server).await;
        let (jwk, account_url, account) = client
            .register_account(AccountRegisterOptions {
                key: new_key(KeyType::Ecdsa(Curve::P256)).unwrap(),
                contact: vec![Url::parse("mailto:a@b.com").unwrap()],
                terms_of_service_agreed: Some(true),
            })
            .await
            .unwrap();

        assert_eq!(account_url, url_of(&server, "/account/42"));
        assert_eq!(account.status, AccountStatus::Valid);
        assert_eq!(
            jwk.get_parameters(),
            &crate::crypto::jws::KeyParameters::AccountUrl(account_url)
        );
    }

    #[tokio::test]
    async fn test_download_certificate_passes_bytes_through() {
        let mut server = create_acme_server().await;
        server
            .mock("HEAD", "/new-nonce")
            .with_status(200)
            .with_header("Replay-Nonce", NONCE_VALUE)
            .create_async()
            .await;
        server
            .mock("POST", "/cert/1")
            .with_status(200)
            .with_header("Content-Type", "application/pem-certificate-chain")
            .with_body("-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n")
            .create_async()
            .await;

        let client = build_acme_client(&server).await;
        let pem = client
            .download_certificate(&test_jwk(&server), &url_of(&server, "/cert/1"))
            .await
            .unwrap();

        assert!(pem.starts_with(b"-----BEGIN CERTIFICATE-----"));
    }

    #[tokio::test]
    async fn test_validate_challenge_invalid() {
        let mut server = create_acme_server().await;
        server
            .mock("HEAD", "/new-nonce")
            .with_status(200)
            .with_header("Replay-Nonce", NONCE_VALUE)
            .create_async()
            .await;
        let challenge_url = url_of(&server, "/chall/1");
        server
            .mock("POST", "/chall/1")
            .with_status(200)
            .with_body(
                json!({
                    "url": challenge_url,
                    "type": "dns-01",
                    "status": "invalid",
                    "token": "DGyRejmCefe7v4NfDGDKfA",
                    "error": {
                        "type": "urn:ietf:params:acme:error:unauthorized",
                        "detail": "No TXT record found at _acme-challenge.a.com"
                    }
                })
                .to_string(),
            )
            .create_async()
            .await;

        let client = build_acme_client(&server).await;
        let err = client
            .validate_challenge(&test_jwk(&server), &challenge_url)
            .await
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "The CA reported a problem: No TXT record found at _acme-challenge.a.com"
        );
    }

    #[test]
    fn test_backoff_from_retry_after() {
        let future = SystemTime::now() + Duration::from_secs(2);
        assert!(backoff_from_retry_after(Some(future)).as_secs_f64() >= 1.0);

        let far_future = SystemTime::now() + Duration::from_secs(3600);
        assert_eq!(backoff_from_retry_after(Some(far_future)), MAX_RETRY_BACKOFF);

        let past = SystemTime::now() - Duration::from_secs(2);
        assert_eq!(backoff_from_retry_after(Some(past)), DEFAULT_RETRY_BACKOFF);
        assert_eq!(backoff_from_retry_after(None), DEFAULT_RETRY_BACKOFF);
    }
}
