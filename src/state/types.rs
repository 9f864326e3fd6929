use std::collections::BTreeMap;

/// Header name to value, sent along with every webhook delivery.
pub type WebhookHeaders = BTreeMap<String, String>;

/// An issued certificate, keyed by its main domain.
///
/// All timestamps are unix milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct CertificateRecord {
    pub main: String,
    /// Comma-joined list of all covered domains, `main` included.
    pub sans: String,
    pub email: String,
    pub private_key: Vec<u8>,
    pub certificate: Vec<u8>,
    pub not_before_ts: i64,
    pub not_after_ts: i64,
    pub upserted_ts: i64,
}

impl CertificateRecord {
    pub fn domains(&self) -> impl Iterator<Item = &str> {
        self.sans
            .split(',')
            .map(str::trim)
            .filter(|domain| !domain.is_empty())
    }

    pub fn covers(&self, domain: &str) -> bool {
        self.main == domain || self.domains().any(|san| san == domain)
    }
}

pub fn join_sans<S: AsRef<str>>(domains: &[S]) -> String {
    domains
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join(",")
}

/// A registered CA account. The key is written once and never rotated.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct AccountRecord {
    pub email: String,
    pub uri: String,
    pub private_key: Vec<u8>,
    pub upserted_ts: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookRecord {
    pub main: String,
    pub url: String,
    pub headers: WebhookHeaders,
}

pub(super) mod internal {
    use super::WebhookHeaders;
    use anyhow::Context;

    #[derive(Debug, sqlx::FromRow)]
    pub struct WebhookRow {
        pub main: String,
        pub url: String,
        pub headers: Vec<u8>,
    }

    impl TryFrom<WebhookRow> for super::WebhookRecord {
        type Error = anyhow::Error;

        fn try_from(row: WebhookRow) -> Result<Self, Self::Error> {
            let headers: WebhookHeaders = if row.headers.is_empty() {
                WebhookHeaders::new()
            } else {
                serde_json::from_slice(&row.headers)
                    .context(format!("Stored webhook headers for {} are corrupted", row.main))?
            };
            Ok(Self {
                main: row.main,
                url: row.url,
                headers,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn record(main: &str, sans: &str) -> CertificateRecord {
        CertificateRecord {
            main: main.to_string(),
            sans: sans.to_string(),
            email: "x@y.com".to_string(),
            private_key: vec![1],
            certificate: vec![2],
            not_before_ts: 0,
            not_after_ts: 0,
            upserted_ts: 0,
        }
    }

    #[rstest]
    #[case("a.com", "a.com,b.com", "b.com", true)]
    #[case("a.com", "a.com,b.com", "a.com", true)]
    #[case("a.com", "a.com,b.com", "c.com", false)]
    #[case("a.com", "a.com,sub.b.com", "b.com", false)]
    #[case("a.com", "a.com, b.com", "b.com", true)]
    fn test_covers(
        #[case] main: &str,
        #[case] sans: &str,
        #[case] domain: &str,
        #[case] expected: bool,
    ) {
        assert_eq!(record(main, sans).covers(domain), expected);
    }

    #[test]
    fn test_join_sans() {
        assert_eq!(join_sans(&["a.com", "b.com"]), "a.com,b.com");
        assert_eq!(join_sans::<&str>(&[]), "");
    }
}
