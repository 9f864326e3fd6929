use crate::acme::http::HttpClient;
use crate::acme::object::Identifier;
use crate::crypto::SignatureError;
use serde::Deserialize;
use std::fmt::{Display, Formatter};
use std::time::SystemTime;

pub type ProtocolResult<T> = Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    Http(reqwest::Error),
    AcmeProblem(Problem),
    ProtocolViolation(&'static str),
    CryptoFailure(SignatureError),
    Json(serde_json::Error),
    RateLimited(RateLimitError),
    TimedOut(&'static str),
}

impl Error {
    pub async fn get_error_from_http(err_response: reqwest::Response) -> Error {
        let retry_after = HttpClient::extract_backoff(&err_response);
        let status = err_response.status();
        match err_response.json::<Problem>().await {
            Ok(problem) if problem.is_rate_limit() => RateLimitError {
                problem,
                retry_after,
            }
            .into(),
            Ok(problem) => Error::AcmeProblem(problem),
            Err(_) => Error::AcmeProblem(Problem {
                typ: "unknown".to_string(),
                detail: Some(format!("HTTP error: {status}")),
                subproblems: vec![],
            }),
        }
    }

    pub fn is_bad_nonce(&self) -> bool {
        matches!(self, Error::AcmeProblem(problem) if problem.is_bad_nonce())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Error {
        Error::Http(err)
    }
}

impl From<Problem> for Error {
    fn from(err: Problem) -> Error {
        Error::AcmeProblem(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Error {
        Error::Json(err)
    }
}

impl From<SignatureError> for Error {
    fn from(err: SignatureError) -> Error {
        Error::CryptoFailure(err)
    }
}

impl From<RateLimitError> for Error {
    fn from(err: RateLimitError) -> Error {
        Error::RateLimited(err)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self {
            Error::Http(e) => write!(f, "HTTP error: {e}"),
            Error::AcmeProblem(e) => write!(f, "The CA reported a problem: {e}"),
            Error::ProtocolViolation(e) => write!(f, "ACME protocol specification violated: {e}"),
            Error::CryptoFailure(msg) => write!(f, "error during cryptographic operation: {msg}"),
            Error::Json(serde) => write!(f, "parsing server response failed: {serde}"),
            Error::RateLimited(rate_limit) => write!(f, "{rate_limit}"),
            Error::TimedOut(msg) => write!(f, "timeout: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        // Display already prints the wrapped error, so skip a level to avoid duplicates in chains
        match &self {
            Error::Http(e) => e.source(),
            Error::Json(serde) => serde.source(),
            Error::CryptoFailure(crypto) => crypto.source(),
            Error::RateLimited(rate_limit) => rate_limit.source(),
            Error::AcmeProblem(_) | Error::ProtocolViolation(_) | Error::TimedOut(_) => None,
        }
    }
}

pub const ACME_BAD_NONCE: &str = "urn:ietf:params:acme:error:badNonce";
pub const ACME_RATE_LIMITED: &str = "urn:ietf:params:acme:error:rateLimited";
pub const ACME_ACCOUNT_DOES_NOT_EXIST: &str = "urn:ietf:params:acme:error:accountDoesNotExist";

/// An RFC 7807 problem document as returned by ACME servers.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Problem {
    #[serde(rename = "type")]
    pub typ: String,
    pub detail: Option<String>,
    #[serde(default)]
    pub subproblems: Vec<Subproblem>,
}

impl Problem {
    pub fn is_bad_nonce(&self) -> bool {
        self.typ == ACME_BAD_NONCE || self.subproblems.iter().any(|sub| sub.typ == ACME_BAD_NONCE)
    }

    pub fn is_rate_limit(&self) -> bool {
        self.typ == ACME_RATE_LIMITED
            || self
                .subproblems
                .iter()
                .any(|sub| sub.typ == ACME_RATE_LIMITED)
    }
}

impl Display for Problem {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{detail}")?,
            None => write!(f, "{}", self.typ)?,
        }
        for subproblem in &self.subproblems {
            write!(f, "\nadditionally, the server reported:\n{subproblem}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Subproblem {
    #[serde(rename = "type")]
    pub typ: String,
    pub detail: Option<String>,
    pub identifier: Option<Identifier>,
}

impl Display for Subproblem {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{detail}")?,
            None => write!(f, "{}", self.typ)?,
        }
        if let Some(identifier) = &self.identifier {
            write!(f, " (for identifier: {identifier})")?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct RateLimitError {
    pub problem: Problem,
    pub retry_after: Option<SystemTime>,
}

impl std::error::Error for RateLimitError {}

impl Display for RateLimitError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let problem = &self.problem;
        write!(f, "The CA enforced a rate limit: {problem}")?;
        if let Some(retry_after) = self.retry_after {
            let retry_after = time::OffsetDateTime::from(retry_after);
            write!(f, ", retry after {retry_after}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::str::FromStr;

    #[test]
    fn test_deserialize_problem_with_subproblem() {
        let json = r#"{
    "type": "urn:ietf:params:acme:error:malformed",
    "detail": "Some of the identifiers requested were rejected",
    "subproblems": [
        {
            "type": "urn:ietf:params:acme:error:rejectedIdentifier",
            "detail": "This CA will not issue for \"example.net\"",
            "identifier": {
                "type": "dns",
                "value": "example.net"
            }
        }
    ]
}"#;
        let problem: Problem = serde_json::from_str(json).unwrap();

        assert_eq!(problem.subproblems.len(), 1);
        assert_eq!(
            problem.subproblems[0].identifier,
            Some(Identifier::from_str("example.net").unwrap())
        );
        assert_eq!(
            problem.to_string(),
            "Some of the identifiers requested were rejected\nadditionally, the server reported:\nThis CA will not issue for \"example.net\" (for identifier: example.net)"
        );
    }

    #[rstest]
    #[case(ACME_BAD_NONCE, true, false)]
    #[case(ACME_RATE_LIMITED, false, true)]
    #[case("urn:ietf:params:acme:error:unauthorized", false, false)]
    fn test_problem_classification(
        #[case] typ: &str,
        #[case] bad_nonce: bool,
        #[case] rate_limit: bool,
    ) {
        let problem = Problem {
            typ: typ.to_string(),
            detail: None,
            subproblems: vec![],
        };
        assert_eq!(problem.is_bad_nonce(), bad_nonce);
        assert_eq!(problem.is_rate_limit(), rate_limit);
        assert_eq!(Error::from(problem).is_bad_nonce(), bad_nonce);
    }
}
