use crate::acme::error::Error as AcmeError;
use thiserror::Error;

pub type ServiceResult<T> = Result<T, ServiceError>;
pub type JobResult<T> = Result<T, JobError>;

/// Failures reported synchronously to whoever submitted a request.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("job queue is full, try again later")]
    Busy,
    #[error("{0} not found")]
    NotFound(String),
    #[error("storage failure: {0:#}")]
    Storage(#[source] anyhow::Error),
}

impl From<anyhow::Error> for ServiceError {
    fn from(err: anyhow::Error) -> Self {
        ServiceError::Storage(err)
    }
}

/// Failures inside an issuance or renewal job. They terminate the job, never the worker.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("account setup failed: {0:#}")]
    Account(#[source] anyhow::Error),
    #[error("CA rate limit reached: {0:#}")]
    RateLimited(#[source] anyhow::Error),
    #[error("issuance failed: {0:#}")]
    Issuance(#[source] anyhow::Error),
    #[error("storing the issued certificate failed, key material is lost: {0:#}")]
    Persistence(#[source] anyhow::Error),
    #[error("webhook delivery failed: {0:#}")]
    Notification(#[source] anyhow::Error),
}

impl JobError {
    fn from_ca(err: anyhow::Error) -> Self {
        match err.downcast_ref::<AcmeError>() {
            Some(AcmeError::RateLimited(_)) => JobError::RateLimited(err),
            _ => JobError::Issuance(err),
        }
    }
}

pub trait JobContext<T> {
    fn account_failure(self) -> JobResult<T>;
    fn issuance_failure(self) -> JobResult<T>;
    fn persistence_failure(self) -> JobResult<T>;
    fn notification_failure(self) -> JobResult<T>;
}

impl<T> JobContext<T> for anyhow::Error {
    fn account_failure(self) -> JobResult<T> {
        Err(JobError::Account(self))
    }

    fn issuance_failure(self) -> JobResult<T> {
        Err(JobError::from_ca(self))
    }

    fn persistence_failure(self) -> JobResult<T> {
        Err(JobError::Persistence(self))
    }

    fn notification_failure(self) -> JobResult<T> {
        Err(JobError::Notification(self))
    }
}

impl<T> JobContext<T> for Result<T, anyhow::Error> {
    fn account_failure(self) -> JobResult<T> {
        self.or_else(JobContext::account_failure)
    }

    fn issuance_failure(self) -> JobResult<T> {
        self.or_else(JobContext::issuance_failure)
    }

    fn persistence_failure(self) -> JobResult<T> {
        self.or_else(JobContext::persistence_failure)
    }

    fn notification_failure(self) -> JobResult<T> {
        self.or_else(JobContext::notification_failure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::error::{Problem, RateLimitError};
    use anyhow::anyhow;

    #[test]
    fn test_rate_limit_is_classified() {
        let problem: Problem = serde_json::from_str(
            r#"{"type": "urn:ietf:params:acme:error:rateLimited", "detail": "too many certificates"}"#,
        )
        .unwrap();
        let err = anyhow::Error::from(AcmeError::RateLimited(RateLimitError {
            problem,
            retry_after: None,
        }));

        let result: JobResult<()> = Err(err).issuance_failure();

        assert!(matches!(result, Err(JobError::RateLimited(_))));
    }

    #[test]
    fn test_context_keeps_ok_values() {
        let result: JobResult<u32> = Ok(7).persistence_failure();
        assert_eq!(result.unwrap(), 7);
    }

    #[test]
    fn test_persistence_message_mentions_lost_key() {
        let result: JobResult<()> = Err(anyhow!("disk full")).persistence_failure();
        let message = result.unwrap_err().to_string();
        assert!(message.contains("key material is lost"), "{message}");
        assert!(message.contains("disk full"), "{message}");
    }
}
