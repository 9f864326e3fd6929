use crate::cert::parse_leaf;
use crate::service::CertificateService;
use crate::state::types::CertificateRecord;
use crate::time::{ParsedDuration, now_millis};
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Whether `record` expires within `window` of `now`. A stored pair that cannot be parsed
/// is always due.
pub fn needs_renewal(record: &CertificateRecord, now: time::OffsetDateTime, window: Duration) -> bool {
    match parse_leaf(&record.certificate, &record.private_key) {
        Ok(leaf) => leaf.validity.not_after < now + window,
        Err(e) => {
            warn!(
                "Stored certificate {} cannot be read, renewing it: {e:#}",
                record.main
            );
            true
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    pub renewed: Vec<String>,
    pub failed: Vec<String>,
}

impl Display for SweepReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "checked {} certificate(s), renewed {}, failed {}",
            self.checked,
            self.renewed.len(),
            self.failed.len()
        )?;
        if !self.failed.is_empty() {
            write!(f, " ({})", self.failed.join(", "))?;
        }
        Ok(())
    }
}

/// Periodically renews every stored certificate that is close to expiry.
///
/// Renewals run one after another directly against the CA, next to (not through) the job queue.
pub struct RenewalScheduler {
    service: Arc<CertificateService>,
    interval: Duration,
    window: Duration,
}

impl RenewalScheduler {
    pub fn new(service: Arc<CertificateService>, interval: Duration, window: Duration) -> Self {
        Self {
            service,
            interval,
            window,
        }
    }

    /// Checks every stored certificate once. A failed renewal is logged and the sweep moves on.
    pub async fn sweep(&self) -> anyhow::Result<SweepReport> {
        info!("Checking stored certificates for renewal");
        let timestamp = now_millis();
        let now = time::OffsetDateTime::now_utc();
        let records = self.service.list().await?;
        let mut report = SweepReport {
            checked: records.len(),
            ..SweepReport::default()
        };
        for record in records {
            if !needs_renewal(&record, now, self.window) {
                debug!("Certificate {} does not need renewal yet", record.main);
                continue;
            }
            info!("Renewing certificate {}", record.main);
            match self.service.renew_record(timestamp, &record).await {
                Ok(_) => report.renewed.push(record.main),
                Err(err) => {
                    error!("Renewing certificate {} failed: {err}", record.main);
                    report.failed.push(record.main);
                }
            }
        }
        info!("Renewal sweep done: {report}");
        Ok(report)
    }

    /// Sweeps right away and then every interval, until `shutdown` fires. A running sweep is
    /// never interrupted.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "Renewal sweep runs every {}, renewing certificates expiring within {}",
                ParsedDuration::from(self.interval),
                ParsedDuration::from(self.window)
            );
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    () = shutdown.cancelled() => break,
                }
                if let Err(e) = self.sweep().await {
                    error!("Renewal sweep failed: {e:#}");
                }
            }
            debug!("Renewal scheduler stopped");
        })
    }
}
