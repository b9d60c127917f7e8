use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Duration as ChronoDuration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::metrics::EXPIRY_WORKER_TICKS_TOTAL;
use crate::models::SessionStatus;
use crate::services::session_service::SessionService;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub finished: usize,
    pub promoted: usize,
    pub locked: usize,
    pub failed: usize,
}

/// Background sweep that keeps sessions moving when nobody is looking:
/// expired `ongoing` sessions are finished, `starting` sessions whose
/// promotion was lost are promoted, and finished sessions with unlocked
/// results get locked.
pub struct ExpiryWorker {
    service: Arc<SessionService>,
    interval: Duration,
}

impl ExpiryWorker {
    pub fn new(service: Arc<SessionService>, interval: Duration) -> Self {
        Self { service, interval }
    }

    pub async fn run(&self) -> Result<()> {
        info!(
            "Starting expiry worker loop (interval {}ms)",
            self.interval.as_millis()
        );

        loop {
            match self.run_once().await {
                Ok(report) => {
                    EXPIRY_WORKER_TICKS_TOTAL
                        .with_label_values(&["success"])
                        .inc();
                    if report != SweepReport::default() {
                        info!(?report, "Expiry worker tick completed");
                    }
                }
                Err(err) => {
                    EXPIRY_WORKER_TICKS_TOTAL
                        .with_label_values(&["error"])
                        .inc();
                    warn!(error = %err, "Expiry worker tick failed");
                }
            }

            sleep(self.interval).await;
        }
    }

    pub async fn run_once(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        self.finish_expired(&mut report).await?;
        self.promote_stale(&mut report).await?;
        self.lock_unlocked(&mut report).await?;
        Ok(report)
    }

    async fn finish_expired(&self, report: &mut SweepReport) -> Result<()> {
        let ids = self
            .service
            .store()
            .list_session_ids(SessionStatus::Ongoing)
            .await
            .context("Failed to list ongoing sessions")?;

        for id in ids {
            match self.service.observe(&id).await {
                Ok(session) if session.status == SessionStatus::Finished => report.finished += 1,
                Ok(_) => {}
                Err(err) => {
                    report.failed += 1;
                    warn!(session_id = %id, error = %err, "Failed to check session expiry");
                }
            }
        }
        Ok(())
    }

    async fn promote_stale(&self, report: &mut SweepReport) -> Result<()> {
        let ids = self
            .service
            .store()
            .list_session_ids(SessionStatus::Starting)
            .await
            .context("Failed to list starting sessions")?;

        let grace = ChronoDuration::from_std(self.service.settings().grace_delay)
            .unwrap_or_else(|_| ChronoDuration::seconds(3));
        let now = self.service.clock().now();

        for id in ids {
            if self.service.promotion_pending(&id) {
                continue;
            }
            let session = match self.service.store().load_session(&id).await {
                Ok(Some(session)) => session,
                Ok(None) => continue,
                Err(err) => {
                    report.failed += 1;
                    warn!(session_id = %id, error = %err, "Failed to load starting session");
                    continue;
                }
            };
            // Missing start time: promote now, the transition anchors it.
            let due = session.start_time.map_or(true, |start| start + grace <= now);
            if !due {
                continue;
            }

            debug!(session_id = %id, "Promoting session whose scheduled promotion was lost");
            match self.service.promote(&id).await {
                Ok(_) => report.promoted += 1,
                Err(err) => {
                    report.failed += 1;
                    warn!(session_id = %id, error = %err, "Failed to promote session");
                }
            }
        }
        Ok(())
    }

    async fn lock_unlocked(&self, report: &mut SweepReport) -> Result<()> {
        let ids = self
            .service
            .store()
            .list_session_ids(SessionStatus::Finished)
            .await
            .context("Failed to list finished sessions")?;

        for id in ids {
            let locked = match self.service.store().load_session(&id).await {
                Ok(Some(session)) => session.results_locked,
                Ok(None) => continue,
                Err(err) => {
                    report.failed += 1;
                    warn!(session_id = %id, error = %err, "Failed to load finished session");
                    continue;
                }
            };
            if locked {
                continue;
            }
            match self.service.finish_session(&id).await {
                Ok(_) => report.locked += 1,
                Err(err) => {
                    report.failed += 1;
                    warn!(session_id = %id, error = %err, "Failed to lock session results");
                }
            }
        }
        Ok(())
    }
}
