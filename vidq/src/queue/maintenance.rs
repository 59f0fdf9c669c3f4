//! Periodic maintenance: staleness reaper, live rescheduler and history retention.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{DownloadQueue, QueueEvent};
use crate::config::MAX_RETENTION_DAYS;
use crate::database::models::Partition;
use crate::domain::DownloadStatus;

/// Counts of what one maintenance pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    /// Running downloads cancelled for lack of progress.
    pub stale: usize,
    /// Live or premiere records re-admitted from history.
    pub rescheduled: usize,
    /// Finished history records deleted by retention.
    pub purged: usize,
}

/// Windows longer than the configurable maximum are capped to it.
fn to_chrono(duration: std::time::Duration) -> ChronoDuration {
    let cap = ChronoDuration::days(MAX_RETENTION_DAYS as i64);
    ChronoDuration::from_std(duration).map_or(cap, |d| d.min(cap))
}

impl DownloadQueue {
    pub(super) async fn maintenance_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.maintenance_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {
                    let report = self.run_maintenance().await;
                    if report != MaintenanceReport::default() {
                        info!(
                            stale = report.stale,
                            rescheduled = report.rescheduled,
                            purged = report.purged,
                            "Maintenance pass finished"
                        );
                    }
                }
            }
        }
        debug!("Maintenance loop stopped");
    }

    /// Run one maintenance pass.
    pub async fn run_maintenance(self: &Arc<Self>) -> MaintenanceReport {
        MaintenanceReport {
            stale: self.reap_stale().await,
            rescheduled: self.reschedule_live().await,
            purged: self.purge_history().await,
        }
    }

    /// Cancel running downloads without forward progress for `stale_after`.
    async fn reap_stale(&self) -> usize {
        let Some(cutoff) = Utc::now().checked_sub_signed(to_chrono(self.config.stale_after))
        else {
            return 0;
        };
        let stale: Vec<String> = self
            .active
            .iter()
            .filter(|entry| {
                let lifecycle = entry.value();
                lifecycle.is_running()
                    && lifecycle
                        .last_progress_at()
                        .is_some_and(|last| last < cutoff)
            })
            .map(|entry| entry.key().clone())
            .collect();

        let mut reaped = 0;
        for id in stale {
            warn!(id = %id, stale_after = ?self.config.stale_after, "Cancelling stalled download");
            match self.cancel_one(&id).await {
                Ok(()) => {
                    reaped += 1;
                    self.history
                        .update(
                            &id,
                            |r| r.msg = Some("Cancelled after no progress".to_string()),
                            true,
                        )
                        .await;
                }
                Err(e) => debug!(id = %id, error = %e, "Stalled download already gone"),
            }
        }
        reaped
    }

    /// Re-admit waiting live records whose scheduled time has passed. Each record is tried
    /// at most once per pass.
    async fn reschedule_live(self: &Arc<Self>) -> usize {
        let now = Utc::now();
        let buffer = to_chrono(self.config.live_buffer);
        let due: Vec<String> = self
            .history
            .items()
            .into_iter()
            .filter(|r| r.is_live_due(now, buffer))
            .map(|r| r.id)
            .collect();

        let mut rescheduled = 0;
        for id in due {
            match self.retry_one(&id).await {
                Ok(()) => {
                    info!(id = %id, "Rescheduled live download");
                    rescheduled += 1;
                }
                Err(e) => {
                    warn!(id = %id, error = %e, "Failed to reschedule live download");
                    // Push the next attempt out by one buffer.
                    self.history
                        .update(
                            &id,
                            |r| {
                                r.status = DownloadStatus::NotLive;
                                r.scheduled_live_at = Some(now);
                                r.msg = Some(e.to_string());
                            },
                            true,
                        )
                        .await;
                }
            }
        }
        rescheduled
    }

    /// Delete finished history records older than the retention window.
    async fn purge_history(&self) -> usize {
        let days = self.config.history_retention_days;
        if days == 0 {
            return 0;
        }
        let window = ChronoDuration::days(days.min(MAX_RETENTION_DAYS) as i64);
        let Some(cutoff) = Utc::now().checked_sub_signed(window) else {
            return 0;
        };
        let purged = self
            .history
            .purge_before(DownloadStatus::Finished, cutoff)
            .await;
        for record in &purged {
            self.events.publish(QueueEvent::Removed {
                partition: Partition::History,
                id: record.id.clone(),
            });
        }
        purged.len()
    }
}
