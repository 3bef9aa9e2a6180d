//! Bulk pull of MLS listings into the local store.

use std::fmt;

use chrono::{DateTime, Utc};
use realcomp_core::PropertyFilters;
use realcomp_providers::{normalize, ProviderId};
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::engine::ReconciliationEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Success,
    Partial,
    Error,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncStatus::Success => "success",
            SyncStatus::Partial => "partial",
            SyncStatus::Error => "error",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub run_id: Uuid,
    pub status: SyncStatus,
    pub message: String,
    pub count: usize,
    pub successful: usize,
    pub failed: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SyncSummary {
    fn failed_run(run_id: Uuid, started_at: DateTime<Utc>, message: String) -> Self {
        Self {
            run_id,
            status: SyncStatus::Error,
            message,
            count: 0,
            successful: 0,
            failed: 0,
            started_at,
            finished_at: Utc::now(),
        }
    }
}

fn classify(count: usize, successful: usize, failed: usize) -> (SyncStatus, String) {
    if failed == 0 {
        let message = if count == 0 {
            "MLS returned no listings".to_string()
        } else {
            format!("synchronized {successful} listings")
        };
        (SyncStatus::Success, message)
    } else if successful == 0 {
        (SyncStatus::Error, format!("all {failed} listings failed to synchronize"))
    } else {
        (
            SyncStatus::Partial,
            format!("synchronized {successful} of {count} listings; {failed} failed"),
        )
    }
}

impl ReconciliationEngine {
    /// Pulls up to `limit` MLS listings and upserts each by identity key.
    /// Per-record failures are counted, never fatal to the batch.
    pub async fn synchronize_mls_data(&self, limit: usize) -> SyncSummary {
        let run_id = Uuid::new_v4();
        let span = info_span!("mls_sync", %run_id, limit);
        self.run_mls_sync(run_id, limit).instrument(span).await
    }

    async fn run_mls_sync(&self, run_id: Uuid, limit: usize) -> SyncSummary {
        let started_at = Utc::now();
        let Some(mls) = self
            .providers
            .iter()
            .find(|p| p.provider_id() == ProviderId::Mls && p.is_configured())
        else {
            warn!("MLS provider is not configured; skipping sync");
            return SyncSummary::failed_run(run_id, started_at, "MLS provider is not configured".into());
        };

        self.cache.clear().await;
        let filters = PropertyFilters {
            limit: Some(limit.max(1)),
            ..Default::default()
        };
        let records = match mls.search(&filters).await {
            Ok(records) => records,
            Err(err) => {
                warn!(error = %err, "MLS sync fetch failed");
                return SyncSummary::failed_run(run_id, started_at, format!("MLS request failed: {err}"));
            }
        };

        let count = records.len();
        let mut successful = 0usize;
        let mut failed = 0usize;
        for record in &records {
            let draft = match normalize(record) {
                Ok(draft) => draft,
                Err(err) => {
                    warn!(error = %err, "skipping MLS record");
                    failed += 1;
                    continue;
                }
            };
            match self.store.upsert_property(&draft).await {
                Ok(_) => successful += 1,
                Err(err) => {
                    warn!(key = %draft.identity_key(), error = %err, "failed to store MLS record");
                    failed += 1;
                }
            }
        }

        let (status, message) = classify(count, successful, failed);
        info!(%status, count, successful, failed, "MLS sync finished");
        SyncSummary {
            run_id,
            status,
            message,
            count,
            successful,
            failed,
            started_at,
            finished_at: Utc::now(),
        }
    }
}
