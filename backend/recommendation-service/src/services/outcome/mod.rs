//! Per-request outcome records for the analytics sink.
//!
//! Recording is fire-and-forget: the request path only does a `try_send`
//! into a bounded channel and a background task drains it into the sink.

use crate::metrics;
use crate::models::{ExperimentAssignment, RankedItem, StrategyReport};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct OutcomeRecord {
    pub request_id: Uuid,
    pub user_id: String,
    /// `complete`, `partial` or the error code of a failed request.
    pub outcome: String,
    pub assignments: Vec<ExperimentAssignment>,
    pub blend: String,
    pub items: Vec<RankedItem>,
    pub strategies: Vec<StrategyReport>,
    pub artifact_versions: BTreeMap<String, u64>,
    pub latency_ms: u64,
    pub recorded_at: DateTime<Utc>,
}

/// Metrics/analytics collaborator.
#[async_trait]
pub trait OutcomeSink: Send + Sync {
    async fn record(&self, record: OutcomeRecord);
}

/// Writes one structured log line per request.
pub struct TracingOutcomeSink;

#[async_trait]
impl OutcomeSink for TracingOutcomeSink {
    async fn record(&self, record: OutcomeRecord) {
        let variants = record
            .assignments
            .iter()
            .map(|a| format!("{}={}", a.experiment_id, a.variant_id))
            .collect::<Vec<_>>()
            .join(",");
        let top_items = record
            .items
            .iter()
            .take(5)
            .map(|item| item.item_id.as_str())
            .collect::<Vec<_>>()
            .join(",");

        info!(
            target: "recommendation_outcome",
            request_id = %record.request_id,
            user_id = %record.user_id,
            outcome = %record.outcome,
            blend = %record.blend,
            variants = %variants,
            items = record.items.len(),
            top_items = %top_items,
            latency_ms = record.latency_ms,
            "Recommendation outcome"
        );
    }
}

#[derive(Clone)]
pub struct OutcomeRecorder {
    tx: mpsc::Sender<OutcomeRecord>,
    dropped: Arc<AtomicU64>,
}

impl OutcomeRecorder {
    /// Start the drain task. It ends once every recorder clone is dropped.
    pub fn spawn(capacity: usize, sink: Arc<dyn OutcomeSink>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<OutcomeRecord>(capacity.max(1));

        let handle = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                sink.record(record).await;
            }
            debug!("Outcome drain stopped");
        });

        let recorder = Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (recorder, handle)
    }

    /// Never waits. A full or closed channel drops the record.
    pub fn record(&self, record: OutcomeRecord) {
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(record)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::record_outcome_dropped();
                debug!(request_id = %record.request_id, "Outcome channel full, record dropped");
            }
            Err(TrySendError::Closed(record)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::record_outcome_dropped();
                debug!(request_id = %record.request_id, "Outcome channel closed, record dropped");
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
