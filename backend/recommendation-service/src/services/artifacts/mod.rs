//! Artifact Store Adapter
//!
//! Holds the active version of every registered artifact kind behind an
//! atomically swapped, reference-counted handle. Readers never lock: a request
//! pins the handles active when it starts and keeps them until it finishes,
//! while the refresher installs newer versions for later requests.

mod source;
mod types;

pub use source::{ArtifactSource, FsArtifactSource, InMemoryArtifactSource};
pub use types::{
    ArtifactHandle, ArtifactId, ArtifactKind, ArtifactPayload, FactorTable, PopularityTable,
    ScoringArtifact,
};

use crate::metrics;
use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ArtifactError {
    /// No version of this kind has ever loaded successfully.
    #[error("no {0} artifact has been loaded")]
    Unavailable(ArtifactKind),

    #[error("artifact source error for {kind}: {message}")]
    Source { kind: ArtifactKind, message: String },

    #[error("invalid artifact {id}: {reason}")]
    Invalid { id: String, reason: String },

    #[error("artifact kind {0} is not registered with this store")]
    Unregistered(ArtifactKind),
}

impl ArtifactError {
    pub(crate) fn source(kind: ArtifactKind, err: impl fmt::Display) -> Self {
        ArtifactError::Source {
            kind,
            message: err.to_string(),
        }
    }
}

/// Result of one reload attempt for one kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadOutcome {
    Swapped { from: Option<u64>, to: u64 },
    Unchanged { version: u64 },
    NotPublished,
    /// The previous version, if any, stays active.
    Failed(String),
}

impl ReloadOutcome {
    fn label(&self) -> &'static str {
        match self {
            ReloadOutcome::Swapped { .. } => "swapped",
            ReloadOutcome::Unchanged { .. } => "unchanged",
            ReloadOutcome::NotPublished => "not_published",
            ReloadOutcome::Failed(_) => "failed",
        }
    }
}

/// Handles pinned for the lifetime of one request.
#[derive(Debug, Clone, Default)]
pub struct ArtifactSnapshot {
    handles: BTreeMap<ArtifactKind, ArtifactHandle>,
}

impl ArtifactSnapshot {
    pub fn from_handles(handles: BTreeMap<ArtifactKind, ArtifactHandle>) -> Self {
        Self { handles }
    }

    pub fn get(&self, kind: ArtifactKind) -> Option<&ArtifactHandle> {
        self.handles.get(&kind)
    }

    /// Active version per kind, keyed by kind name.
    pub fn versions(&self) -> BTreeMap<String, u64> {
        self.handles
            .iter()
            .map(|(kind, handle)| (kind.to_string(), handle.version()))
            .collect()
    }

    /// When each pinned handle was loaded, keyed by kind name.
    pub fn loaded_at(&self) -> BTreeMap<String, DateTime<Utc>> {
        self.handles
            .iter()
            .map(|(kind, handle)| (kind.to_string(), handle.loaded_at()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

pub struct ArtifactStore {
    source: Arc<dyn ArtifactSource>,
    slots: HashMap<ArtifactKind, ArcSwapOption<ScoringArtifact>>,
    /// Serializes reloads; readers never touch it.
    reload_lock: Mutex<()>,
}

impl ArtifactStore {
    /// Store serving every known artifact kind.
    pub fn new(source: Arc<dyn ArtifactSource>) -> Self {
        Self::with_kinds(source, &ArtifactKind::ALL)
    }

    pub fn with_kinds(source: Arc<dyn ArtifactSource>, kinds: &[ArtifactKind]) -> Self {
        let slots = kinds
            .iter()
            .map(|kind| (*kind, ArcSwapOption::empty()))
            .collect();

        Self {
            source,
            slots,
            reload_lock: Mutex::new(()),
        }
    }

    /// Current handle for `kind`, usable concurrently by any number of readers.
    pub fn load(&self, kind: ArtifactKind) -> Result<ArtifactHandle, ArtifactError> {
        self.slots
            .get(&kind)
            .ok_or(ArtifactError::Unregistered(kind))?
            .load_full()
            .ok_or(ArtifactError::Unavailable(kind))
    }

    /// Pin every loaded handle. Kinds that never loaded are absent.
    pub fn snapshot(&self) -> ArtifactSnapshot {
        let handles = self
            .slots
            .iter()
            .filter_map(|(kind, slot)| slot.load_full().map(|handle| (*kind, handle)))
            .collect();

        ArtifactSnapshot { handles }
    }

    pub fn active_version(&self, kind: ArtifactKind) -> Option<u64> {
        self.slots
            .get(&kind)
            .and_then(|slot| slot.load().as_ref().map(|artifact| artifact.version()))
    }

    /// Whether every registered kind has an active version.
    pub fn is_ready(&self) -> bool {
        self.slots.values().all(|slot| slot.load().is_some())
    }

    /// First load of every registered kind. Kinds that fail stay unavailable
    /// until a later reload succeeds.
    pub async fn initialize(&self) -> BTreeMap<ArtifactKind, ReloadOutcome> {
        let outcomes = self.reload().await;

        for (kind, outcome) in &outcomes {
            match outcome {
                ReloadOutcome::Swapped { to, .. } => {
                    info!(kind = %kind, version = to, "Artifact loaded at startup")
                }
                other => warn!(kind = %kind, outcome = ?other, "Artifact not available at startup"),
            }
        }

        outcomes
    }

    /// Install any newer published version of every registered kind.
    pub async fn reload(&self) -> BTreeMap<ArtifactKind, ReloadOutcome> {
        let _guard = self.reload_lock.lock().await;

        let mut kinds: Vec<ArtifactKind> = self.slots.keys().copied().collect();
        kinds.sort();

        let mut outcomes = BTreeMap::new();
        for kind in kinds {
            let outcome = self.reload_kind(kind).await;
            metrics::record_artifact_reload(kind.as_str(), outcome.label());
            outcomes.insert(kind, outcome);
        }

        outcomes
    }

    async fn reload_kind(&self, kind: ArtifactKind) -> ReloadOutcome {
        let Some(slot) = self.slots.get(&kind) else {
            return ReloadOutcome::Failed(ArtifactError::Unregistered(kind).to_string());
        };

        let current = slot.load().as_ref().map(|artifact| artifact.version());

        let latest = match self.source.latest_version(kind).await {
            Ok(Some(version)) => version,
            Ok(None) => return ReloadOutcome::NotPublished,
            Err(e) => {
                warn!(kind = %kind, error = %e, "Failed to query latest artifact version");
                return ReloadOutcome::Failed(e.to_string());
            }
        };

        if let Some(current) = current {
            if latest <= current {
                debug!(kind = %kind, version = current, "Artifact is up to date");
                return ReloadOutcome::Unchanged { version: current };
            }
        }

        let id = ArtifactId {
            kind,
            version: latest,
        };

        let artifact = match self
            .source
            .fetch(kind, latest)
            .await
            .and_then(|payload| ScoringArtifact::new(id, payload))
        {
            Ok(artifact) => artifact,
            Err(e) => {
                warn!(
                    artifact = %id,
                    active_version = ?current,
                    error = %e,
                    "Artifact reload failed, keeping previous version"
                );
                return ReloadOutcome::Failed(e.to_string());
            }
        };

        slot.store(Some(Arc::new(artifact)));
        metrics::set_artifact_version(kind.as_str(), latest);
        info!(artifact = %id, previous_version = ?current, "Artifact swapped");

        ReloadOutcome::Swapped {
            from: current,
            to: latest,
        }
    }

    /// Periodic reload task. Send on (or drop) the returned sender to stop it.
    pub fn spawn_refresher(
        self: &Arc<Self>,
        interval: Duration,
    ) -> (watch::Sender<()>, JoinHandle<()>) {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(());
        let store = Arc::clone(self);

        let handle = tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "Starting artifact refresher");

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; startup already loaded.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let outcomes = store.reload().await;
                        let swapped = outcomes
                            .values()
                            .filter(|outcome| matches!(outcome, ReloadOutcome::Swapped { .. }))
                            .count();
                        debug!(swapped, "Artifact refresh cycle completed");
                    }
                    _ = shutdown_rx.changed() => {
                        info!("Artifact refresher stopped");
                        break;
                    }
                }
            }
        });

        (shutdown_tx, handle)
    }
}
