use super::{ArtifactError, ArtifactKind, ArtifactPayload};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::debug;

/// Where published artifacts come from (the model training pipeline).
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// Newest published version of `kind`, or `None` if nothing was published yet.
    async fn latest_version(&self, kind: ArtifactKind) -> Result<Option<u64>, ArtifactError>;

    async fn fetch(&self, kind: ArtifactKind, version: u64)
        -> Result<ArtifactPayload, ArtifactError>;
}

/// Reads artifacts laid out as `<root>/<kind>/v<N>.json`.
pub struct FsArtifactSource {
    root: PathBuf,
}

impl FsArtifactSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn kind_dir(&self, kind: ArtifactKind) -> PathBuf {
        self.root.join(kind.as_str())
    }

    fn version_path(&self, kind: ArtifactKind, version: u64) -> PathBuf {
        self.kind_dir(kind).join(format!("v{}.json", version))
    }

    /// Write a payload as the given version (used by tooling and tests).
    pub async fn write(
        &self,
        version: u64,
        payload: &ArtifactPayload,
    ) -> Result<PathBuf, ArtifactError> {
        let kind = payload.kind();
        let dir = self.kind_dir(kind);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| ArtifactError::source(kind, e))?;

        let bytes = payload
            .encode()
            .map_err(|e| ArtifactError::source(kind, e))?;
        let path = self.version_path(kind, version);
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| ArtifactError::source(kind, e))?;

        Ok(path)
    }
}

fn parse_version(file_name: &str) -> Option<u64> {
    file_name
        .strip_prefix('v')?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

#[async_trait]
impl ArtifactSource for FsArtifactSource {
    async fn latest_version(&self, kind: ArtifactKind) -> Result<Option<u64>, ArtifactError> {
        let dir = self.kind_dir(kind);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(kind = %kind, dir = %dir.display(), "No artifact directory yet");
                return Ok(None);
            }
            Err(e) => return Err(ArtifactError::source(kind, e)),
        };

        let mut latest = None;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ArtifactError::source(kind, e))?
        {
            if let Some(version) = entry.file_name().to_str().and_then(parse_version) {
                latest = latest.max(Some(version));
            }
        }

        Ok(latest)
    }

    async fn fetch(
        &self,
        kind: ArtifactKind,
        version: u64,
    ) -> Result<ArtifactPayload, ArtifactError> {
        let path = self.version_path(kind, version);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| ArtifactError::source(kind, format!("{}: {}", path.display(), e)))?;

        ArtifactPayload::decode(kind, &bytes).map_err(|e| ArtifactError::Invalid {
            id: format!("{}-v{}", kind, version),
            reason: e.to_string(),
        })
    }
}

/// In-process artifact source for embedding the engine and for tests.
#[derive(Default)]
pub struct InMemoryArtifactSource {
    published: RwLock<HashMap<ArtifactKind, BTreeMap<u64, ArtifactPayload>>>,
}

impl InMemoryArtifactSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish the payload as the next version of its kind and return that version.
    pub async fn publish(&self, payload: ArtifactPayload) -> u64 {
        let mut published = self.published.write().await;
        let versions = published.entry(payload.kind()).or_default();
        let version = versions.keys().next_back().copied().unwrap_or(0) + 1;
        versions.insert(version, payload);
        version
    }
}

#[async_trait]
impl ArtifactSource for InMemoryArtifactSource {
    async fn latest_version(&self, kind: ArtifactKind) -> Result<Option<u64>, ArtifactError> {
        let published = self.published.read().await;
        Ok(published
            .get(&kind)
            .and_then(|versions| versions.keys().next_back().copied()))
    }

    async fn fetch(
        &self,
        kind: ArtifactKind,
        version: u64,
    ) -> Result<ArtifactPayload, ArtifactError> {
        let published = self.published.read().await;
        published
            .get(&kind)
            .and_then(|versions| versions.get(&version))
            .cloned()
            .ok_or_else(|| ArtifactError::source(kind, format!("version {} not published", version)))
    }
}
