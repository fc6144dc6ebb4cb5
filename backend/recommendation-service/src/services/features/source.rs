use super::{FeatureError, FeatureKey};
use crate::models::FeatureVector;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Attribute store: user preference profiles and item content features.
#[async_trait]
pub trait AttributeSource: Send + Sync {
    /// `Ok(None)` means the store has no record for the key.
    async fn fetch(&self, key: &FeatureKey) -> Result<Option<FeatureVector>, FeatureError>;
}

/// Event ingestion counts used for cold-start thresholds. Eventually consistent.
#[async_trait]
pub trait InteractionSource: Send + Sync {
    async fn user_interactions(&self, user_id: &str) -> Result<u64, FeatureError>;

    /// Exposure count per item; items the source never saw are left out.
    async fn item_exposures(&self, item_ids: &[String])
        -> Result<HashMap<String, u64>, FeatureError>;
}

/// On-disk catalog format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogDocument {
    #[serde(default)]
    pub users: BTreeMap<String, BTreeMap<String, f64>>,
    #[serde(default)]
    pub items: BTreeMap<String, BTreeMap<String, f64>>,
    #[serde(default)]
    pub interactions: BTreeMap<String, u64>,
    #[serde(default)]
    pub exposures: BTreeMap<String, u64>,
}

impl CatalogDocument {
    pub fn with_user(mut self, user_id: &str, profile: &[(&str, f64)]) -> Self {
        self.users.insert(user_id.to_string(), named(profile));
        self
    }

    pub fn with_item(mut self, item_id: &str, features: &[(&str, f64)]) -> Self {
        self.items.insert(item_id.to_string(), named(features));
        self
    }

    pub fn with_interactions(mut self, user_id: &str, count: u64) -> Self {
        self.interactions.insert(user_id.to_string(), count);
        self
    }

    pub fn with_exposures(mut self, item_id: &str, count: u64) -> Self {
        self.exposures.insert(item_id.to_string(), count);
        self
    }
}

fn named(values: &[(&str, f64)]) -> BTreeMap<String, f64> {
    values
        .iter()
        .map(|(name, value)| (name.to_string(), *value))
        .collect()
}

/// Catalog loaded into memory with every profile and item vectorised over the
/// same ordered feature names.
#[derive(Debug, Clone)]
pub struct CatalogSnapshot {
    document: CatalogDocument,
    feature_names: Vec<String>,
    users: HashMap<String, FeatureVector>,
    items: HashMap<String, FeatureVector>,
}

impl CatalogSnapshot {
    pub fn from_document(document: CatalogDocument) -> Self {
        let feature_names: Vec<String> = document
            .items
            .values()
            .flat_map(|features| features.keys().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let vectorise = |values: &BTreeMap<String, f64>| -> FeatureVector {
            Arc::new(
                feature_names
                    .iter()
                    .map(|name| values.get(name).copied().unwrap_or(0.0))
                    .collect(),
            )
        };

        let users = document
            .users
            .iter()
            .map(|(id, profile)| (id.clone(), vectorise(profile)))
            .collect();
        let items = document
            .items
            .iter()
            .map(|(id, features)| (id.clone(), vectorise(features)))
            .collect();

        Self {
            document,
            feature_names,
            users,
            items,
        }
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, FeatureError> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| FeatureError::catalog(path, e))?;
        let document: CatalogDocument =
            serde_json::from_slice(&bytes).map_err(|e| FeatureError::catalog(path, e))?;

        let snapshot = Self::from_document(document);
        info!(
            path = %path.display(),
            users = snapshot.users.len(),
            items = snapshot.items.len(),
            features = snapshot.feature_names.len(),
            "Catalog snapshot loaded"
        );

        Ok(snapshot)
    }

    pub async fn save(&self, path: impl AsRef<Path>) -> Result<(), FeatureError> {
        let path = path.as_ref();
        let bytes = serde_json::to_vec_pretty(&self.document)
            .map_err(|e| FeatureError::catalog(path, e))?;
        tokio::fs::write(path, bytes)
            .await
            .map_err(|e| FeatureError::catalog(path, e))
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    pub fn item_ids(&self) -> impl Iterator<Item = &str> {
        self.document.items.keys().map(String::as_str)
    }
}

#[async_trait]
impl AttributeSource for CatalogSnapshot {
    async fn fetch(&self, key: &FeatureKey) -> Result<Option<FeatureVector>, FeatureError> {
        Ok(match key {
            FeatureKey::User(id) => self.users.get(id).cloned(),
            FeatureKey::Item(id) => self.items.get(id).cloned(),
        })
    }
}

#[async_trait]
impl InteractionSource for CatalogSnapshot {
    async fn user_interactions(&self, user_id: &str) -> Result<u64, FeatureError> {
        Ok(self
            .document
            .interactions
            .get(user_id)
            .copied()
            .unwrap_or(0))
    }

    async fn item_exposures(
        &self,
        item_ids: &[String],
    ) -> Result<HashMap<String, u64>, FeatureError> {
        Ok(item_ids
            .iter()
            .filter_map(|id| {
                self.document
                    .exposures
                    .get(id)
                    .map(|count| (id.clone(), *count))
            })
            .collect())
    }
}
