use crate::repo::project::ProjectRepo;
use crate::repo::RepoError;
use async_trait::async_trait;
use chrono::Utc;
use cineforge_common::model::{
    AssetHistoryError, AssetKind, AssetMetadata, AssetRegistry, AssetScope, AssetType,
    AssetVersion,
};
use cineforge_common::SafeDisplay;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum AssetError {
    #[error("Asset scope not found: {0}")]
    ScopeNotFound(AssetScope),
    #[error(transparent)]
    InvalidBest(#[from] AssetHistoryError),
    #[error("Corrupt asset registry for {scope}: {detail}")]
    CorruptRegistry { scope: AssetScope, detail: String },
    #[error(transparent)]
    InternalRepoError(#[from] RepoError),
}

impl SafeDisplay for AssetError {
    fn to_safe_string(&self) -> String {
        match self {
            Self::ScopeNotFound(_) => self.to_string(),
            Self::InvalidBest(_) => self.to_string(),
            Self::CorruptRegistry { .. } => self.to_string(),
            Self::InternalRepoError(inner) => inner.to_safe_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewAssetVersion {
    pub data: String,
    pub asset_type: AssetType,
    pub metadata: AssetMetadata,
}

/// Append-only versioned artifact store keyed by (scope, asset kind).
///
/// Appends go through the owning aggregate's `assets` column; callers are
/// responsible for holding the project lock, which is what serializes
/// concurrent appends for the same scope.
#[async_trait]
pub trait AssetManager: Send + Sync {
    async fn next_version_number(
        &self,
        scope: &AssetScope,
        kind: AssetKind,
    ) -> Result<u32, AssetError>;

    /// Appends the given versions in order, optionally advancing `best` to
    /// the last one. Returns the version numbers assigned.
    async fn create_versioned_assets(
        &self,
        scope: &AssetScope,
        kind: AssetKind,
        versions: Vec<NewAssetVersion>,
        set_as_best: bool,
    ) -> Result<Vec<u32>, AssetError>;

    async fn best_version(
        &self,
        scope: &AssetScope,
        kind: AssetKind,
    ) -> Result<Option<AssetVersion>, AssetError>;

    /// Moves the `best` pointer; `0` unsets it. Idempotent.
    async fn set_best_version(
        &self,
        scope: &AssetScope,
        kind: AssetKind,
        version: u32,
    ) -> Result<(), AssetError>;

    async fn registry(&self, scope: &AssetScope) -> Result<AssetRegistry, AssetError>;
}

pub struct AssetManagerDefault {
    project_repo: Arc<dyn ProjectRepo>,
}

impl AssetManagerDefault {
    pub fn new(project_repo: Arc<dyn ProjectRepo>) -> Self {
        Self { project_repo }
    }

    async fn load_registry(&self, scope: &AssetScope) -> Result<AssetRegistry, AssetError> {
        let raw = self
            .project_repo
            .load_assets(scope)
            .await?
            .ok_or_else(|| AssetError::ScopeNotFound(scope.clone()))?;
        serde_json::from_value(raw).map_err(|e| AssetError::CorruptRegistry {
            scope: scope.clone(),
            detail: e.to_string(),
        })
    }

    async fn store_registry(
        &self,
        scope: &AssetScope,
        registry: &AssetRegistry,
    ) -> Result<(), AssetError> {
        let raw = serde_json::to_value(registry).map_err(|e| AssetError::CorruptRegistry {
            scope: scope.clone(),
            detail: e.to_string(),
        })?;
        let stored = self.project_repo.store_assets(scope, raw, Utc::now()).await?;
        if !stored {
            return Err(AssetError::ScopeNotFound(scope.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl AssetManager for AssetManagerDefault {
    async fn next_version_number(
        &self,
        scope: &AssetScope,
        kind: AssetKind,
    ) -> Result<u32, AssetError> {
        let registry = self.load_registry(scope).await?;
        Ok(registry
            .history(kind)
            .map(|history| history.next_version_number())
            .unwrap_or(1))
    }

    async fn create_versioned_assets(
        &self,
        scope: &AssetScope,
        kind: AssetKind,
        versions: Vec<NewAssetVersion>,
        set_as_best: bool,
    ) -> Result<Vec<u32>, AssetError> {
        let mut registry = self.load_registry(scope).await?;
        let history = registry.history_mut(kind);
        let now = Utc::now();
        let mut assigned = Vec::with_capacity(versions.len());
        for version in versions {
            assigned.push(history.append(
                version.data,
                version.asset_type,
                version.metadata,
                now,
                set_as_best,
            ));
        }
        self.store_registry(scope, &registry).await?;
        info!(
            scope = %scope,
            kind = %kind,
            versions = ?assigned,
            set_as_best,
            "appended asset versions"
        );
        Ok(assigned)
    }

    async fn best_version(
        &self,
        scope: &AssetScope,
        kind: AssetKind,
    ) -> Result<Option<AssetVersion>, AssetError> {
        let registry = self.load_registry(scope).await?;
        Ok(registry.best_version(kind).cloned())
    }

    async fn set_best_version(
        &self,
        scope: &AssetScope,
        kind: AssetKind,
        version: u32,
    ) -> Result<(), AssetError> {
        let mut registry = self.load_registry(scope).await?;
        registry.history_mut(kind).set_best(version)?;
        self.store_registry(scope, &registry).await?;
        info!(scope = %scope, kind = %kind, version, "moved best pointer");
        Ok(())
    }

    async fn registry(&self, scope: &AssetScope) -> Result<AssetRegistry, AssetError> {
        self.load_registry(scope).await
    }
}
