use async_trait::async_trait;
use ctf_common::{Challenge, ChallengeCatalog, CtfError, Result};
use std::path::PathBuf;

/// Catalog backed by a JSON array of challenges on disk. The file is re-read
/// on every lookup so edits apply without a restart.
#[derive(Debug, Clone)]
pub struct JsonChallengeCatalog {
    path: PathBuf,
}

impl JsonChallengeCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn load(&self) -> Result<Vec<Challenge>> {
        let raw = tokio::fs::read(&self.path).await?;
        serde_json::from_slice(&raw).map_err(|e| {
            CtfError::Config(format!("invalid catalog {}: {e}", self.path.display()))
        })
    }
}

#[async_trait]
impl ChallengeCatalog for JsonChallengeCatalog {
    async fn lookup(&self, challenge_id: &str) -> Result<Option<Challenge>> {
        Ok(self
            .load()
            .await?
            .into_iter()
            .find(|c| c.id == challenge_id))
    }
}
