//! File operations

use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::errors::UpgradeError;

/// A file wrapper with path
#[derive(Debug, Clone)]
pub struct File {
    path: PathBuf,
}

impl File {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path).await.is_ok()
    }

    /// Read file contents as string
    pub async fn read_string(&self) -> Result<String, UpgradeError> {
        let mut file = fs::File::open(&self.path).await?;
        let mut contents = String::new();
        file.read_to_string(&mut contents).await?;
        Ok(contents)
    }

    /// Read file as JSON
    pub async fn read_json<T: DeserializeOwned>(&self) -> Result<T, UpgradeError> {
        let contents = self.read_string().await?;
        serde_json::from_str(&contents).map_err(|e| {
            UpgradeError::ConfigError(format!("{}: {}", self.path.display(), e))
        })
    }

    /// Write string to file, creating parent directories
    pub async fn write_string(&self, contents: &str) -> Result<(), UpgradeError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = fs::File::create(&self.path).await?;
        file.write_all(contents.as_bytes()).await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Write JSON to file
    pub async fn write_json<T: Serialize>(&self, value: &T) -> Result<(), UpgradeError> {
        let contents = serde_json::to_string_pretty(value)?;
        self.write_string(&contents).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Record {
        host: String,
        phase: String,
    }

    fn scratch(name: &str) -> File {
        let dir = std::env::temp_dir().join(format!("upgrade-agent-{}", crate::utils::generate_uuid()));
        File::new(dir.join(name))
    }

    #[tokio::test]
    async fn test_write_then_read_json() {
        let file = scratch("status.json");
        assert!(!file.exists().await);

        let record = Record {
            host: "r1".to_string(),
            phase: "completed".to_string(),
        };
        file.write_json(&record).await.unwrap();
        assert!(file.exists().await);
        assert_eq!(file.read_json::<Record>().await.unwrap(), record);
    }

    #[tokio::test]
    async fn test_bad_json_is_config_error() {
        let file = scratch("settings.json");
        file.write_string("{ not json").await.unwrap();
        let err = file.read_json::<Record>().await.unwrap_err();
        assert_eq!(err.kind(), "ConfigurationError");
        assert!(err.to_string().contains("settings.json"));
    }
}
