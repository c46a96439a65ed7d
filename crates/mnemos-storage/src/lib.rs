//! Memory backends for the mnemos memory engine

mod fallback;
mod in_memory;

#[cfg(feature = "sqlite")]
mod sqlite;

#[cfg(feature = "redis-storage")]
mod redis;

pub use fallback::FallbackBackend;
pub use in_memory::InMemoryBackend;
pub use mnemos_core::{MemoryBackend, MemoryError, Result};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteBackend;

#[cfg(feature = "redis-storage")]
pub use redis::RedisBackend;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type")]
pub enum StorageConfig {
    #[default]
    #[serde(rename = "memory")]
    Memory,
    #[serde(rename = "sqlite")]
    Sqlite {
        path: String,
        /// Route to a process-local store while the database is unavailable.
        #[serde(default)]
        fallback: bool,
    },
    #[serde(rename = "redis")]
    Redis {
        url: String,
        #[serde(default)]
        prefix: Option<String>,
        #[serde(default)]
        fallback: bool,
    },
}

impl StorageConfig {
    fn wants_fallback(&self) -> bool {
        match self {
            StorageConfig::Memory => false,
            StorageConfig::Sqlite { fallback, .. } | StorageConfig::Redis { fallback, .. } => {
                *fallback
            }
        }
    }
}

pub async fn create_backend(config: &StorageConfig) -> Result<Arc<dyn MemoryBackend>> {
    let primary: Arc<dyn MemoryBackend> = match config {
        StorageConfig::Memory => Arc::new(InMemoryBackend::new()),

        #[cfg(feature = "sqlite")]
        StorageConfig::Sqlite { path, .. } => Arc::new(SqliteBackend::new(path).await?),

        #[cfg(not(feature = "sqlite"))]
        StorageConfig::Sqlite { .. } => {
            return Err(MemoryError::Config(
                "SQLite storage requires 'sqlite' feature".into(),
            ));
        }

        #[cfg(feature = "redis-storage")]
        StorageConfig::Redis { url, prefix, .. } => {
            let mut backend = RedisBackend::new(url)?;
            if let Some(p) = prefix {
                backend = backend.with_prefix(p);
            }
            Arc::new(backend)
        }

        #[cfg(not(feature = "redis-storage"))]
        StorageConfig::Redis { .. } => {
            return Err(MemoryError::Config(
                "Redis storage requires 'redis-storage' feature".into(),
            ));
        }
    };

    if config.wants_fallback() {
        info!("[storage] {} backend with local fallback", primary.name());
        let local: Arc<dyn MemoryBackend> = Arc::new(InMemoryBackend::named("local"));
        return Ok(Arc::new(FallbackBackend::new(primary, local)));
    }

    Ok(primary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_config_from_yaml() {
        let config: StorageConfig = serde_yaml::from_str("type: memory").unwrap();
        assert_eq!(config, StorageConfig::Memory);

        let config: StorageConfig =
            serde_yaml::from_str("type: sqlite\npath: ./mem.db\nfallback: true").unwrap();
        assert_eq!(
            config,
            StorageConfig::Sqlite {
                path: "./mem.db".into(),
                fallback: true
            }
        );

        let config: StorageConfig =
            serde_yaml::from_str("type: redis\nurl: redis://localhost").unwrap();
        assert!(matches!(
            config,
            StorageConfig::Redis { prefix: None, fallback: false, .. }
        ));
    }

    #[test]
    fn test_default_is_memory() {
        assert_eq!(StorageConfig::default(), StorageConfig::Memory);
    }

    #[tokio::test]
    async fn test_create_memory_backend() {
        let backend = create_backend(&StorageConfig::Memory).await.unwrap();
        assert_eq!(backend.name(), "in-memory");
        backend.health_check().await.unwrap();
    }

    #[cfg(not(feature = "sqlite"))]
    #[tokio::test]
    async fn test_sqlite_requires_feature() {
        let config = StorageConfig::Sqlite {
            path: "x.db".into(),
            fallback: false,
        };
        assert!(matches!(
            create_backend(&config).await,
            Err(MemoryError::Config(_))
        ));
    }
}
