//! Configuration management

use crate::error::{IngestError, Result};
use crate::storage::config::StorageConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Default state store URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/tidepool";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 5;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 1;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default database idle timeout in seconds (10 minutes).
pub const DEFAULT_DATABASE_IDLE_TIMEOUT_SECS: u64 = 600;

/// Default analytical store HTTP endpoint.
pub const DEFAULT_ANALYTICAL_URL: &str = "http://localhost:8123";

/// Default analytical database.
pub const DEFAULT_ANALYTICAL_DATABASE: &str = "tidepool";

/// Default analytical user.
pub const DEFAULT_ANALYTICAL_USER: &str = "default";

/// Default width of a transactional date window.
pub const DEFAULT_CHUNK_SIZE_DAYS: u32 = 30;

/// Default lookback when no start date is given (2 years).
pub const DEFAULT_LOOKBACK_DAYS: u32 = 730;

/// Records per master-data offset chunk.
pub const DEFAULT_MASTER_CHUNK_RECORDS: u64 = 5_000;

/// Upper bound planned for a chunk whose record count is unknown.
pub const DEFAULT_MAX_RECORDS_PER_CHUNK: u64 = 100_000;

/// Smallest page requested from a source API.
pub const DEFAULT_MIN_PAGE_SIZE: u64 = 1_000;

/// Largest page requested from a source API.
pub const DEFAULT_MAX_PAGE_SIZE: u64 = 2_000;

/// Wall-clock budget of one invocation (15 minutes).
pub const DEFAULT_BUDGET_SECS: u64 = 900;

/// Time reserved at the end of a budget for flushing and persisting progress.
pub const DEFAULT_SAFETY_BUFFER_SECS: u64 = 60;

/// Attempts per retried unit (one page, one file).
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 3;

/// First backoff delay; doubles on every further attempt.
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 500;

/// Directory holding field-mapping files.
pub const DEFAULT_MAPPING_DIR: &str = "./mappings";

/// Entries kept by the mapping cache.
pub const DEFAULT_MAPPING_CACHE_CAPACITY: usize = 128;

/// Directory the queue dispatcher writes requests to.
pub const DEFAULT_OUTBOX_DIR: &str = "./outbox";

/// Lifetime of a merge lease.
pub const DEFAULT_MERGE_LEASE_TTL_SECS: u64 = 900;

/// HTTP request timeout for source and analytical calls.
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub analytical: AnalyticalConfig,
    pub chunking: ChunkingConfig,
    pub deadline: DeadlineConfig,
    pub retry: RetryConfig,
    pub mapping: MappingConfig,
    pub dispatch: DispatchConfig,
    pub merge: MergeConfig,
}

/// State store connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

/// ClickHouse HTTP interface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticalConfig {
    pub url: String,
    pub database: String,
    pub user: String,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    pub chunk_size_days: u32,
    pub lookback_days: u32,
    pub master_chunk_records: u64,
    pub max_records_per_chunk: u64,
    pub min_page_size: u64,
    pub max_page_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadlineConfig {
    pub budget_secs: u64,
    pub safety_buffer_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingConfig {
    pub dir: PathBuf,
    pub cache_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    pub outbox_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    pub lease_ttl_secs: u64,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

impl EngineConfig {
    /// Load configuration from environment and defaults
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = EngineConfig {
            database: DatabaseConfig {
                url: env_string("DATABASE_URL", DEFAULT_DATABASE_URL),
                max_connections: env_or("DATABASE_MAX_CONNECTIONS", DEFAULT_DATABASE_MAX_CONNECTIONS),
                min_connections: env_or("DATABASE_MIN_CONNECTIONS", DEFAULT_DATABASE_MIN_CONNECTIONS),
                connect_timeout_secs: env_or(
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                ),
                idle_timeout_secs: env_or("DATABASE_IDLE_TIMEOUT", DEFAULT_DATABASE_IDLE_TIMEOUT_SECS),
            },
            storage: StorageConfig::from_env(),
            analytical: AnalyticalConfig {
                url: env_string("CLICKHOUSE_URL", DEFAULT_ANALYTICAL_URL),
                database: env_string("CLICKHOUSE_DATABASE", DEFAULT_ANALYTICAL_DATABASE),
                user: env_string("CLICKHOUSE_USER", DEFAULT_ANALYTICAL_USER),
                password: std::env::var("CLICKHOUSE_PASSWORD").ok(),
                timeout_secs: env_or("CLICKHOUSE_TIMEOUT", DEFAULT_HTTP_TIMEOUT_SECS),
            },
            chunking: ChunkingConfig {
                chunk_size_days: env_or("TIDEPOOL_CHUNK_SIZE_DAYS", DEFAULT_CHUNK_SIZE_DAYS),
                lookback_days: env_or("TIDEPOOL_LOOKBACK_DAYS", DEFAULT_LOOKBACK_DAYS),
                master_chunk_records: env_or(
                    "TIDEPOOL_MASTER_CHUNK_RECORDS",
                    DEFAULT_MASTER_CHUNK_RECORDS,
                ),
                max_records_per_chunk: env_or(
                    "TIDEPOOL_MAX_RECORDS_PER_CHUNK",
                    DEFAULT_MAX_RECORDS_PER_CHUNK,
                ),
                min_page_size: env_or("TIDEPOOL_MIN_PAGE_SIZE", DEFAULT_MIN_PAGE_SIZE),
                max_page_size: env_or("TIDEPOOL_MAX_PAGE_SIZE", DEFAULT_MAX_PAGE_SIZE),
            },
            deadline: DeadlineConfig {
                budget_secs: env_or("TIDEPOOL_BUDGET_SECS", DEFAULT_BUDGET_SECS),
                safety_buffer_secs: env_or("TIDEPOOL_SAFETY_BUFFER_SECS", DEFAULT_SAFETY_BUFFER_SECS),
            },
            retry: RetryConfig {
                max_attempts: env_or("TIDEPOOL_RETRY_MAX_ATTEMPTS", DEFAULT_RETRY_MAX_ATTEMPTS),
                base_delay_ms: env_or("TIDEPOOL_RETRY_BASE_DELAY_MS", DEFAULT_RETRY_BASE_DELAY_MS),
            },
            mapping: MappingConfig {
                dir: PathBuf::from(env_string("TIDEPOOL_MAPPING_DIR", DEFAULT_MAPPING_DIR)),
                cache_capacity: env_or(
                    "TIDEPOOL_MAPPING_CACHE_CAPACITY",
                    DEFAULT_MAPPING_CACHE_CAPACITY,
                ),
            },
            dispatch: DispatchConfig {
                outbox_dir: PathBuf::from(env_string("TIDEPOOL_OUTBOX_DIR", DEFAULT_OUTBOX_DIR)),
            },
            merge: MergeConfig {
                lease_ttl_secs: env_or("TIDEPOOL_MERGE_LEASE_TTL_SECS", DEFAULT_MERGE_LEASE_TTL_SECS),
            },
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(IngestError::Config("Database URL cannot be empty".into()));
        }

        if self.database.max_connections == 0 {
            return Err(IngestError::Config(
                "Database max_connections must be greater than 0".into(),
            ));
        }

        if self.database.min_connections > self.database.max_connections {
            return Err(IngestError::Config(format!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections, self.database.max_connections
            )));
        }

        if self.storage.bucket.is_empty() {
            return Err(IngestError::Config("S3 bucket cannot be empty".into()));
        }

        let chunking = &self.chunking;
        if chunking.chunk_size_days == 0 {
            return Err(IngestError::Config("chunk_size_days must be greater than 0".into()));
        }
        if chunking.master_chunk_records == 0 || chunking.max_records_per_chunk == 0 {
            return Err(IngestError::Config("chunk record limits must be greater than 0".into()));
        }
        if chunking.min_page_size == 0 || chunking.min_page_size > chunking.max_page_size {
            return Err(IngestError::Config(format!(
                "page size bounds are invalid: min {} max {}",
                chunking.min_page_size, chunking.max_page_size
            )));
        }

        if self.deadline.safety_buffer_secs >= self.deadline.budget_secs {
            tracing::warn!(
                budget_secs = self.deadline.budget_secs,
                safety_buffer_secs = self.deadline.safety_buffer_secs,
                "Safety buffer consumes the whole budget; every invocation will stop immediately"
            );
        }

        if self.retry.max_attempts == 0 {
            return Err(IngestError::Config("retry max_attempts must be at least 1".into()));
        }

        if self.mapping.cache_capacity == 0 {
            return Err(IngestError::Config("mapping cache capacity must be greater than 0".into()));
        }

        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                idle_timeout_secs: DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
            },
            storage: StorageConfig::for_minio("http://localhost:9000", "tidepool-data"),
            analytical: AnalyticalConfig {
                url: DEFAULT_ANALYTICAL_URL.to_string(),
                database: DEFAULT_ANALYTICAL_DATABASE.to_string(),
                user: DEFAULT_ANALYTICAL_USER.to_string(),
                password: None,
                timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            },
            chunking: ChunkingConfig::default(),
            deadline: DeadlineConfig {
                budget_secs: DEFAULT_BUDGET_SECS,
                safety_buffer_secs: DEFAULT_SAFETY_BUFFER_SECS,
            },
            retry: RetryConfig {
                max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
                base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            },
            mapping: MappingConfig {
                dir: PathBuf::from(DEFAULT_MAPPING_DIR),
                cache_capacity: DEFAULT_MAPPING_CACHE_CAPACITY,
            },
            dispatch: DispatchConfig {
                outbox_dir: PathBuf::from(DEFAULT_OUTBOX_DIR),
            },
            merge: MergeConfig {
                lease_ttl_secs: DEFAULT_MERGE_LEASE_TTL_SECS,
            },
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size_days: DEFAULT_CHUNK_SIZE_DAYS,
            lookback_days: DEFAULT_LOOKBACK_DAYS,
            master_chunk_records: DEFAULT_MASTER_CHUNK_RECORDS,
            max_records_per_chunk: DEFAULT_MAX_RECORDS_PER_CHUNK,
            min_page_size: DEFAULT_MIN_PAGE_SIZE,
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_inverted_page_bounds() {
        let mut config = EngineConfig::default();
        config.chunking.min_page_size = 3000;
        assert!(config.validate().unwrap_err().is_config());
    }

    #[test]
    fn test_rejects_zero_chunk_days() {
        let mut config = EngineConfig::default();
        config.chunking.chunk_size_days = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_load_reads_environment() {
        std::env::set_var("TIDEPOOL_CHUNK_SIZE_DAYS", "7");
        std::env::set_var("TIDEPOOL_RETRY_MAX_ATTEMPTS", "5");

        let config = EngineConfig::load().unwrap();
        assert_eq!(config.chunking.chunk_size_days, 7);
        assert_eq!(config.retry.max_attempts, 5);

        std::env::remove_var("TIDEPOOL_CHUNK_SIZE_DAYS");
        std::env::remove_var("TIDEPOOL_RETRY_MAX_ATTEMPTS");
    }
}
