// Configuration du service.
// Le coeur ne lit aucun fichier : les valeurs arrivent déjà validées par l'appelant,
// ou depuis l'environnement via `AppConfig::from_env`, comme le serveur le faisait pour `DATABASE_FILE`.
use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

// Lit une variable d'environnement et retombe sur la valeur par défaut si absente ou invalide.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Connection parameters for the source database.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseConfig {
    pub path: String,
    // La base source n'est jamais modifiée par le coeur.
    #[serde(default = "DatabaseConfig::default_read_only")]
    pub read_only: bool,
    #[serde(default = "DatabaseConfig::default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl DatabaseConfig {
    fn default_read_only() -> bool {
        true
    }

    fn default_busy_timeout_ms() -> u64 {
        5000
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.path.trim().is_empty() {
            return Err(AppError::Config("database path must not be empty".to_string()));
        }
        Ok(())
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "history.db".to_string(),
            read_only: Self::default_read_only(),
            busy_timeout_ms: Self::default_busy_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolConfig {
    #[serde(default = "PoolConfig::default_max_size")]
    pub max_size: u32,
    #[serde(default = "PoolConfig::default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
    #[serde(default = "PoolConfig::default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "PoolConfig::default_idle_timeout_secs")]
    pub idle_timeout_secs: Option<u64>,
    #[serde(default = "PoolConfig::default_max_lifetime_secs")]
    pub max_lifetime_secs: Option<u64>,
}

impl PoolConfig {
    fn default_max_size() -> u32 {
        3
    }

    fn default_acquire_timeout_secs() -> u64 {
        15
    }

    fn default_connect_timeout_secs() -> u64 {
        15
    }

    fn default_idle_timeout_secs() -> Option<u64> {
        Some(300)
    }

    fn default_max_lifetime_secs() -> Option<u64> {
        Some(900)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }

    pub fn max_lifetime(&self) -> Option<Duration> {
        self.max_lifetime_secs.map(Duration::from_secs)
    }

    pub fn validate(&self) -> AppResult<()> {
        if !(1..=64).contains(&self.max_size) {
            return Err(AppError::Config(format!(
                "pool max_size must be between 1 and 64, got {}",
                self.max_size
            )));
        }
        if self.acquire_timeout_secs == 0 || self.connect_timeout_secs == 0 {
            return Err(AppError::Config(
                "pool timeouts must be greater than zero".to_string(),
            ));
        }
        if self.idle_timeout_secs == Some(0) || self.max_lifetime_secs == Some(0) {
            return Err(AppError::Config(
                "pool idle_timeout and max_lifetime must be greater than zero when set".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: Self::default_max_size(),
            acquire_timeout_secs: Self::default_acquire_timeout_secs(),
            connect_timeout_secs: Self::default_connect_timeout_secs(),
            idle_timeout_secs: Self::default_idle_timeout_secs(),
            max_lifetime_secs: Self::default_max_lifetime_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    #[serde(default = "CacheConfig::default_max_entries")]
    pub max_entries: usize,
    // `None` désactive l'expiration : seule l'éviction LRU s'applique.
    #[serde(default = "CacheConfig::default_ttl_secs")]
    pub ttl_secs: Option<u64>,
    #[serde(default = "CacheConfig::default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

impl CacheConfig {
    fn default_max_entries() -> usize {
        200
    }

    fn default_ttl_secs() -> Option<u64> {
        Some(1800)
    }

    fn default_cleanup_interval_secs() -> u64 {
        60
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_secs.map(Duration::from_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.max_entries == 0 {
            return Err(AppError::Config(
                "cache max_entries must be at least 1".to_string(),
            ));
        }
        if self.ttl_secs == Some(0) {
            return Err(AppError::Config(
                "cache ttl_secs must be greater than zero when set".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: Self::default_max_entries(),
            ttl_secs: Self::default_ttl_secs(),
            cleanup_interval_secs: Self::default_cleanup_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryConfig {
    #[serde(default = "QueryConfig::default_profile")]
    pub default_profile: String,
    #[serde(default = "QueryConfig::default_table")]
    pub default_table: String,
    #[serde(default = "QueryConfig::default_query_timeout_secs")]
    pub query_timeout_secs: u64,
    #[serde(default = "QueryConfig::default_max_points_per_series")]
    pub max_points_per_series: usize,
    #[serde(default = "QueryConfig::default_search_limit")]
    pub search_limit: usize,
}

impl QueryConfig {
    fn default_profile() -> String {
        "default".to_string()
    }

    fn default_table() -> String {
        "History".to_string()
    }

    fn default_query_timeout_secs() -> u64 {
        60
    }

    fn default_max_points_per_series() -> usize {
        crate::processing::DEFAULT_MAX_POINTS
    }

    fn default_search_limit() -> usize {
        50
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.default_table.trim().is_empty() {
            return Err(AppError::Config("default table must not be empty".to_string()));
        }
        if self.query_timeout_secs == 0 {
            return Err(AppError::Config(
                "query timeout must be greater than zero".to_string(),
            ));
        }
        if self.max_points_per_series < 2 {
            return Err(AppError::Config(
                "max_points_per_series must be at least 2".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_profile: Self::default_profile(),
            default_table: Self::default_table(),
            query_timeout_secs: Self::default_query_timeout_secs(),
            max_points_per_series: Self::default_max_points_per_series(),
            search_limit: Self::default_search_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    pub addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:5000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl AppConfig {
    /// Builds the configuration from environment variables, keeping defaults for
    /// anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = AppConfig::default();

        let ttl_secs = match std::env::var("CACHE_TTL_SECS") {
            // `0` désactive l'expiration.
            Ok(v) => match v.trim().parse::<u64>() {
                Ok(0) => None,
                Ok(secs) => Some(secs),
                Err(_) => defaults.cache.ttl_secs,
            },
            Err(_) => defaults.cache.ttl_secs,
        };

        AppConfig {
            database: DatabaseConfig {
                path: std::env::var("DATABASE_FILE").unwrap_or(defaults.database.path),
                read_only: env_or("DATABASE_READ_ONLY", defaults.database.read_only),
                busy_timeout_ms: env_or("DATABASE_BUSY_TIMEOUT_MS", defaults.database.busy_timeout_ms),
            },
            pool: PoolConfig {
                max_size: env_or("POOL_MAX_SIZE", defaults.pool.max_size),
                acquire_timeout_secs: env_or("POOL_ACQUIRE_TIMEOUT_SECS", defaults.pool.acquire_timeout_secs),
                connect_timeout_secs: env_or("POOL_CONNECT_TIMEOUT_SECS", defaults.pool.connect_timeout_secs),
                idle_timeout_secs: defaults.pool.idle_timeout_secs,
                max_lifetime_secs: defaults.pool.max_lifetime_secs,
            },
            cache: CacheConfig {
                max_entries: env_or("CACHE_MAX_ENTRIES", defaults.cache.max_entries),
                ttl_secs,
                cleanup_interval_secs: env_or("CACHE_CLEANUP_INTERVAL_SECS", defaults.cache.cleanup_interval_secs),
            },
            query: QueryConfig {
                default_profile: std::env::var("SCHEMA_PROFILE").unwrap_or(defaults.query.default_profile),
                default_table: std::env::var("HISTORY_TABLE").unwrap_or(defaults.query.default_table),
                query_timeout_secs: env_or("QUERY_TIMEOUT_SECS", defaults.query.query_timeout_secs),
                max_points_per_series: env_or("MAX_POINTS_PER_SERIES", defaults.query.max_points_per_series),
                search_limit: env_or("TAG_SEARCH_LIMIT", defaults.query.search_limit),
            },
            server: ServerConfig {
                addr: std::env::var("SERVER_ADDR").unwrap_or(defaults.server.addr),
            },
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        self.database.validate()?;
        self.pool.validate()?;
        self.cache.validate()?;
        self.query.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pool.max_size, 3);
        assert_eq!(config.cache.max_entries, 200);
        assert_eq!(config.query.max_points_per_series, 5000);
        assert_eq!(config.query.default_profile, "default");
    }

    #[test]
    fn test_pool_validation() {
        let config = PoolConfig {
            max_size: 0,
            ..PoolConfig::default()
        };
        assert!(matches!(config.validate(), Err(AppError::Config(_))));

        let config = PoolConfig {
            acquire_timeout_secs: 0,
            ..PoolConfig::default()
        };
        assert!(config.validate().is_err());

        let config = PoolConfig {
            idle_timeout_secs: Some(0),
            ..PoolConfig::default()
        };
        assert!(config.validate().is_err());

        let config = PoolConfig {
            max_lifetime_secs: None,
            ..PoolConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cache_validation() {
        let config = CacheConfig {
            max_entries: 0,
            ..CacheConfig::default()
        };
        assert!(config.validate().is_err());

        let config = CacheConfig {
            ttl_secs: None,
            ..CacheConfig::default()
        };
        assert!(config.validate().is_ok());
        assert!(config.ttl().is_none());
    }

    #[test]
    fn test_partial_deserialization_uses_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"database": {"path": "plant.db"}, "pool": {"max_size": 5}}"#)
                .unwrap();
        assert_eq!(config.database.path, "plant.db");
        assert!(config.database.read_only);
        assert_eq!(config.pool.max_size, 5);
        assert_eq!(config.pool.acquire_timeout_secs, 15);
        assert_eq!(config.cache.ttl_secs, Some(1800));
    }
}
