// Accès à la base historique SQLite.
// Le coeur ne fait que lire : les connexions sont ouvertes en lecture seule par défaut,
// et chaque connexion reçoit les PRAGMA de lecture à l'ouverture.
use crate::config::DatabaseConfig;
use crate::error::{AppError, AppResult};
use crate::models::{ConnectionTestResult, HistoryRecord};
use crate::pool::{self, ConnectionManager};
use crate::schema_profile::{SchemaProfile, SqlDialect};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::{ConnectOptions, Connection, Row};
use std::time::Duration;
use tracing::{debug, info};

// Délai maximal d'une sonde de connexion.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Rows-producing side of a pooled connection.
#[async_trait]
pub trait HistorySource: Send {
    async fn fetch_history(
        &mut self,
        sql: &str,
        profile: &dyn SchemaProfile,
    ) -> AppResult<Vec<HistoryRecord>>;

    /// Runs a tag search statement with one bound LIKE pattern.
    async fn fetch_tags(&mut self, sql: &str, pattern: &str) -> AppResult<Vec<String>>;
}

#[async_trait]
impl HistorySource for SqliteConnection {
    async fn fetch_history(
        &mut self,
        sql: &str,
        profile: &dyn SchemaProfile,
    ) -> AppResult<Vec<HistoryRecord>> {
        let rows = sqlx::query(sql).fetch_all(&mut *self).await?;
        debug!(rows = rows.len(), "Fetched history rows");
        rows.iter().map(|row| profile.map_row(row)).collect()
    }

    async fn fetch_tags(&mut self, sql: &str, pattern: &str) -> AppResult<Vec<String>> {
        let rows = sqlx::query(sql).bind(pattern).fetch_all(&mut *self).await?;
        rows.iter()
            .map(|row| {
                row.try_get::<String, _>(0)
                    .map(|tag| tag.trim().to_string())
                    .map_err(AppError::from)
            })
            .collect()
    }
}

/// Opens SQLite connections to the history database for the [`pool::Pool`].
#[derive(Debug, Clone)]
pub struct SqliteConnectionManager {
    config: DatabaseConfig,
}

impl SqliteConnectionManager {
    pub fn new(config: DatabaseConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    fn connect_options(&self) -> SqliteConnectOptions {
        // `cache_size` négatif : taille en KiB, ici 64 Mo de cache de pages.
        SqliteConnectOptions::new()
            .filename(&self.config.path)
            .read_only(self.config.read_only)
            .create_if_missing(false)
            .busy_timeout(self.config.busy_timeout())
            .pragma("cache_size", "-64000")
            .pragma("temp_store", "MEMORY")
            .pragma("mmap_size", "268435456")
            .disable_statement_logging()
    }
}

#[async_trait]
impl ConnectionManager for SqliteConnectionManager {
    type Connection = SqliteConnection;

    async fn connect(&self) -> AppResult<SqliteConnection> {
        let conn = self
            .connect_options()
            .connect()
            .await
            .map_err(|e| AppError::connection_with_hint(&e.to_string(), &self.config.path))?;
        debug!(database = %self.config.path, "Connected to history database");
        Ok(conn)
    }

    async fn ping(&self, conn: &mut SqliteConnection) -> AppResult<()> {
        conn.ping()
            .await
            .map_err(|e| AppError::connection_with_hint(&e.to_string(), &self.config.path))?;
        sqlx::query("SELECT 1").execute(&mut *conn).await?;
        Ok(())
    }

    fn dialect(&self) -> SqlDialect {
        SqlDialect::Sqlite
    }
}

/// Probes `config` with a throwaway connection. Never returns an error.
pub async fn test_connection(config: &DatabaseConfig) -> ConnectionTestResult {
    if let Err(e) = config.validate() {
        return ConnectionTestResult::failure(e.to_string());
    }
    info!(database = %config.path, "Testing database connection");
    let manager = SqliteConnectionManager::new(config.clone());
    pool::probe(&manager, PROBE_TIMEOUT).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema_profile::{DefaultProfile, SchemaProfile};
    use tempfile::TempDir;

    async fn seeded_database(dir: &TempDir) -> DatabaseConfig {
        let path = dir.path().join("history.db");
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true);
        let mut conn = options.connect().await.unwrap();

        sqlx::raw_sql(
            "CREATE TABLE History (DateTime TEXT, TagName TEXT, TagVal REAL, TagQuality TEXT);
             CREATE TABLE TagDataBase (TagName TEXT);
             INSERT INTO History VALUES ('2024-01-01 00:00:00', 'T1', 1.0, 'Good');
             INSERT INTO History VALUES ('2024-01-01 00:01:00', 'T1', 2.0, 'Good');
             INSERT INTO History VALUES ('2024-01-01 00:00:30', 'T2', 5.0, 'Bad');
             INSERT INTO TagDataBase VALUES ('T1'), ('T2'), ('P1');",
        )
        .execute(&mut conn)
        .await
        .unwrap();
        conn.close().await.unwrap();

        DatabaseConfig {
            path: path.to_string_lossy().into_owned(),
            ..DatabaseConfig::default()
        }
    }

    #[tokio::test]
    async fn test_fetch_history_through_profile() {
        let dir = TempDir::new().unwrap();
        let config = seeded_database(&dir).await;
        let manager = SqliteConnectionManager::new(config);
        let mut conn = manager.connect().await.unwrap();

        let profile = DefaultProfile;
        let filter = profile.build_tag_filter(Some(&["T1".to_string()]));
        let sql = profile.history_query_sql(
            "History",
            "2024-01-01 00:00:00",
            "2024-01-01 01:00:00",
            &filter,
        );
        let records = conn.fetch_history(&sql, &profile).await.unwrap();

        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.tag_name == "T1"));
        assert_eq!(records[1].value, 2.0);
    }

    #[tokio::test]
    async fn test_fetch_tags() {
        let dir = TempDir::new().unwrap();
        let config = seeded_database(&dir).await;
        let manager = SqliteConnectionManager::new(config);
        let mut conn = manager.connect().await.unwrap();

        let sql = DefaultProfile.tag_search_sql(10);
        let tags = conn.fetch_tags(&sql, "%T%").await.unwrap();
        assert_eq!(tags, vec!["T1".to_string(), "T2".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_table_is_a_query_error() {
        let dir = TempDir::new().unwrap();
        let config = seeded_database(&dir).await;
        let manager = SqliteConnectionManager::new(config);
        let mut conn = manager.connect().await.unwrap();

        let sql = DefaultProfile.history_query_sql("Missing", "a", "b", "");
        let err = conn.fetch_history(&sql, &DefaultProfile).await.unwrap_err();
        assert!(matches!(err, AppError::Query(_)));
    }

    #[tokio::test]
    async fn test_connection_probe() {
        let dir = TempDir::new().unwrap();
        let config = seeded_database(&dir).await;
        assert!(test_connection(&config).await.success);

        let missing = DatabaseConfig {
            path: dir.path().join("absent.db").to_string_lossy().into_owned(),
            ..DatabaseConfig::default()
        };
        let result = test_connection(&missing).await;
        assert!(!result.success);
        assert!(!result.message.is_empty());
    }

    #[tokio::test]
    async fn test_read_only_connection_rejects_writes() {
        let dir = TempDir::new().unwrap();
        let config = seeded_database(&dir).await;
        let manager = SqliteConnectionManager::new(config);
        let mut conn = manager.connect().await.unwrap();

        let result = sqlx::query("DELETE FROM History").execute(&mut conn).await;
        assert!(result.is_err());
    }
}
