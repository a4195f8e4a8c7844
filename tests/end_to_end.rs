use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{ConnectOptions, Connection};
use std::sync::Arc;
use tag_history_server::cache::QueryCache;
use tag_history_server::config::{CacheConfig, DatabaseConfig, PoolConfig, QueryConfig};
use tag_history_server::database::SqliteConnectionManager;
use tag_history_server::models::{LegacyQueryRequest, ProcessingConfig, QueryRequest};
use tag_history_server::pool::Pool;
use tag_history_server::service::QueryService;
use tag_history_server::AppError;
use tempfile::TempDir;

async fn seed(dir: &TempDir) -> DatabaseConfig {
    let path = dir.path().join("history.db");
    let mut conn = SqliteConnectOptions::new()
        .filename(&path)
        .create_if_missing(true)
        .connect()
        .await
        .unwrap();

    sqlx::raw_sql(
        "CREATE TABLE History (DateTime TEXT, TagName TEXT, TagVal REAL, TagQuality TEXT);
         CREATE TABLE TagDataBase (TagName TEXT);
         INSERT INTO TagDataBase VALUES ('T1'), ('T2'), ('T3'), ('Pressure');",
    )
    .execute(&mut conn)
    .await
    .unwrap();

    let mut tx = conn.begin().await.unwrap();
    for minute in 0..60 {
        let timestamp = format!("2024-01-01 00:{:02}:00", minute);
        for (tag, value) in [("T1", minute as f64), ("T2", 100.0 + minute as f64), ("T3", 0.0)] {
            sqlx::query("INSERT INTO History VALUES (?, ?, ?, 'Good')")
                .bind(&timestamp)
                .bind(tag)
                .bind(value)
                .execute(&mut *tx)
                .await
                .unwrap();
        }
    }
    // Hors de la plage demandée.
    sqlx::raw_sql(
        "INSERT INTO History VALUES ('2023-12-31 23:59:00', 'T1', -1.0, 'Good');
         INSERT INTO History VALUES ('2024-01-01 01:30:00', 'T2', -1.0, 'Good');",
    )
    .execute(&mut *tx)
    .await
    .unwrap();
    tx.commit().await.unwrap();
    conn.close().await.unwrap();

    DatabaseConfig {
        path: path.to_string_lossy().into_owned(),
        ..DatabaseConfig::default()
    }
}

fn service(database: DatabaseConfig) -> QueryService<SqliteConnectionManager> {
    let pool = Pool::new(SqliteConnectionManager::new(database), PoolConfig::default());
    let cache = Arc::new(QueryCache::new(&CacheConfig::default()));
    QueryService::new(pool, cache, QueryConfig::default())
}

fn request() -> QueryRequest {
    QueryRequest::new("2024-01-01T00:00:00", "2024-01-01T01:00:00").with_tags(["T1", "T2"])
}

#[tokio::test]
async fn query_returns_one_series_per_requested_tag() {
    let dir = TempDir::new().unwrap();
    let service = service(seed(&dir).await);

    let response = service.query(request()).await.unwrap();

    assert!(!response.cache_hit);
    assert_eq!(response.series.len(), 2);
    assert_eq!(response.series[0].tag_name, "T1");
    assert_eq!(response.series[1].tag_name, "T2");
    assert_eq!(response.total_raw, 120);
    assert_eq!(response.total_processed, 120);

    let t1 = &response.series[0];
    assert_eq!(t1.points.first().unwrap().timestamp_ms, 1_704_067_200_000);
    assert_eq!(t1.points.last().unwrap().value, 59.0);
}

#[tokio::test]
async fn repeated_query_is_served_from_cache() {
    let dir = TempDir::new().unwrap();
    let service = service(seed(&dir).await);

    let first = service.query(request()).await.unwrap();
    let second = service
        .query(QueryRequest::new("2024-01-01 00:00:00", "2024-01-01 01:00:00").with_tags(["T2", "T1"]))
        .await
        .unwrap();

    assert!(second.cache_hit);
    assert_eq!(second.series, first.series);
    assert_eq!(second.total_raw, first.total_raw);

    let stats = service.cache_stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert!((stats.hit_rate - 0.5).abs() < 1e-12);
    assert_eq!(stats.entry_count, 1);
    assert!(stats.estimated_memory_bytes > 0);
}

#[tokio::test]
async fn force_refresh_always_misses() {
    let dir = TempDir::new().unwrap();
    let service = service(seed(&dir).await);

    service.query(request()).await.unwrap();
    let refreshed = service.query(request().with_force_refresh(true)).await.unwrap();
    assert!(!refreshed.cache_hit);
    assert_eq!(refreshed.total_raw, 120);
    assert_eq!(service.cache_stats().entry_count, 1);
}

#[tokio::test]
async fn empty_tag_list_means_all_tags() {
    let dir = TempDir::new().unwrap();
    let service = service(seed(&dir).await);

    let response = service
        .query(QueryRequest::new("2024-01-01T00:00:00", "2024-01-01T01:00:00"))
        .await
        .unwrap();

    let names: Vec<&str> = response.series.iter().map(|s| s.tag_name.as_str()).collect();
    assert_eq!(names, vec!["T1", "T2", "T3"]);
    assert_eq!(response.total_raw, 180);
}

#[tokio::test]
async fn processing_pipeline_runs_on_fetched_rows() {
    let dir = TempDir::new().unwrap();
    let service = service(seed(&dir).await);

    let config = ProcessingConfig::new().with_outlier_removal().with_resample(600);
    let response = service
        .query(request().with_processing(config))
        .await
        .unwrap();

    assert_eq!(response.total_raw, 120);
    assert_eq!(response.total_processed, 12);
    let t1 = &response.series[0];
    // Premier intervalle de 10 minutes : moyenne de 0..=9.
    assert!((t1.points[0].value - 4.5).abs() < 1e-9);
}

#[tokio::test]
async fn legacy_response_flattens_series() {
    let dir = TempDir::new().unwrap();
    let service = service(seed(&dir).await);

    let response = service
        .query_legacy(LegacyQueryRequest {
            query: request(),
            offset: None,
            limit: Some(3),
        })
        .await
        .unwrap();

    assert_eq!(response.total, 120);
    assert_eq!(response.records.len(), 3);
    assert_eq!(response.records[0].tag_name, "T1");
    assert_eq!(response.records[1].tag_name, "T2");
    assert_eq!(response.records[1].tag_val, 100.0);
    assert_eq!(response.records[2].date_time, "2024-01-01T00:01:00.000");
    assert_eq!(response.records[0].tag_quality, "Good");
}

#[tokio::test]
async fn tag_search_matches_keyword() {
    let dir = TempDir::new().unwrap();
    let service = service(seed(&dir).await);

    let tags = service.search_tags(None, "T", None).await.unwrap();
    assert_eq!(tags, vec!["T1", "T2", "T3"]);

    let tags = service.search_tags(Some("default"), "ress", Some(10)).await.unwrap();
    assert_eq!(tags, vec!["Pressure"]);
}

#[tokio::test]
async fn tsql_profile_is_refused_by_the_sqlite_driver() {
    let dir = TempDir::new().unwrap();
    let service = service(seed(&dir).await);

    let err = service
        .query(request().with_profile("mssql"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Config(_)));

    let err = service.search_tags(Some("mssql"), "T", None).await.unwrap_err();
    assert!(matches!(err, AppError::Config(_)));

    assert!(service.pool_state().is_none());
    assert_eq!(service.cache_stats().misses, 0);
}

#[tokio::test]
async fn missing_table_is_a_query_error_and_pool_survives() {
    let dir = TempDir::new().unwrap();
    let service = service(seed(&dir).await);

    let err = service
        .query(request().with_table("Missing"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Query(_)));
    assert_eq!(service.cache_stats().entry_count, 0);

    let response = service.query(request()).await.unwrap();
    assert_eq!(response.series.len(), 2);

    let state = service.pool_state().unwrap();
    assert_eq!(state.active_connections, 0);
    assert!(state.total_connections <= state.max_size);
}

#[tokio::test]
async fn missing_database_reports_connection_error() {
    let dir = TempDir::new().unwrap();
    let service = service(DatabaseConfig {
        path: dir.path().join("absent.db").to_string_lossy().into_owned(),
        ..DatabaseConfig::default()
    });

    let err = service.query(request()).await.unwrap_err();
    assert!(matches!(err, AppError::Connection(_)));
    assert!(service.pool_state().is_none());

    let probe = service.test_connection().await;
    assert!(!probe.success);
}

#[tokio::test]
async fn concurrent_queries_share_the_bounded_pool() {
    let dir = TempDir::new().unwrap();
    let service = Arc::new(service(seed(&dir).await));

    let mut handles = Vec::new();
    for minute in 0..8 {
        let service = Arc::clone(&service);
        handles.push(tokio::spawn(async move {
            let start = format!("2024-01-01T00:{:02}:00", minute);
            service
                .query(QueryRequest::new(start, "2024-01-01T01:00:00").with_tags(["T1"]))
                .await
        }));
    }

    for handle in handles {
        let response = handle.await.unwrap().unwrap();
        assert_eq!(response.series.len(), 1);
    }

    let state = service.pool_state().unwrap();
    assert!(state.total_connections <= state.max_size);
    assert_eq!(state.active_connections, 0);
    assert_eq!(service.cache_stats().entry_count, 8);
}
