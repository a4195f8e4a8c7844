//! Query orchestrator.
//!
//! Answers one query end to end: fingerprint, cache lookup, pooled fetch, per-tag
//! processing, cache store. The pool and the cache are shared handles built once at
//! startup and passed in.

use crate::cache::{CacheEntry, CacheStats, QueryCache, QueryFingerprint};
use crate::config::QueryConfig;
use crate::database::HistorySource;
use crate::error::{AppError, AppResult};
use crate::models::{
    ChartSeriesData, ConnectionTestResult, DataPoint, HistoryRecord, LegacyQueryRequest,
    LegacyQueryResponse, ProcessingConfig, QueryRequest, QueryResponse,
};
use crate::pool::{self, ConnectionManager, Pool, PoolState};
use crate::processing;
use crate::schema_profile::{ProfileRegistry, SchemaProfile};
use chrono::{DateTime, NaiveDateTime};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MAX_SEARCH_LIMIT: usize = 1000;
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

// Formats acceptés pour les bornes de requête, hors RFC 3339.
const QUERY_TIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Parses a request time bound. RFC 3339 inputs with an offset are converted to UTC.
pub fn parse_query_time(value: &str) -> AppResult<NaiveDateTime> {
    let value = value.trim();
    for format in QUERY_TIME_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(parsed);
        }
    }
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.naive_utc())
        .map_err(|_| {
            AppError::Config(format!(
                "invalid time '{}', expected YYYY-MM-DDTHH:MM:SS or RFC 3339",
                value
            ))
        })
}

// Forme canonique utilisée dans le SQL et dans l'empreinte de cache.
fn canonical_time(value: &NaiveDateTime) -> String {
    value.format("%Y-%m-%d %H:%M:%S%.f").to_string()
}

// Requête validée, prête à être exécutée.
struct QueryPlan {
    profile: Arc<dyn SchemaProfile>,
    table: String,
    start_time: String,
    end_time: String,
    origin_ms: i64,
    tags: Vec<String>,
    processing: ProcessingConfig,
    fingerprint: QueryFingerprint,
}

pub struct QueryService<M: ConnectionManager> {
    pool: Pool<M>,
    cache: Arc<QueryCache>,
    config: QueryConfig,
}

impl<M> QueryService<M>
where
    M: ConnectionManager,
    M::Connection: HistorySource,
{
    pub fn new(pool: Pool<M>, cache: Arc<QueryCache>, config: QueryConfig) -> Self {
        Self {
            pool,
            cache,
            config,
        }
    }

    pub fn pool(&self) -> &Pool<M> {
        &self.pool
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    pub async fn query(&self, request: QueryRequest) -> AppResult<QueryResponse> {
        self.query_with_cancel(request, &CancellationToken::new()).await
    }

    /// Runs a query that stops as soon as `cancel` fires. A cancelled query drops its
    /// connection and never writes to the cache.
    pub async fn query_with_cancel(
        &self,
        request: QueryRequest,
        cancel: &CancellationToken,
    ) -> AppResult<QueryResponse> {
        let started = Instant::now();
        let plan = self.plan(&request)?;

        if request.force_refresh {
            debug!(fingerprint = %plan.fingerprint, "Forced refresh, bypassing cache lookup");
        } else if let Some(entry) = self.cache.get(&plan.fingerprint) {
            return Ok(QueryResponse {
                series: entry.series.clone(),
                total_raw: entry.total_raw,
                total_processed: entry.total_processed,
                cache_hit: true,
                query_time_ms: started.elapsed().as_millis() as u64,
            });
        }

        let records = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(fingerprint = %plan.fingerprint, "Query cancelled");
                return Err(AppError::Cancelled);
            }
            result = self.fetch(&plan) => result?,
        };

        let total_raw = records.len();
        let series = build_series(
            records,
            &plan.processing,
            plan.origin_ms,
            self.config.max_points_per_series,
        );
        let total_processed: usize = series.iter().map(|s| s.points.len()).sum();

        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }

        self.cache.put(CacheEntry::new(
            plan.fingerprint.clone(),
            series.clone(),
            total_raw,
            total_processed,
        ));

        let query_time_ms = started.elapsed().as_millis() as u64;
        info!(
            fingerprint = %plan.fingerprint,
            tag_count = series.len(),
            total_raw,
            total_processed,
            query_time_ms,
            "Query completed"
        );

        Ok(QueryResponse {
            series,
            total_raw,
            total_processed,
            cache_hit: false,
            query_time_ms,
        })
    }

    /// Flat record-per-point variant of [`QueryService::query`].
    pub async fn query_legacy(&self, request: LegacyQueryRequest) -> AppResult<LegacyQueryResponse> {
        let response = self.query(request.query).await?;
        Ok(LegacyQueryResponse::from_series(
            &response.series,
            request.offset,
            request.limit,
        ))
    }

    /// Computes the cache key of `request` without any I/O.
    pub fn fingerprint(&self, request: &QueryRequest) -> AppResult<QueryFingerprint> {
        self.plan(request).map(|plan| plan.fingerprint)
    }

    pub async fn search_tags(
        &self,
        profile_name: Option<&str>,
        keyword: &str,
        limit: Option<usize>,
    ) -> AppResult<Vec<String>> {
        let profile = self.resolve_profile(profile_name);
        self.check_dialect(profile.as_ref())?;
        let limit = limit
            .unwrap_or(self.config.search_limit)
            .clamp(1, MAX_SEARCH_LIMIT);
        let sql = profile.tag_search_sql(limit);
        let pattern = format!("%{}%", keyword.trim());
        debug!(sql = %sql, pattern = %pattern, "Searching tags");

        let mut conn = self.pool.acquire(self.pool.acquire_timeout()).await?;
        let result = match tokio::time::timeout(
            self.config.query_timeout(),
            conn.fetch_tags(&sql, &pattern),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(self.query_deadline_error()),
        };
        conn.release(is_healthy(&result));

        let mut tags = result?;
        tags.retain(|tag| !tag.is_empty());
        Ok(tags)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// `None` until the pool has opened its first connection.
    pub fn pool_state(&self) -> Option<PoolState> {
        self.pool.has_connected().then(|| self.pool.state())
    }

    pub async fn test_connection(&self) -> ConnectionTestResult {
        pool::probe(self.pool.manager(), PROBE_TIMEOUT).await
    }

    /// Checks out a pooled connection and pings it.
    pub async fn health_check(&self) -> AppResult<()> {
        let mut conn = self.pool.acquire(self.pool.acquire_timeout()).await?;
        let result = self.pool.manager().ping(&mut *conn).await;
        conn.release(is_healthy(&result));
        if let Err(e) = &result {
            warn!(error = %e, "Health check ping failed");
        }
        result
    }

    fn resolve_profile(&self, name: Option<&str>) -> Arc<dyn SchemaProfile> {
        let name = name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(self.config.default_profile.as_str());
        ProfileRegistry::resolve_or_default(name)
    }

    // Un profil ne s'exécute que sur un pilote du même dialecte.
    fn check_dialect(&self, profile: &dyn SchemaProfile) -> AppResult<()> {
        let driver = self.pool.manager().dialect();
        if profile.dialect() != driver {
            return Err(AppError::Config(format!(
                "schema profile '{}' writes {} SQL but the configured driver executes {}",
                profile.name(),
                profile.dialect(),
                driver
            )));
        }
        Ok(())
    }

    // Toute la validation a lieu ici, avant la moindre I/O.
    fn plan(&self, request: &QueryRequest) -> AppResult<QueryPlan> {
        let start = parse_query_time(&request.start_time)?;
        let end = parse_query_time(&request.end_time)?;
        if start > end {
            return Err(AppError::Config(format!(
                "start_time {} is after end_time {}",
                request.start_time, request.end_time
            )));
        }

        let table = request
            .table
            .as_deref()
            .map(str::trim)
            .unwrap_or(&self.config.default_table)
            .to_string();
        if table.is_empty() {
            return Err(AppError::Config("table name must not be empty".to_string()));
        }

        let processing = request.processing_config.clone().unwrap_or_default();
        processing::validate_config(&processing)?;

        let profile = self.resolve_profile(request.profile_name.as_deref());
        self.check_dialect(profile.as_ref())?;

        let mut tags: Vec<String> = request
            .tags
            .iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        tags.sort();
        tags.dedup();

        let start_time = canonical_time(&start);
        let end_time = canonical_time(&end);
        let fingerprint = QueryFingerprint::new(
            profile.name(),
            &table,
            &start_time,
            &end_time,
            &tags,
            &processing,
        );

        Ok(QueryPlan {
            profile,
            table,
            start_time,
            end_time,
            origin_ms: start.and_utc().timestamp_millis(),
            tags,
            processing,
            fingerprint,
        })
    }

    async fn fetch(&self, plan: &QueryPlan) -> AppResult<Vec<HistoryRecord>> {
        let mut conn = self.pool.acquire(self.pool.acquire_timeout()).await?;

        let filter = plan.profile.build_tag_filter(Some(&plan.tags));
        let sql = plan
            .profile
            .history_query_sql(&plan.table, &plan.start_time, &plan.end_time, &filter);
        debug!(sql = %sql, profile = plan.profile.name(), "Executing history query");

        let result = match tokio::time::timeout(
            self.config.query_timeout(),
            conn.fetch_history(&sql, plan.profile.as_ref()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(self.query_deadline_error()),
        };

        // Seules les erreurs de connexion ferment la connexion.
        conn.release(is_healthy(&result));
        if let Err(e) = &result {
            warn!(fingerprint = %plan.fingerprint, error = %e, "History query failed");
        }
        result
    }

    fn query_deadline_error(&self) -> AppError {
        AppError::Timeout(format!(
            "query exceeded its {:?} deadline",
            self.config.query_timeout()
        ))
    }
}

fn is_healthy<T>(result: &AppResult<T>) -> bool {
    match result {
        Ok(_) => true,
        Err(e) => !e.is_connection_error(),
    }
}

/// Groups records by tag, in tag-name order, and runs the pipeline on each series.
pub fn build_series(
    records: Vec<HistoryRecord>,
    config: &ProcessingConfig,
    origin_ms: i64,
    max_points: usize,
) -> Vec<ChartSeriesData> {
    let mut grouped: BTreeMap<String, Vec<HistoryRecord>> = BTreeMap::new();
    for record in records {
        grouped.entry(record.tag_name.clone()).or_default().push(record);
    }

    grouped
        .into_iter()
        .map(|(tag_name, mut records)| {
            records.sort_by_key(|r| r.timestamp);
            let quality = records.last().map(|r| r.quality.clone()).unwrap_or_default();
            let points: Vec<DataPoint> = records
                .iter()
                .map(|r| DataPoint::new(r.timestamp_ms(), r.value))
                .collect();

            let mut series = ChartSeriesData::new(
                tag_name,
                processing::process_series(points, config, origin_ms, max_points),
            );
            series.quality = quality;
            series
        })
        .collect()
}
