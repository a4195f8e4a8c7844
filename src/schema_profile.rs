//! Vendor schema profiles.
//!
//! A profile turns the canonical query (table, time range, tag filter) into one vendor's
//! SQL dialect and maps result rows back into [`HistoryRecord`]s. Profiles are stateless and
//! looked up by name in a closed registry; adding a vendor means adding a registry entry.

use crate::error::{AppError, AppResult};
use crate::models::HistoryRecord;
use chrono::NaiveDateTime;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// SQL dialect a profile writes and a driver executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    Sqlite,
    TransactSql,
}

impl fmt::Display for SqlDialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlDialect::Sqlite => write!(f, "sqlite"),
            SqlDialect::TransactSql => write!(f, "t-sql"),
        }
    }
}

// Échappe un identifiant entre crochets en doublant le crochet fermant.
pub fn quote_identifier(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

// Échappe une valeur littérale en doublant les apostrophes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

pub trait SchemaProfile: Send + Sync {
    fn name(&self) -> &str;

    fn dialect(&self) -> SqlDialect;

    /// SQL returning up to `limit` distinct tag names matching one bound LIKE pattern.
    fn tag_search_sql(&self, limit: usize) -> String;

    /// SQL selecting timestamp, tag, value and quality for `[start_time, end_time]`.
    /// `tag_filter` is a fragment produced by [`SchemaProfile::build_tag_filter`].
    fn history_query_sql(&self, table: &str, start_time: &str, end_time: &str, tag_filter: &str) -> String;

    fn map_row(&self, row: &SqliteRow) -> AppResult<HistoryRecord> {
        let timestamp: NaiveDateTime = row
            .try_get(self.datetime_column_name())
            .map_err(|e| mapping_error(self.datetime_column_name(), e))?;
        let tag_name: String = row
            .try_get(self.tag_column_name())
            .map_err(|e| mapping_error(self.tag_column_name(), e))?;
        let value: f64 = row
            .try_get(self.value_column_name())
            .map_err(|e| mapping_error(self.value_column_name(), e))?;
        let quality: String = row
            .try_get(self.quality_column_name())
            .map_err(|e| mapping_error(self.quality_column_name(), e))?;

        Ok(HistoryRecord::new(
            timestamp,
            tag_name.trim().to_string(),
            value,
            quality.trim().to_string(),
        ))
    }

    // Fragment vide quand aucun tag n'est demandé : cela signifie « tous les tags ».
    fn build_tag_filter(&self, tags: Option<&[String]>) -> String {
        match tags {
            Some(tags) if !tags.is_empty() => {
                let list = tags
                    .iter()
                    .map(|t| quote_literal(t))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("AND {} IN ({})", quote_identifier(self.tag_column_name()), list)
            }
            _ => String::new(),
        }
    }

    fn tag_table_name(&self) -> &str {
        "TagDataBase"
    }

    fn tag_column_name(&self) -> &str {
        "TagName"
    }

    fn datetime_column_name(&self) -> &str {
        "DateTime"
    }

    fn value_column_name(&self) -> &str {
        "TagVal"
    }

    fn quality_column_name(&self) -> &str {
        "TagQuality"
    }
}

fn mapping_error(column: &str, err: sqlx::Error) -> AppError {
    AppError::Mapping(format!("column '{}': {}", column, err))
}

/// Controller historian layout, bracket-quoted identifiers and `LIMIT`/`?` syntax.
/// This is the dialect the bundled SQLite driver executes.
#[derive(Debug, Clone, Default)]
pub struct DefaultProfile;

impl SchemaProfile for DefaultProfile {
    fn name(&self) -> &str {
        "default"
    }

    fn dialect(&self) -> SqlDialect {
        SqlDialect::Sqlite
    }

    fn tag_search_sql(&self, limit: usize) -> String {
        let tag = quote_identifier(self.tag_column_name());
        format!(
            "SELECT DISTINCT {tag} FROM {table} WHERE {tag} LIKE ? ORDER BY {tag} LIMIT {limit}",
            tag = tag,
            table = quote_identifier(self.tag_table_name()),
            limit = limit,
        )
    }

    fn history_query_sql(&self, table: &str, start_time: &str, end_time: &str, tag_filter: &str) -> String {
        let datetime = quote_identifier(self.datetime_column_name());
        format!(
            "SELECT {datetime}, {tag}, {value}, {quality} FROM {table} \
             WHERE {datetime} BETWEEN {start} AND {end} {filter} ORDER BY {datetime}",
            datetime = datetime,
            tag = quote_identifier(self.tag_column_name()),
            value = quote_identifier(self.value_column_name()),
            quality = quote_identifier(self.quality_column_name()),
            table = quote_identifier(table),
            start = quote_literal(start_time),
            end = quote_literal(end_time),
            filter = tag_filter,
        )
    }
}

/// Same layout as [`DefaultProfile`] written in T-SQL: `TOP n`, `WITH (NOLOCK)` and `@P1`.
/// Only runs on a driver whose dialect is [`SqlDialect::TransactSql`].
#[derive(Debug, Clone, Default)]
pub struct MssqlProfile;

impl SchemaProfile for MssqlProfile {
    fn name(&self) -> &str {
        "mssql"
    }

    fn dialect(&self) -> SqlDialect {
        SqlDialect::TransactSql
    }

    fn tag_search_sql(&self, limit: usize) -> String {
        let tag = quote_identifier(self.tag_column_name());
        format!(
            "SELECT DISTINCT TOP {limit} {tag} FROM {table} WHERE {tag} LIKE @P1 ORDER BY {tag}",
            limit = limit,
            tag = tag,
            table = quote_identifier(self.tag_table_name()),
        )
    }

    fn history_query_sql(&self, table: &str, start_time: &str, end_time: &str, tag_filter: &str) -> String {
        // NOLOCK : lecture sans attendre les verrous d'écriture de l'historian.
        let datetime = quote_identifier(self.datetime_column_name());
        format!(
            "SELECT {datetime}, {tag}, {value}, {quality} FROM {table} WITH (NOLOCK) \
             WHERE {datetime} BETWEEN {start} AND {end} {filter} ORDER BY {datetime}",
            datetime = datetime,
            tag = quote_identifier(self.tag_column_name()),
            value = quote_identifier(self.value_column_name()),
            quality = quote_identifier(self.quality_column_name()),
            table = quote_identifier(table),
            start = quote_literal(start_time),
            end = quote_literal(end_time),
            filter = tag_filter,
        )
    }
}

type ProfileFactory = fn() -> Arc<dyn SchemaProfile>;

fn new_default_profile() -> Arc<dyn SchemaProfile> {
    Arc::new(DefaultProfile)
}

fn new_mssql_profile() -> Arc<dyn SchemaProfile> {
    Arc::new(MssqlProfile)
}

// Registre statique et fermé des profils connus.
const REGISTRY: &[(&str, ProfileFactory)] = &[
    ("default", new_default_profile),
    ("mssql", new_mssql_profile),
];

pub struct ProfileRegistry;

impl ProfileRegistry {
    pub fn get(name: &str) -> AppResult<Arc<dyn SchemaProfile>> {
        REGISTRY
            .iter()
            .find(|(registered, _)| *registered == name)
            .map(|(_, factory)| factory())
            .ok_or_else(|| {
                AppError::Config(format!(
                    "unknown schema profile '{}', available profiles: {}",
                    name,
                    Self::available_profiles().join(", ")
                ))
            })
    }

    pub fn default_profile() -> Arc<dyn SchemaProfile> {
        new_default_profile()
    }

    /// Resolves `name`, falling back to the default profile instead of failing the request.
    pub fn resolve_or_default(name: &str) -> Arc<dyn SchemaProfile> {
        Self::get(name).unwrap_or_else(|e| {
            warn!(profile = %name, error = %e, "Unknown schema profile, using the default profile");
            Self::default_profile()
        })
    }

    pub fn available_profiles() -> Vec<&'static str> {
        REGISTRY.iter().map(|(name, _)| *name).collect()
    }
}
