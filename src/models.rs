use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// One row of the history table, as produced by a schema profile's row mapper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub timestamp: NaiveDateTime,
    pub tag_name: String,
    pub value: f64,
    pub quality: String,
}

impl HistoryRecord {
    pub fn new(timestamp: NaiveDateTime, tag_name: String, value: f64, quality: String) -> Self {
        Self {
            timestamp,
            tag_name,
            value,
            quality,
        }
    }

    // Les horodatages de la base sont naïfs : on les interprète comme UTC.
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp.and_utc().timestamp_millis()
    }
}

// Un point de série, sérialisé en `[timestamp_ms, value]` pour le front.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataPoint {
    pub timestamp_ms: i64,
    pub value: f64,
}

impl DataPoint {
    pub fn new(timestamp_ms: i64, value: f64) -> Self {
        Self {
            timestamp_ms,
            value,
        }
    }
}

impl Serialize for DataPoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (self.timestamp_ms, self.value).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for DataPoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (timestamp_ms, value) = <(i64, f64)>::deserialize(deserializer)?;
        Ok(Self::new(timestamp_ms, value))
    }
}

/// Chronologically ordered points of a single tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartSeriesData {
    pub tag_name: String,
    pub points: Vec<DataPoint>,
    /// Quality of the most recent raw row. Per-point quality does not survive processing,
    /// so every legacy record of this series reports this single value.
    #[serde(skip)]
    pub quality: String,
}

impl ChartSeriesData {
    pub fn new(tag_name: String, points: Vec<DataPoint>) -> Self {
        Self {
            tag_name,
            points,
            quality: String::new(),
        }
    }
}

// --- Configuration du pipeline de traitement ---

pub const OUTLIER_METHOD_3SIGMA: &str = "3sigma";
pub const RESAMPLE_METHOD_MEAN: &str = "mean";
pub const SMOOTHING_METHOD_MOVING_AVG: &str = "moving_avg";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutlierRemovalConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "OutlierRemovalConfig::default_method")]
    pub method: String,
}

impl OutlierRemovalConfig {
    fn default_method() -> String {
        OUTLIER_METHOD_3SIGMA.to_string()
    }
}

impl Default for OutlierRemovalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            method: Self::default_method(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResampleConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(
        rename = "interval",
        alias = "interval_seconds",
        default = "ResampleConfig::default_interval_seconds"
    )]
    pub interval_seconds: u32,
    #[serde(default = "ResampleConfig::default_method")]
    pub method: String,
}

impl ResampleConfig {
    fn default_interval_seconds() -> u32 {
        60
    }

    fn default_method() -> String {
        RESAMPLE_METHOD_MEAN.to_string()
    }
}

impl Default for ResampleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_seconds: Self::default_interval_seconds(),
            method: Self::default_method(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmoothingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "SmoothingConfig::default_method")]
    pub method: String,
    #[serde(default = "SmoothingConfig::default_window")]
    pub window: usize,
}

impl SmoothingConfig {
    fn default_method() -> String {
        SMOOTHING_METHOD_MOVING_AVG.to_string()
    }

    fn default_window() -> usize {
        5
    }
}

impl Default for SmoothingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            method: Self::default_method(),
            window: Self::default_window(),
        }
    }
}

/// Per-request processing switches. The default disables every stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingConfig {
    #[serde(default)]
    pub outlier_removal: OutlierRemovalConfig,
    #[serde(default)]
    pub resample: ResampleConfig,
    #[serde(default)]
    pub smoothing: SmoothingConfig,
}

impl ProcessingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_outlier_removal(mut self) -> Self {
        self.outlier_removal.enabled = true;
        self
    }

    pub fn with_resample(mut self, interval_seconds: u32) -> Self {
        self.resample.enabled = true;
        self.resample.interval_seconds = interval_seconds;
        self
    }

    pub fn with_smoothing(mut self, window: usize) -> Self {
        self.smoothing.enabled = true;
        self.smoothing.window = window;
        self
    }

    pub fn has_any_enabled(&self) -> bool {
        self.outlier_removal.enabled || self.resample.enabled || self.smoothing.enabled
    }

    // Les paramètres d'une étape désactivée n'ont aucun effet : on les remet à zéro
    // pour qu'ils ne fragmentent pas le cache.
    pub fn normalized(&self) -> Self {
        let mut normalized = self.clone();
        if !normalized.outlier_removal.enabled {
            normalized.outlier_removal = OutlierRemovalConfig::default();
        }
        if !normalized.resample.enabled {
            normalized.resample = ResampleConfig::default();
        }
        if !normalized.smoothing.enabled {
            normalized.smoothing = SmoothingConfig::default();
        }
        normalized
    }
}

// --- Requêtes et réponses ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    // Absent : le profil et la table configurés par défaut sont utilisés.
    #[serde(default)]
    pub profile_name: Option<String>,
    #[serde(default)]
    pub table: Option<String>,
    pub start_time: String,
    pub end_time: String,
    // Vide signifie « tous les tags ».
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub processing_config: Option<ProcessingConfig>,
    #[serde(default)]
    pub force_refresh: bool,
}

impl QueryRequest {
    pub fn new(start_time: impl Into<String>, end_time: impl Into<String>) -> Self {
        Self {
            profile_name: None,
            table: None,
            start_time: start_time.into(),
            end_time: end_time.into(),
            tags: Vec::new(),
            processing_config: None,
            force_refresh: false,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_profile(mut self, profile_name: impl Into<String>) -> Self {
        self.profile_name = Some(profile_name.into());
        self
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn with_processing(mut self, config: ProcessingConfig) -> Self {
        self.processing_config = Some(config);
        self
    }

    pub fn with_force_refresh(mut self, force_refresh: bool) -> Self {
        self.force_refresh = force_refresh;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub series: Vec<ChartSeriesData>,
    pub total_raw: usize,
    pub total_processed: usize,
    pub cache_hit: bool,
    pub query_time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyQueryRequest {
    #[serde(flatten)]
    pub query: QueryRequest,
    #[serde(default)]
    pub offset: Option<usize>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyRecord {
    pub date_time: String,
    pub tag_name: String,
    pub tag_val: f64,
    // Qualité de la série, pas celle de la ligne d'origine.
    pub tag_quality: String,
}

/// Flat, record-per-point response kept for older callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyQueryResponse {
    pub records: Vec<LegacyRecord>,
    pub total: usize,
}

impl LegacyQueryResponse {
    pub fn from_series(series: &[ChartSeriesData], offset: Option<usize>, limit: Option<usize>) -> Self {
        let mut records: Vec<(i64, LegacyRecord)> = series
            .iter()
            .flat_map(|s| {
                s.points.iter().map(move |p| {
                    (
                        p.timestamp_ms,
                        LegacyRecord {
                            date_time: format_timestamp_ms(p.timestamp_ms),
                            tag_name: s.tag_name.clone(),
                            tag_val: p.value,
                            tag_quality: s.quality.clone(),
                        },
                    )
                })
            })
            .collect();

        // Ordre chronologique, puis par tag pour un résultat stable.
        records.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.tag_name.cmp(&b.1.tag_name)));

        let total = records.len();
        let records = records
            .into_iter()
            .map(|(_, record)| record)
            .skip(offset.unwrap_or(0))
            .take(limit.unwrap_or(usize::MAX))
            .collect();

        Self { records, total }
    }
}

pub fn format_timestamp_ms(timestamp_ms: i64) -> String {
    DateTime::from_timestamp_millis(timestamp_ms)
        .map(|dt| dt.naive_utc().format("%Y-%m-%dT%H:%M:%S%.3f").to_string())
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionTestResult {
    pub success: bool,
    pub message: String,
}

impl ConnectionTestResult {
    pub fn success() -> Self {
        Self {
            success: true,
            message: "connection succeeded".to_string(),
        }
    }

    pub fn failure(message: String) -> Self {
        Self {
            success: false,
            message,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: f64,
}

#[derive(Debug, Deserialize)]
pub struct TagSearchParams {
    #[serde(default)]
    pub keyword: String,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub profile: Option<String>,
}
