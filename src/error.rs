// Taxonomie des erreurs du coeur de requêtes.
// Chaque variante correspond à une étape précise : configuration (avant toute I/O),
// connexion (réseau, authentification, délai), requête (SQL rejeté) et mapping de lignes.
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::ser::SerializeStruct;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum AppError {
    // Profil inconnu, configuration de traitement invalide, paramètres mal formés.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("connection error: {0}")]
    Connection(String),

    // Sous-type de `Connection` : pool épuisé ou échéance de requête dépassée.
    #[error("timed out: {0}")]
    Timeout(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("row mapping error: {0}")]
    Mapping(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    // Nom court et stable, exposé aux appelants dans la réponse structurée.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Config(_) => "config",
            AppError::Connection(_) => "connection",
            AppError::Timeout(_) => "timeout",
            AppError::Query(_) => "query",
            AppError::Mapping(_) => "mapping",
            AppError::Cancelled => "cancelled",
            AppError::Internal(_) => "internal",
        }
    }

    // Vrai quand la connexion qui a produit l'erreur ne doit pas retourner au pool.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, AppError::Connection(_) | AppError::Timeout(_))
    }

    pub fn is_retryable(&self) -> bool {
        self.is_connection_error()
    }

    /// Builds a connection error with a hint for the failures operators hit most often.
    pub fn connection_with_hint(err: &str, database: &str) -> Self {
        let lowered = err.to_lowercase();
        if lowered.contains("unable to open database file") || lowered.contains("no such file") {
            AppError::Connection(format!(
                "database '{}' does not exist or is not readable: {}",
                database, err
            ))
        } else if lowered.contains("permission denied") || lowered.contains("readonly") {
            AppError::Connection(format!(
                "permission denied while opening '{}': {}",
                database, err
            ))
        } else if lowered.contains("database is locked") {
            AppError::Connection(format!(
                "database '{}' is locked by another process: {}",
                database, err
            ))
        } else {
            AppError::Connection(format!("failed to connect to '{}': {}", database, err))
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Config(_) => StatusCode::BAD_REQUEST,
            AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::Connection(_) | AppError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Query(_) | AppError::Mapping(_) => StatusCode::BAD_GATEWAY,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

// Classement des erreurs sqlx dans la taxonomie.
impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => AppError::Timeout(err.to_string()),
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Configuration(_) => AppError::Connection(err.to_string()),
            sqlx::Error::Database(_) => AppError::Query(err.to_string()),
            sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::ColumnIndexOutOfBounds { .. }
            | sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::Decode(_)
            | sqlx::Error::TypeNotFound { .. }
            | sqlx::Error::RowNotFound => AppError::Mapping(err.to_string()),
            other => AppError::Query(other.to_string()),
        }
    }
}

// Toute erreur se résout en un résultat structuré `success = false` plutôt qu'en crash.
impl serde::Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("AppError", 4)?;
        state.serialize_field("success", &false)?;
        state.serialize_field("kind", self.kind())?;
        state.serialize_field("message", &self.to_string())?;
        state.serialize_field("retryable", &self.is_retryable())?;
        state.end()
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self)).into_response()
    }
}
