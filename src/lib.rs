pub mod app_state;
pub mod cache;
pub mod config;
pub mod database;
pub mod error;
pub mod handlers;
pub mod models;
pub mod pool;
pub mod processing;
pub mod schema_profile;
pub mod service;
pub mod warmup;

pub use app_state::AppState;
pub use error::{AppError, AppResult};
pub use handlers::router;
