use crate::cache::QueryCache;
use crate::config::AppConfig;
use crate::database::SqliteConnectionManager;
use crate::pool::Pool;
use crate::service::QueryService;
use std::sync::Arc;

pub type HistoryService = QueryService<SqliteConnectionManager>;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<HistoryService>,
}

impl AppState {
    // Le pool et le cache sont créés une seule fois ici puis partagés par tous les handlers.
    pub fn new(config: &AppConfig) -> Self {
        let manager = SqliteConnectionManager::new(config.database.clone());
        let pool = Pool::new(manager, config.pool.clone());
        let cache = Arc::new(QueryCache::new(&config.cache));
        Self {
            service: Arc::new(QueryService::new(pool, cache, config.query.clone())),
        }
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        self.service.cache()
    }
}
