// Préchauffage du cache : exécute une liste de requêtes connues à l'avance
// pour que les premiers appels des utilisateurs tombent sur le cache.
use crate::database::HistorySource;
use crate::models::QueryRequest;
use crate::pool::ConnectionManager;
use crate::service::QueryService;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarmupTask {
    pub request: QueryRequest,
    #[serde(default)]
    pub description: String,
}

impl WarmupTask {
    pub fn new(request: QueryRequest, description: impl Into<String>) -> Self {
        Self {
            request,
            description: description.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarmupProgress {
    pub total: usize,
    pub completed: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub current_task: Option<String>,
    pub is_done: bool,
}

impl WarmupProgress {
    fn new(total: usize) -> Self {
        Self {
            total,
            completed: 0,
            success_count: 0,
            failure_count: 0,
            current_task: None,
            is_done: total == 0,
        }
    }

    fn record(&mut self, description: &str, success: bool) {
        self.completed += 1;
        if success {
            self.success_count += 1;
        } else {
            self.failure_count += 1;
        }
        if self.completed >= self.total {
            self.is_done = true;
            self.current_task = None;
        } else {
            self.current_task = Some(description.to_string());
        }
    }

    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            self.completed as f64 / self.total as f64 * 100.0
        }
    }
}

impl<M> QueryService<M>
where
    M: ConnectionManager,
    M::Connection: HistorySource,
{
    /// Runs `tasks` one after the other, skipping those already cached.
    ///
    /// Failures are counted in the returned progress, never propagated. When `progress_tx`
    /// is given, a snapshot is sent after every task; a closed receiver is ignored.
    pub async fn warmup(
        &self,
        tasks: Vec<WarmupTask>,
        progress_tx: Option<mpsc::Sender<WarmupProgress>>,
    ) -> WarmupProgress {
        let mut progress = WarmupProgress::new(tasks.len());
        info!(tasks = tasks.len(), "Starting cache warmup");

        for task in tasks {
            let description = if task.description.is_empty() {
                format!("{} -> {}", task.request.start_time, task.request.end_time)
            } else {
                task.description.clone()
            };

            let already_cached = self
                .fingerprint(&task.request)
                .map(|fingerprint| self.cache().contains(&fingerprint))
                .unwrap_or(false);

            let success = if already_cached && !task.request.force_refresh {
                debug!(task = %description, "Warmup task already cached, skipping");
                true
            } else {
                match self.query(task.request).await {
                    Ok(response) => {
                        debug!(task = %description, total_raw = response.total_raw, "Warmup task done");
                        true
                    }
                    Err(e) => {
                        warn!(task = %description, error = %e, "Warmup task failed");
                        false
                    }
                }
            };

            progress.record(&description, success);
            if let Some(tx) = &progress_tx {
                let _ = tx.send(progress.clone()).await;
            }
        }

        info!(
            success = progress.success_count,
            failed = progress.failure_count,
            "Cache warmup finished"
        );
        progress
    }
}
