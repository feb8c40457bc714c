pub mod executor;
pub mod registry;
pub mod store;

use crate::config::{ConfigError, JobsConfig};
use crate::metrics::Metrics;
use executor::{ActiveRun, Executor, JobError, RunOutcome};
use registry::{Job, JobRegistry};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use store::{JobRunState, MarkerStore, StoreError};
use tokio::sync::watch;
use tracing::{debug, info};

pub struct JobRunner {
    registry: Arc<JobRegistry>,
    executor: Executor,
    reject_unknown: bool,
}

impl JobRunner {
    pub fn new(registry: JobRegistry, executor: Executor, reject_unknown: bool) -> Self {
        Self {
            registry: Arc::new(registry),
            executor,
            reject_unknown,
        }
    }

    pub fn from_config(
        cfg: &JobsConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, ConfigError> {
        let registry = JobRegistry::from_config(cfg)?;
        let executor = Executor::new(
            MarkerStore::new(&cfg.dir),
            cfg.shell.clone(),
            cfg.max_concurrent,
            shutdown,
        );
        Ok(Self::new(registry, executor, cfg.reject_unknown))
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.executor = self.executor.with_metrics(metrics);
        self
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn store(&self) -> &MarkerStore {
        self.executor.store()
    }

    pub fn resolve(&self, name: &str) -> Result<Job, JobError> {
        match self.registry.lookup(name) {
            Some(job) => Ok(job.clone()),
            None if self.reject_unknown => {
                Err(self.executor.rejected(JobError::UnknownJob(name.to_string())))
            }
            None => {
                debug!(job = %name, "unknown job, running empty command");
                Ok(Job {
                    name: name.to_string(),
                    command: Vec::new(),
                    timeout: None,
                })
            }
        }
    }

    pub async fn exec(&self, name: &str) -> Result<RunOutcome, JobError> {
        let job = self.resolve(name)?;
        self.run(name, &job).await
    }

    pub async fn run(&self, name: &str, job: &Job) -> Result<RunOutcome, JobError> {
        self.executor.run(name, job).await
    }

    pub async fn start_by_name(&self, name: &str) -> Result<ActiveRun, JobError> {
        let job = self.resolve(name)?;
        self.executor.start(name, &job).await
    }

    pub async fn stdout(&self, name: &str) -> String {
        match self.store().read(name).await {
            Ok(content) => content,
            Err(err) => {
                debug!(job = %name, error = %err, "job output unavailable");
                String::new()
            }
        }
    }

    pub async fn status(&self, name: &str) -> Result<JobRunState, StoreError> {
        self.store().state(name).await
    }

    pub fn list_jobs(&self) -> Value {
        self.registry.run_list_json()
    }

    pub async fn cleanup(&self) -> usize {
        let removed = self.store().clear_all().await;
        info!(
            dir = %self.store().dir().display(),
            removed,
            "job markers cleaned up"
        );
        removed
    }

    pub async fn wait_idle(&self, grace: Duration) -> bool {
        self.executor.wait_idle(grace).await
    }
}
