use crate::config::{parse_timeout, ConfigError, JobsConfig};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub name: String,
    pub command: Vec<String>,
    pub timeout: Option<Duration>,
}

impl Job {
    pub fn command_line(&self) -> String {
        self.command.join(" ")
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobRegistry {
    jobs: BTreeMap<String, Job>,
}

impl JobRegistry {
    pub fn from_config(cfg: &JobsConfig) -> Result<Self, ConfigError> {
        let default_timeout = cfg
            .default_timeout
            .as_deref()
            .map(|raw| parse_timeout("jobs.default_timeout", raw))
            .transpose()?;

        let mut jobs = Vec::with_capacity(cfg.run.len());
        for (name, entry) in &cfg.run {
            let timeout = match entry.timeout() {
                Some(raw) => Some(parse_timeout(&format!("jobs.run.{name}.timeout"), raw)?),
                None => default_timeout,
            };
            jobs.push(Job {
                name: name.clone(),
                command: entry.command().to_vec(),
                timeout,
            });
        }
        Ok(Self::from_jobs(jobs))
    }

    pub fn from_jobs(jobs: impl IntoIterator<Item = Job>) -> Self {
        Self {
            jobs: jobs.into_iter().map(|j| (j.name.clone(), j)).collect(),
        }
    }

    pub fn lookup(&self, name: &str) -> Option<&Job> {
        self.jobs.get(name)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn run_list_json(&self) -> Value {
        if self.is_empty() {
            warn!("no jobs configured under jobs.run");
        }
        let list: Map<String, Value> = self
            .jobs()
            .map(|job| (job.name.clone(), Value::String(job.command_line())))
            .collect();
        json!({ "run_list": list })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JobEntry;

    fn jobs_cfg() -> JobsConfig {
        let mut cfg = JobsConfig {
            default_timeout: Some("10m".to_string()),
            ..JobsConfig::default()
        };
        cfg.run.insert(
            "get_storages".to_string(),
            JobEntry::Command(vec!["df".into(), "-h".into()]),
        );
        cfg.run.insert(
            "ping".to_string(),
            JobEntry::Detailed {
                command: vec!["ping".into(), "-c".into(), "3".into(), "localhost".into()],
                timeout: Some("30s".to_string()),
            },
        );
        cfg
    }

    #[test]
    fn lookup_returns_configured_command() {
        let registry = JobRegistry::from_config(&jobs_cfg()).unwrap();
        let job = registry.lookup("get_storages").expect("задача есть");
        assert_eq!(job.command, vec!["df".to_string(), "-h".to_string()]);
        assert_eq!(job.command_line(), "df -h");
        assert!(registry.lookup("missing").is_none());
    }

    #[test]
    fn per_job_timeout_overrides_default() {
        let registry = JobRegistry::from_config(&jobs_cfg()).unwrap();
        assert_eq!(
            registry.lookup("ping").unwrap().timeout,
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            registry.lookup("get_storages").unwrap().timeout,
            Some(Duration::from_secs(600))
        );
    }

    #[test]
    fn run_list_json_lists_every_job() {
        let registry = JobRegistry::from_config(&jobs_cfg()).unwrap();
        let value = registry.run_list_json();
        assert_eq!(value["run_list"]["get_storages"], "df -h");
        assert_eq!(value["run_list"]["ping"], "ping -c 3 localhost");
        assert_eq!(value["run_list"].as_object().unwrap().len(), 2);
    }

    #[test]
    fn run_list_json_without_jobs_is_empty_object() {
        let registry = JobRegistry::default();
        let value = registry.run_list_json();
        assert_eq!(value, json!({ "run_list": {} }));
    }
}
