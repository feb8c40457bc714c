use crate::jobs::store::is_valid_job_name;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub listen: String,
    pub interval_secs: u64,
    #[serde(default = "default_top_processes")]
    pub top_processes: usize,
    #[serde(default)]
    pub services: ServicesConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServicesConfig {
    #[serde(default)]
    pub list: Vec<String>,
    #[serde(default = "default_service_is_active")]
    pub is_active: Vec<String>,
    #[serde(default = "default_service_is_enabled")]
    pub is_enabled: Vec<String>,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            list: Vec::new(),
            is_active: default_service_is_active(),
            is_enabled: default_service_is_enabled(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobsConfig {
    #[serde(default = "default_jobs_dir")]
    pub dir: String,
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default)]
    pub default_timeout: Option<String>,
    #[serde(default = "default_reject_unknown")]
    pub reject_unknown: bool,
    #[serde(default)]
    pub run: BTreeMap<String, JobEntry>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum JobEntry {
    Command(Vec<String>),
    Detailed {
        command: Vec<String>,
        #[serde(default)]
        timeout: Option<String>,
    },
}

impl JobEntry {
    pub fn command(&self) -> &[String] {
        match self {
            JobEntry::Command(command) => command,
            JobEntry::Detailed { command, .. } => command,
        }
    }

    pub fn timeout(&self) -> Option<&str> {
        match self {
            JobEntry::Command(_) => None,
            JobEntry::Detailed { timeout, .. } => timeout.as_deref(),
        }
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            dir: default_jobs_dir(),
            shell: default_shell(),
            max_concurrent: default_max_concurrent(),
            default_timeout: None,
            reject_unknown: default_reject_unknown(),
            run: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("не удалось прочитать файл конфигурации {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("не удалось разобрать YAML в {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("ошибка валидации конфигурации: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Validation(
                "поле listen обязательно".to_string(),
            ));
        }
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "поле listen должно быть корректным адресом host:port".to_string(),
            ));
        }
        if self.interval_secs < 1 {
            return Err(ConfigError::Validation(
                "interval_secs должно быть >= 1".to_string(),
            ));
        }

        validate_services(&self.services)?;
        validate_jobs(&self.jobs)?;

        Ok(())
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

pub fn parse_timeout(field: &str, raw: &str) -> Result<Duration, ConfigError> {
    let value = humantime::parse_duration(raw.trim()).map_err(|err| {
        ConfigError::Validation(format!("{field}: некорректная длительность '{raw}': {err}"))
    })?;
    if value.is_zero() {
        return Err(ConfigError::Validation(format!(
            "{field} должно быть > 0"
        )));
    }
    Ok(value)
}

fn validate_services(cfg: &ServicesConfig) -> Result<(), ConfigError> {
    if cfg.list.is_empty() {
        return Ok(());
    }
    if cfg.is_active.is_empty() || cfg.is_enabled.is_empty() {
        return Err(ConfigError::Validation(
            "services.is_active и services.is_enabled не должны быть пустыми".to_string(),
        ));
    }
    if cfg.list.iter().any(|name| name.trim().is_empty()) {
        return Err(ConfigError::Validation(
            "services.list не должен содержать пустых имён".to_string(),
        ));
    }
    Ok(())
}

fn validate_jobs(cfg: &JobsConfig) -> Result<(), ConfigError> {
    if cfg.dir.trim().is_empty() {
        return Err(ConfigError::Validation(
            "jobs.dir не должен быть пустым".to_string(),
        ));
    }
    if cfg.shell.trim().is_empty() {
        return Err(ConfigError::Validation(
            "jobs.shell не должен быть пустым".to_string(),
        ));
    }
    if cfg.max_concurrent < 1 {
        return Err(ConfigError::Validation(
            "jobs.max_concurrent должно быть >= 1".to_string(),
        ));
    }
    if let Some(raw) = &cfg.default_timeout {
        parse_timeout("jobs.default_timeout", raw)?;
    }

    for (name, entry) in &cfg.run {
        if !is_valid_job_name(name) {
            return Err(ConfigError::Validation(format!(
                "jobs.run: недопустимое имя задачи '{name}' (разрешены буквы, цифры, '_', '-', '.')"
            )));
        }
        if let Some(raw) = entry.timeout() {
            parse_timeout(&format!("jobs.run.{name}.timeout"), raw)?;
        }
    }
    Ok(())
}

const fn default_top_processes() -> usize {
    10
}

fn default_jobs_dir() -> String {
    "./cmd/".to_string()
}

fn default_shell() -> String {
    "bash".to_string()
}

fn default_max_concurrent() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

const fn default_reject_unknown() -> bool {
    true
}

fn default_service_is_active() -> Vec<String> {
    ["systemctl", "is-active", "{service}"]
        .map(String::from)
        .to_vec()
}

fn default_service_is_enabled() -> Vec<String> {
    ["systemctl", "is-enabled", "{service}"]
        .map(String::from)
        .to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            listen: "127.0.0.1:7070".to_string(),
            interval_secs: 5,
            top_processes: 10,
            services: ServicesConfig::default(),
            jobs: JobsConfig::default(),
        }
    }

    #[test]
    fn example_config_is_valid() {
        let cfg: Config =
            serde_yaml::from_str(Config::example_yaml()).expect("пример должен разбираться");
        cfg.validate().expect("пример должен проходить валидацию");
        assert!(cfg.jobs.run.contains_key("get_storages"));
        assert!(!cfg.services.list.is_empty());
    }

    #[test]
    fn services_default_to_systemctl() {
        let cfg: Config =
            serde_yaml::from_str("listen: \"127.0.0.1:7070\"\ninterval_secs: 5\n").expect("yaml");
        assert!(cfg.services.list.is_empty());
        assert_eq!(cfg.services.is_active, ["systemctl", "is-active", "{service}"]);
        assert_eq!(cfg.services.is_enabled, ["systemctl", "is-enabled", "{service}"]);
    }

    #[test]
    fn rejects_empty_service_commands_and_names() {
        let mut cfg = valid_config();
        cfg.services.list = vec!["ssh".to_string()];
        cfg.validate().expect("ssh с командами по умолчанию");

        cfg.services.is_enabled.clear();
        assert!(cfg.validate().is_err());

        cfg.services = ServicesConfig {
            list: vec!["  ".to_string()],
            ..ServicesConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn job_entries_accept_list_and_table_forms() {
        let yaml = r#"
listen: "127.0.0.1:7070"
interval_secs: 5
jobs:
  run:
    uptime: ["uptime"]
    ping:
      command: ["ping", "-c", "3", "localhost"]
      timeout: 30s
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("yaml");
        cfg.validate().expect("валидная конфигурация");

        let uptime = &cfg.jobs.run["uptime"];
        assert_eq!(uptime.command(), ["uptime".to_string()]);
        assert_eq!(uptime.timeout(), None);

        let ping = &cfg.jobs.run["ping"];
        assert_eq!(ping.command().len(), 4);
        assert_eq!(ping.timeout(), Some("30s"));
        assert_eq!(cfg.jobs.dir, "./cmd/");
        assert!(cfg.jobs.reject_unknown);
    }

    #[test]
    fn rejects_job_names_that_escape_the_marker_dir() {
        let mut cfg = valid_config();
        cfg.jobs
            .run
            .insert("../etc".to_string(), JobEntry::Command(vec!["true".into()]));
        let err = cfg.validate().expect_err("имя с '/' недопустимо");
        assert!(err.to_string().contains("../etc"));
    }

    #[test]
    fn rejects_bad_and_zero_timeouts() {
        let mut cfg = valid_config();
        cfg.jobs.default_timeout = Some("soon".to_string());
        assert!(cfg.validate().is_err());

        cfg.jobs.default_timeout = Some("0s".to_string());
        assert!(cfg.validate().is_err());

        cfg.jobs.default_timeout = Some("15m".to_string());
        cfg.validate().expect("15m корректно");
    }

    #[test]
    fn rejects_zero_max_concurrent() {
        let mut cfg = valid_config();
        cfg.jobs.max_concurrent = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn parse_timeout_reads_humantime() {
        assert_eq!(
            parse_timeout("t", "1m 30s").expect("duration"),
            Duration::from_secs(90)
        );
    }
}
