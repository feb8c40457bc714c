use crate::config::ServicesConfig;
use crate::state::ServiceStat;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

const PLACEHOLDER: &str = "{service}";
const UNKNOWN: &str = "unknown";
const STATUS_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn collect_services(cfg: &ServicesConfig) -> Vec<ServiceStat> {
    let mut out = Vec::with_capacity(cfg.list.len());
    for service in &cfg.list {
        let (is_active, is_enabled) = tokio::join!(
            query_status(&cfg.is_active, service),
            query_status(&cfg.is_enabled, service),
        );
        out.push(ServiceStat {
            name: service.clone(),
            is_active,
            is_enabled,
        });
    }
    debug!(services = out.len(), "service states collected");
    out
}

// The exit code is ignored: `systemctl is-active` exits non-zero for
// "inactive" and "failed", which are still answers.
async fn query_status(template: &[String], service: &str) -> String {
    let argv: Vec<String> = template
        .iter()
        .map(|token| token.replace(PLACEHOLDER, service))
        .collect();
    let Some((program, args)) = argv.split_first() else {
        return UNKNOWN.to_string();
    };

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(STATUS_TIMEOUT, output).await {
        Ok(Ok(out)) => first_word(&out.stdout),
        Ok(Err(err)) => {
            debug!(service = %service, program = %program, error = %err, "service status command failed");
            UNKNOWN.to_string()
        }
        Err(_) => {
            warn!(service = %service, program = %program, "service status command timed out");
            UNKNOWN.to_string()
        }
    }
}

fn first_word(stdout: &[u8]) -> String {
    String::from_utf8_lossy(stdout)
        .split_whitespace()
        .next()
        .unwrap_or(UNKNOWN)
        .to_string()
}
