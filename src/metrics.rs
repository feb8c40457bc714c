use crate::state::State;
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, GaugeVec, Registry, TextEncoder};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub agent_cpu_usage_percent: Gauge,
    pub agent_cpu_core_count: Gauge,
    pub agent_load_average: GaugeVec,
    pub agent_memory_used_bytes: Gauge,
    pub agent_memory_total_bytes: Gauge,
    pub agent_ram_usage_percent: Gauge,
    pub agent_swap_used_bytes: Gauge,
    pub agent_swap_total_bytes: Gauge,
    pub agent_disk_used_bytes: GaugeVec,
    pub agent_disk_total_bytes: GaugeVec,
    pub agent_disk_usage_percent: GaugeVec,
    pub agent_net_rx_bytes_total: GaugeVec,
    pub agent_net_tx_bytes_total: GaugeVec,
    pub agent_net_rx_bytes_per_sec: GaugeVec,
    pub agent_net_tx_bytes_per_sec: GaugeVec,
    pub agent_process_count: Gauge,
    pub agent_service_active: GaugeVec,
    pub agent_uptime_seconds: Gauge,
    pub agent_scrape_count_total: Counter,
    pub agent_last_collect_timestamp_seconds: Gauge,
    pub agent_jobs_started_total: CounterVec,
    pub agent_jobs_rejected_total: CounterVec,
    pub agent_jobs_finished_total: CounterVec,
    pub agent_jobs_running: Gauge,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let agent_cpu_usage_percent = Gauge::with_opts(opts!(
            "agent_cpu_usage_percent",
            "Average CPU usage across cores in percent (0..100)"
        ))?;
        let agent_cpu_core_count =
            Gauge::with_opts(opts!("agent_cpu_core_count", "Number of logical CPUs"))?;
        let agent_load_average = GaugeVec::new(
            opts!("agent_load_average", "System load average by period"),
            &["period"],
        )?;
        let agent_memory_used_bytes =
            Gauge::with_opts(opts!("agent_memory_used_bytes", "Used memory in bytes"))?;
        let agent_memory_total_bytes =
            Gauge::with_opts(opts!("agent_memory_total_bytes", "Total memory in bytes"))?;
        let agent_ram_usage_percent =
            Gauge::with_opts(opts!("agent_ram_usage_percent", "RAM usage in percent"))?;
        let agent_swap_used_bytes =
            Gauge::with_opts(opts!("agent_swap_used_bytes", "Used swap in bytes"))?;
        let agent_swap_total_bytes =
            Gauge::with_opts(opts!("agent_swap_total_bytes", "Total swap in bytes"))?;
        let agent_disk_used_bytes = GaugeVec::new(
            opts!("agent_disk_used_bytes", "Disk used bytes by mount"),
            &["mount"],
        )?;
        let agent_disk_total_bytes = GaugeVec::new(
            opts!("agent_disk_total_bytes", "Disk total bytes by mount"),
            &["mount"],
        )?;
        let agent_disk_usage_percent = GaugeVec::new(
            opts!("agent_disk_usage_percent", "Disk usage in percent by mount"),
            &["mount"],
        )?;
        let agent_net_rx_bytes_total = GaugeVec::new(
            opts!(
                "agent_net_rx_bytes_total",
                "Current total received bytes per interface"
            ),
            &["iface"],
        )?;
        let agent_net_tx_bytes_total = GaugeVec::new(
            opts!(
                "agent_net_tx_bytes_total",
                "Current total transmitted bytes per interface"
            ),
            &["iface"],
        )?;
        let agent_net_rx_bytes_per_sec = GaugeVec::new(
            opts!(
                "agent_net_rx_bytes_per_sec",
                "Current receive speed in bytes per second by interface"
            ),
            &["iface"],
        )?;
        let agent_net_tx_bytes_per_sec = GaugeVec::new(
            opts!(
                "agent_net_tx_bytes_per_sec",
                "Current transmit speed in bytes per second by interface"
            ),
            &["iface"],
        )?;
        let agent_process_count =
            Gauge::with_opts(opts!("agent_process_count", "Number of running processes"))?;
        let agent_service_active = GaugeVec::new(
            opts!(
                "agent_service_active",
                "1 if the service reports active, 0 otherwise"
            ),
            &["service", "enabled"],
        )?;
        let agent_uptime_seconds =
            Gauge::with_opts(opts!("agent_uptime_seconds", "Agent uptime in seconds"))?;
        let agent_scrape_count_total = Counter::with_opts(opts!(
            "agent_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;
        let agent_last_collect_timestamp_seconds = Gauge::with_opts(opts!(
            "agent_last_collect_timestamp_seconds",
            "Unix timestamp of the last collection"
        ))?;
        let agent_jobs_started_total = CounterVec::new(
            opts!("agent_jobs_started_total", "Job runs started by job name"),
            &["job"],
        )?;
        let agent_jobs_rejected_total = CounterVec::new(
            opts!(
                "agent_jobs_rejected_total",
                "Job start requests rejected by reason"
            ),
            &["reason"],
        )?;
        let agent_jobs_finished_total = CounterVec::new(
            opts!(
                "agent_jobs_finished_total",
                "Job runs sealed by job name and termination"
            ),
            &["job", "termination"],
        )?;
        let agent_jobs_running =
            Gauge::with_opts(opts!("agent_jobs_running", "Job processes currently alive"))?;

        register(&registry, &agent_cpu_usage_percent)?;
        register(&registry, &agent_cpu_core_count)?;
        register(&registry, &agent_load_average)?;
        register(&registry, &agent_memory_used_bytes)?;
        register(&registry, &agent_memory_total_bytes)?;
        register(&registry, &agent_ram_usage_percent)?;
        register(&registry, &agent_swap_used_bytes)?;
        register(&registry, &agent_swap_total_bytes)?;
        register(&registry, &agent_disk_used_bytes)?;
        register(&registry, &agent_disk_total_bytes)?;
        register(&registry, &agent_disk_usage_percent)?;
        register(&registry, &agent_net_rx_bytes_total)?;
        register(&registry, &agent_net_tx_bytes_total)?;
        register(&registry, &agent_net_rx_bytes_per_sec)?;
        register(&registry, &agent_net_tx_bytes_per_sec)?;
        register(&registry, &agent_process_count)?;
        register(&registry, &agent_service_active)?;
        register(&registry, &agent_uptime_seconds)?;
        register(&registry, &agent_scrape_count_total)?;
        register(&registry, &agent_last_collect_timestamp_seconds)?;
        register(&registry, &agent_jobs_started_total)?;
        register(&registry, &agent_jobs_rejected_total)?;
        register(&registry, &agent_jobs_finished_total)?;
        register(&registry, &agent_jobs_running)?;

        Ok(Arc::new(Self {
            registry,
            agent_cpu_usage_percent,
            agent_cpu_core_count,
            agent_load_average,
            agent_memory_used_bytes,
            agent_memory_total_bytes,
            agent_ram_usage_percent,
            agent_swap_used_bytes,
            agent_swap_total_bytes,
            agent_disk_used_bytes,
            agent_disk_total_bytes,
            agent_disk_usage_percent,
            agent_net_rx_bytes_total,
            agent_net_tx_bytes_total,
            agent_net_rx_bytes_per_sec,
            agent_net_tx_bytes_per_sec,
            agent_process_count,
            agent_service_active,
            agent_uptime_seconds,
            agent_scrape_count_total,
            agent_last_collect_timestamp_seconds,
            agent_jobs_started_total,
            agent_jobs_rejected_total,
            agent_jobs_finished_total,
            agent_jobs_running,
        }))
    }

    pub fn update_from_state(&self, state: &State) {
        self.agent_cpu_usage_percent.set(state.cpu_usage_percent);
        self.agent_cpu_core_count.set(state.cpu_core_count as f64);
        self.agent_load_average
            .with_label_values(&["1m"])
            .set(state.load_average.one);
        self.agent_load_average
            .with_label_values(&["5m"])
            .set(state.load_average.five);
        self.agent_load_average
            .with_label_values(&["15m"])
            .set(state.load_average.fifteen);
        self.agent_memory_used_bytes
            .set(state.memory_used_bytes as f64);
        self.agent_memory_total_bytes
            .set(state.memory_total_bytes as f64);
        let ram_pct = if state.memory_total_bytes > 0 {
            (state.memory_used_bytes as f64 / state.memory_total_bytes as f64) * 100.0
        } else {
            0.0
        };
        self.agent_ram_usage_percent.set(ram_pct);
        self.agent_swap_used_bytes.set(state.swap_used_bytes as f64);
        self.agent_swap_total_bytes.set(state.swap_total_bytes as f64);
        self.agent_process_count.set(state.process_count as f64);
        self.agent_last_collect_timestamp_seconds
            .set(state.last_collect_timestamp_seconds as f64);

        self.agent_disk_used_bytes.reset();
        self.agent_disk_total_bytes.reset();
        self.agent_disk_usage_percent.reset();
        self.agent_net_rx_bytes_total.reset();
        self.agent_net_tx_bytes_total.reset();
        self.agent_net_rx_bytes_per_sec.reset();
        self.agent_net_tx_bytes_per_sec.reset();
        self.agent_service_active.reset();

        for d in &state.disks {
            self.agent_disk_used_bytes
                .with_label_values(&[&d.mount])
                .set(d.used_bytes as f64);
            self.agent_disk_total_bytes
                .with_label_values(&[&d.mount])
                .set(d.total_bytes as f64);
            self.agent_disk_usage_percent
                .with_label_values(&[&d.mount])
                .set(d.usage_percent());
        }

        for n in &state.net {
            self.agent_net_rx_bytes_total
                .with_label_values(&[&n.iface])
                .set(n.rx_bytes_total as f64);
            self.agent_net_tx_bytes_total
                .with_label_values(&[&n.iface])
                .set(n.tx_bytes_total as f64);
            self.agent_net_rx_bytes_per_sec
                .with_label_values(&[&n.iface])
                .set(n.rx_bytes_per_sec as f64);
            self.agent_net_tx_bytes_per_sec
                .with_label_values(&[&n.iface])
                .set(n.tx_bytes_per_sec as f64);
        }

        for svc in &state.services {
            self.agent_service_active
                .with_label_values(&[&svc.name, &svc.is_enabled])
                .set(if svc.active() { 1.0 } else { 0.0 });
        }

        let now = now_unix();
        let uptime = now.saturating_sub(state.started_at_unix) as f64;
        self.agent_uptime_seconds.set(uptime);
    }

    pub fn inc_scrape_count(&self) {
        self.agent_scrape_count_total.inc();
    }

    pub fn job_started(&self, job: &str) {
        self.agent_jobs_started_total.with_label_values(&[job]).inc();
        self.agent_jobs_running.inc();
    }

    pub fn job_rejected(&self, reason: &str) {
        self.agent_jobs_rejected_total
            .with_label_values(&[reason])
            .inc();
    }

    pub fn job_finished(&self, job: &str, termination: &str) {
        self.agent_jobs_finished_total
            .with_label_values(&[job, termination])
            .inc();
        self.agent_jobs_running.dec();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{DiskStat, ServiceStat};

    #[test]
    fn job_counters_track_running_gauge() {
        let metrics = Metrics::new().expect("инициализация метрик");
        metrics.job_started("backup");
        metrics.job_started("ping");
        metrics.job_finished("backup", "exited");
        metrics.job_rejected("already_running");

        assert_eq!(metrics.agent_jobs_running.get(), 1.0);
        assert_eq!(
            metrics
                .agent_jobs_finished_total
                .with_label_values(&["backup", "exited"])
                .get(),
            1.0
        );

        let text = String::from_utf8(metrics.encode_metrics().unwrap()).unwrap();
        assert!(text.contains("agent_jobs_started_total"));
        assert!(text.contains("reason=\"already_running\""));
    }

    #[test]
    fn disk_gauges_follow_state() {
        let metrics = Metrics::new().expect("инициализация метрик");
        let mut state = State::new(0);
        state.disks = vec![DiskStat {
            mount: "/".to_string(),
            file_system: "ext4".to_string(),
            used_bytes: 25,
            total_bytes: 100,
        }];
        metrics.update_from_state(&state);
        assert_eq!(
            metrics
                .agent_disk_usage_percent
                .with_label_values(&["/"])
                .get(),
            25.0
        );

        state.disks.clear();
        metrics.update_from_state(&state);
        let text = String::from_utf8(metrics.encode_metrics().unwrap()).unwrap();
        assert!(!text.contains("mount=\"/\""));
    }

    #[test]
    fn service_gauge_reflects_active_state() {
        let metrics = Metrics::new().expect("инициализация метрик");
        let mut state = State::new(0);
        state.services = vec![
            ServiceStat {
                name: "ssh".to_string(),
                is_active: "active".to_string(),
                is_enabled: "enabled".to_string(),
            },
            ServiceStat {
                name: "cron".to_string(),
                is_active: "failed".to_string(),
                is_enabled: "disabled".to_string(),
            },
        ];
        metrics.update_from_state(&state);

        assert_eq!(
            metrics
                .agent_service_active
                .with_label_values(&["ssh", "enabled"])
                .get(),
            1.0
        );
        assert_eq!(
            metrics
                .agent_service_active
                .with_label_values(&["cron", "disabled"])
                .get(),
            0.0
        );
    }
}
