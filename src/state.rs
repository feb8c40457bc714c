use crate::collectors::SystemSnapshot;
use std::collections::HashMap;

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct State {
    pub started_at_unix: i64,
    pub last_collect_timestamp_seconds: i64,
    pub host_name: Option<String>,
    pub os_name: Option<String>,
    pub os_version: Option<String>,
    pub kernel_version: Option<String>,
    pub cpu_brand: Option<String>,
    pub system_uptime_seconds: u64,
    pub load_average: LoadAverage,
    pub process_count: u64,
    pub cpu_core_count: u32,
    pub cpu_usage_percent: f64,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub swap_used_bytes: u64,
    pub swap_total_bytes: u64,
    pub disks: Vec<DiskStat>,
    pub net: Vec<NetStat>,
    pub top_processes: Vec<ProcessStat>,
    pub services: Vec<ServiceStat>,
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct LoadAverage {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DiskStat {
    pub mount: String,
    pub file_system: String,
    pub used_bytes: u64,
    pub total_bytes: u64,
}

impl DiskStat {
    pub fn usage_percent(&self) -> f64 {
        if self.total_bytes > 0 {
            (self.used_bytes as f64 / self.total_bytes as f64) * 100.0
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct NetStat {
    pub iface: String,
    pub rx_bytes_total: u64,
    pub tx_bytes_total: u64,
    pub rx_bytes_per_sec: u64,
    pub tx_bytes_per_sec: u64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ProcessStat {
    pub pid: u32,
    pub name: String,
    pub cpu_usage_percent: f64,
    pub memory_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ServiceStat {
    pub name: String,
    pub is_active: String,
    pub is_enabled: String,
}

impl ServiceStat {
    pub fn active(&self) -> bool {
        self.is_active == "active"
    }
}

impl State {
    pub fn new(now_unix: i64) -> Self {
        Self {
            started_at_unix: now_unix,
            ..Self::default()
        }
    }

    pub fn update_collected(&mut self, now_unix: i64, snapshot: SystemSnapshot) {
        let prev_ts = self.last_collect_timestamp_seconds;
        let dt = now_unix.saturating_sub(prev_ts).max(1) as u64;
        let prev_net: HashMap<String, (u64, u64)> = self
            .net
            .iter()
            .map(|n| (n.iface.clone(), (n.rx_bytes_total, n.tx_bytes_total)))
            .collect();

        let mut net = snapshot.net;
        for iface in &mut net {
            if let Some((prev_rx, prev_tx)) = prev_net.get(&iface.iface) {
                iface.rx_bytes_per_sec = iface.rx_bytes_total.saturating_sub(*prev_rx) / dt;
                iface.tx_bytes_per_sec = iface.tx_bytes_total.saturating_sub(*prev_tx) / dt;
            } else {
                iface.rx_bytes_per_sec = 0;
                iface.tx_bytes_per_sec = 0;
            }
        }

        self.last_collect_timestamp_seconds = now_unix;
        self.host_name = snapshot.host_name;
        self.os_name = snapshot.os_name;
        self.os_version = snapshot.os_version;
        self.kernel_version = snapshot.kernel_version;
        self.cpu_brand = snapshot.cpu_brand;
        self.system_uptime_seconds = snapshot.uptime_seconds;
        self.load_average = snapshot.load_average;
        self.process_count = snapshot.process_count;
        self.cpu_core_count = snapshot.cpu_core_count;
        self.cpu_usage_percent = snapshot.cpu_usage_percent;
        self.memory_used_bytes = snapshot.memory_used_bytes;
        self.memory_total_bytes = snapshot.memory_total_bytes;
        self.swap_used_bytes = snapshot.swap_used_bytes;
        self.swap_total_bytes = snapshot.swap_total_bytes;
        self.disks = snapshot.disks;
        self.net = net;
        self.top_processes = snapshot.top_processes;
    }

    pub fn update_services(&mut self, services: Vec<ServiceStat>) {
        self.services = services;
    }
}
