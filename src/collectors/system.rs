use crate::collectors::SystemSnapshot;
use crate::state::{DiskStat, LoadAverage, NetStat, ProcessStat};
use sysinfo::{
    CpuExt, DiskExt, NetworkExt, NetworksExt, PidExt, Process, ProcessExt, System, SystemExt,
};
use tracing::debug;

pub fn collect_system(system: &mut System, top_n: usize) -> SystemSnapshot {
    system.refresh_cpu();
    system.refresh_memory();
    system.refresh_processes();
    system.refresh_disks_list();
    system.refresh_disks();
    system.refresh_networks_list();
    system.refresh_networks();

    let cpu_usage_percent = if system.cpus().is_empty() {
        0.0
    } else {
        let sum: f32 = system.cpus().iter().map(|c| c.cpu_usage()).sum();
        (sum / system.cpus().len() as f32) as f64
    };

    let load = system.load_average();

    let disks: Vec<DiskStat> = system
        .disks()
        .iter()
        .map(|d| {
            let total = d.total_space();
            let used = total.saturating_sub(d.available_space());
            DiskStat {
                mount: d.mount_point().to_string_lossy().to_string(),
                file_system: String::from_utf8_lossy(d.file_system()).to_string(),
                used_bytes: used,
                total_bytes: total,
            }
        })
        .collect();

    let net: Vec<NetStat> = system
        .networks()
        .iter()
        .map(|(iface, data)| NetStat {
            iface: iface.to_string(),
            rx_bytes_total: data.total_received(),
            tx_bytes_total: data.total_transmitted(),
            rx_bytes_per_sec: 0,
            tx_bytes_per_sec: 0,
        })
        .collect();

    let top_processes = top_processes_by_cpu(system.processes().values(), top_n);
    debug!(
        disks = disks.len(),
        ifaces = net.len(),
        processes = system.processes().len(),
        "system snapshot collected"
    );

    SystemSnapshot {
        host_name: system.host_name(),
        os_name: system.name(),
        os_version: system.os_version(),
        kernel_version: system.kernel_version(),
        cpu_brand: system.cpus().first().map(|c| c.brand().to_string()),
        uptime_seconds: system.uptime(),
        load_average: LoadAverage {
            one: load.one,
            five: load.five,
            fifteen: load.fifteen,
        },
        process_count: system.processes().len() as u64,
        cpu_core_count: system.cpus().len() as u32,
        cpu_usage_percent,
        memory_used_bytes: system.used_memory(),
        memory_total_bytes: system.total_memory(),
        swap_used_bytes: system.used_swap(),
        swap_total_bytes: system.total_swap(),
        disks,
        net,
        top_processes,
    }
}

fn top_processes_by_cpu<'a>(
    processes: impl Iterator<Item = &'a Process>,
    top_n: usize,
) -> Vec<ProcessStat> {
    let mut out: Vec<ProcessStat> = processes
        .map(|p| ProcessStat {
            pid: p.pid().as_u32(),
            name: p.name().to_string(),
            cpu_usage_percent: p.cpu_usage() as f64,
            memory_bytes: p.memory(),
        })
        .collect();
    sort_by_cpu_desc(&mut out);
    out.truncate(top_n);
    out
}

fn sort_by_cpu_desc(processes: &mut [ProcessStat]) {
    processes.sort_by(|a, b| {
        b.cpu_usage_percent
            .total_cmp(&a.cpu_usage_percent)
            .then_with(|| b.memory_bytes.cmp(&a.memory_bytes))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn process(pid: u32, cpu: f64, mem: u64) -> ProcessStat {
        ProcessStat {
            pid,
            name: format!("p{pid}"),
            cpu_usage_percent: cpu,
            memory_bytes: mem,
        }
    }

    #[test]
    fn processes_sorted_by_cpu_then_memory() {
        let mut list = vec![
            process(1, 1.0, 10),
            process(2, 50.0, 10),
            process(3, 1.0, 99),
        ];
        sort_by_cpu_desc(&mut list);
        let pids: Vec<u32> = list.iter().map(|p| p.pid).collect();
        assert_eq!(pids, vec![2, 3, 1]);
    }

    #[test]
    fn collect_system_respects_top_n() {
        let mut system = System::new_all();
        let snapshot = collect_system(&mut system, 3);
        assert!(snapshot.top_processes.len() <= 3);
        assert!(snapshot.process_count >= snapshot.top_processes.len() as u64);
        assert!(snapshot.cpu_core_count >= 1);
    }
}
