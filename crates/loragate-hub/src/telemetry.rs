//! Periodic telemetry payload
//!
//! The same four sections the firmware reports: system, cpu, memory and
//! network, collected via `sysinfo`. Sent upstream every telemetry
//! interval while the session is authenticated.

use serde_json::{json, Value};
use std::time::Instant;
use sysinfo::{Networks, System};

pub struct TelemetryCollector {
    system: System,
    firmware_version: String,
    started: Instant,
}

impl TelemetryCollector {
    pub fn new(firmware_version: String) -> Self {
        Self {
            system: System::new_all(),
            firmware_version,
            started: Instant::now(),
        }
    }

    /// Refresh and build the telemetry payload.
    pub fn collect(&mut self) -> Value {
        self.system.refresh_memory();
        self.system.refresh_cpu_all();

        json!({
            "system": self.system_info(),
            "cpu": self.cpu_info(),
            "memory": self.memory_info(),
            "network": network_info(),
        })
    }

    fn system_info(&self) -> Value {
        json!({
            "firmware": self.firmware_version,
            "uptime": self.started.elapsed().as_secs(),
            "host_uptime": System::uptime(),
            "os": System::name().unwrap_or_else(|| String::from("unknown")),
            "os_version": System::os_version().unwrap_or_else(|| String::from("unknown")),
            "hostname": System::host_name().unwrap_or_else(|| String::from("unknown")),
        })
    }

    fn cpu_info(&self) -> Value {
        let cpus = self.system.cpus();
        let freq_mhz = cpus.first().map(|cpu| cpu.frequency()).unwrap_or(0);
        json!({
            "cores": cpus.len(),
            "freq_mhz": freq_mhz,
            "usage_pct": self.system.global_cpu_usage(),
        })
    }

    fn memory_info(&self) -> Value {
        let total = self.system.total_memory();
        let used = self.system.used_memory();
        let used_pct = if total > 0 {
            used as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        json!({
            "total": total,
            "free": self.system.available_memory(),
            "used": used,
            "used_pct": used_pct,
        })
    }
}

fn network_info() -> Value {
    let networks = Networks::new_with_refreshed_list();
    let interfaces: Vec<Value> = networks
        .iter()
        .map(|(name, data)| {
            json!({
                "name": name,
                "mac": data.mac_address().to_string(),
            })
        })
        .collect();
    json!({ "interfaces": interfaces })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_has_all_sections() {
        let mut collector = TelemetryCollector::new(String::from("0.1.0"));
        let payload = collector.collect();

        for section in ["system", "cpu", "memory", "network"] {
            assert!(payload.get(section).is_some(), "missing section {}", section);
        }
        assert_eq!(payload["system"]["firmware"], "0.1.0");
        assert!(payload["memory"]["total"].as_u64().is_some());
        assert!(payload["cpu"]["cores"].as_u64().unwrap() >= 1);
    }
}
