//! Hub configuration
//!
//! Every knob has a compiled-in default matching the protocol's
//! reference deployment; any of them can be overridden from the
//! environment with the `LORAGATE_` prefix (nested radio settings use a
//! double underscore, e.g. `LORAGATE_RADIO__BIND_ADDR`).

use anyhow::Result;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Globally unique device identifier sent in the identity handshake.
    pub device_id: String,
    pub firmware_version: String,

    pub server_host: String,
    pub server_port: u16,
    pub websocket_path: String,
    pub bootstrap_path: String,
    pub announce_path: String,
    pub server_use_tls: bool,

    /// Persistent key/value store location.
    pub storage_path: PathBuf,

    pub max_nodes: usize,
    pub max_discovered_nodes: usize,
    pub adoption_timeout_ms: u64,
    pub discovered_node_ttl_ms: u64,
    pub packet_queue_size: usize,

    pub max_time_drift_s: i64,
    pub telemetry_interval_ms: u64,
    pub network_check_interval_ms: u64,

    pub ws_reconnect_interval_ms: u64,
    pub ws_heartbeat_interval_ms: u64,
    pub ws_heartbeat_timeout_ms: u64,
    pub ws_heartbeat_retries: u32,

    pub radio: RadioConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RadioConfig {
    pub frequency_hz: u64,
    pub spreading_factor: u8,
    pub bandwidth_hz: u32,
    pub sync_word: u8,
    pub tx_power_dbm: i8,
    /// UDP endpoint the frame bridge listens on (stand-in for the SPI
    /// radio driver).
    pub bind_addr: String,
    /// Fixed peer to transmit to; when unset, frames go to the last
    /// sender heard.
    pub peer_addr: Option<String>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            device_id: String::from("loragate-hub-001"),
            firmware_version: String::from(env!("CARGO_PKG_VERSION")),
            server_host: String::from("127.0.0.1"),
            server_port: 8443,
            websocket_path: String::from("/ws"),
            bootstrap_path: String::from("/api/hub/bootstrap"),
            announce_path: String::from("/api/hub/announce"),
            server_use_tls: true,
            storage_path: PathBuf::from("loragate-store.json"),
            max_nodes: 10,
            max_discovered_nodes: 10,
            adoption_timeout_ms: 30_000,
            discovered_node_ttl_ms: 60_000,
            packet_queue_size: 5,
            max_time_drift_s: 120,
            telemetry_interval_ms: 10_000,
            network_check_interval_ms: 30_000,
            ws_reconnect_interval_ms: 2_000,
            ws_heartbeat_interval_ms: 25_000,
            ws_heartbeat_timeout_ms: 5_000,
            ws_heartbeat_retries: 2,
            radio: RadioConfig::default(),
        }
    }
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            frequency_hz: 868_000_000,
            spreading_factor: 7,
            bandwidth_hz: 125_000,
            sync_word: 0x34,
            tx_power_dbm: 20,
            bind_addr: String::from("0.0.0.0:17500"),
            peer_addr: None,
        }
    }
}

/// Load the configuration from the environment over the defaults.
pub fn load() -> Result<HubConfig> {
    let cfg = config::Config::builder()
        .add_source(
            config::Environment::with_prefix("LORAGATE")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol_reference() {
        let cfg = HubConfig::default();
        assert_eq!(cfg.max_nodes, 10);
        assert_eq!(cfg.max_discovered_nodes, 10);
        assert_eq!(cfg.adoption_timeout_ms, 30_000);
        assert_eq!(cfg.max_time_drift_s, 120);
        assert_eq!(cfg.telemetry_interval_ms, 10_000);
        assert_eq!(cfg.ws_heartbeat_interval_ms, 25_000);
        assert_eq!(cfg.ws_heartbeat_retries, 2);
        assert_eq!(cfg.radio.frequency_hz, 868_000_000);
        assert_eq!(cfg.radio.sync_word, 0x34);
        assert_eq!(cfg.radio.spreading_factor, 7);
    }

    #[test]
    fn test_overrides_merge_with_defaults() {
        let cfg: HubConfig = config::Config::builder()
            .set_override("max_nodes", 4i64)
            .unwrap()
            .set_override("server_host", "hub.example.org")
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(cfg.max_nodes, 4);
        assert_eq!(cfg.server_host, "hub.example.org");
        // Untouched fields keep their defaults.
        assert_eq!(cfg.max_discovered_nodes, 10);
        assert_eq!(cfg.radio.bandwidth_hz, 125_000);
    }
}
