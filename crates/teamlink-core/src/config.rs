use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use discovery::DiscoveryConfig;

/// Node configuration. Durations are stored as milliseconds so the JSON file
/// stays hand-editable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Directory for identity, keypair, durable state
    pub data_dir: PathBuf,

    /// Where received files are written
    pub download_dir: PathBuf,

    /// Host the TCP listener binds to
    pub listen_host: String,

    /// Candidate TCP ports, tried in order until one is free
    pub tcp_ports: Vec<u16>,

    pub handshake_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Bound on one frame write; a peer that stalls longer is dropped.
    /// Keep well below the heartbeat timeout.
    pub write_timeout_ms: u64,

    /// Sign every encrypted frame with the installation key
    pub sign_messages: bool,

    /// Accept file offers without waiting for a collaborator
    pub auto_accept_files: bool,
    /// Pause between file chunks
    pub chunk_pause_ms: u64,

    /// Dial newly discovered peers automatically
    pub auto_connect: bool,

    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,

    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub reconnect_max_attempts: u32,

    pub queue_interval_ms: u64,
    pub queue_max_retries: u32,

    pub sync_interval_ms: u64,

    /// Upper bound on every worker's poll sleep (cancellation latency)
    pub poll_interval_ms: u64,
    /// How long shutdown waits for workers before abandoning them
    pub shutdown_timeout_ms: u64,

    pub discovery: DiscoveryConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let data_dir = std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(".teamlink");
        Self {
            download_dir: data_dir.join("downloads"),
            data_dir,
            listen_host: "0.0.0.0".to_string(),
            tcp_ports: vec![37050, 37051, 37052, 37053, 37054],
            handshake_timeout_ms: 10_000,
            connect_timeout_ms: 3_000,
            write_timeout_ms: 2_000,
            sign_messages: true,
            auto_accept_files: false,
            chunk_pause_ms: 5,
            auto_connect: true,
            heartbeat_interval_ms: 5_000,
            heartbeat_timeout_ms: 15_000,
            reconnect_base_delay_ms: 2_000,
            reconnect_max_delay_ms: 60_000,
            reconnect_max_attempts: 5,
            queue_interval_ms: 10_000,
            queue_max_retries: 5,
            sync_interval_ms: 2_000,
            poll_interval_ms: 500,
            shutdown_timeout_ms: 3_000,
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Defaults rooted at `data_dir`.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            download_dir: data_dir.join("downloads"),
            data_dir,
            ..Self::default()
        }
    }

    pub fn ensure_data_dir(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(&self.download_dir)?;
        Ok(())
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let cfg = serde_json::from_str(&json)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(cfg)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("writing config {}", path.display()))?;
        Ok(())
    }

    pub fn identity_path(&self) -> PathBuf {
        self.data_dir.join("peer_id")
    }

    pub fn keypair_path(&self) -> PathBuf {
        self.data_dir.join("keypair.key")
    }

    pub fn handshake_timeout(&self) -> Duration { Duration::from_millis(self.handshake_timeout_ms) }
    pub fn connect_timeout(&self) -> Duration { Duration::from_millis(self.connect_timeout_ms) }
    pub fn write_timeout(&self) -> Duration { Duration::from_millis(self.write_timeout_ms) }
    pub fn chunk_pause(&self) -> Duration { Duration::from_millis(self.chunk_pause_ms) }
    pub fn heartbeat_interval(&self) -> Duration { Duration::from_millis(self.heartbeat_interval_ms) }
    pub fn heartbeat_timeout(&self) -> Duration { Duration::from_millis(self.heartbeat_timeout_ms) }
    pub fn reconnect_base_delay(&self) -> Duration { Duration::from_millis(self.reconnect_base_delay_ms) }
    pub fn reconnect_max_delay(&self) -> Duration { Duration::from_millis(self.reconnect_max_delay_ms) }
    pub fn queue_interval(&self) -> Duration { Duration::from_millis(self.queue_interval_ms) }
    pub fn sync_interval(&self) -> Duration { Duration::from_millis(self.sync_interval_ms) }
    pub fn poll_interval(&self) -> Duration { Duration::from_millis(self.poll_interval_ms.clamp(1, 1_000)) }
    pub fn shutdown_timeout(&self) -> Duration { Duration::from_millis(self.shutdown_timeout_ms) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn config_file_roundtrip_keeps_overrides() {
        let temp = TempDir::new().unwrap();
        let mut cfg = NodeConfig::with_data_dir(temp.path());
        cfg.tcp_ports = vec![0];
        cfg.auto_accept_files = true;
        let path = temp.path().join("config.json");
        cfg.save(&path).unwrap();

        let loaded = NodeConfig::load(&path).unwrap();
        assert_eq!(loaded.tcp_ports, vec![0]);
        assert!(loaded.auto_accept_files);
        assert_eq!(loaded.download_dir, temp.path().join("downloads"));
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let cfg: NodeConfig = serde_json::from_str(r#"{"queue_max_retries": 2}"#).unwrap();
        assert_eq!(cfg.queue_max_retries, 2);
        assert_eq!(cfg.heartbeat_timeout(), Duration::from_secs(15));
        assert!(cfg.write_timeout() < cfg.heartbeat_interval());
        assert_eq!(cfg.discovery.multicast_port, 37030);
    }

    #[test]
    fn poll_interval_is_capped_at_one_second() {
        let cfg = NodeConfig { poll_interval_ms: 60_000, ..NodeConfig::default() };
        assert_eq!(cfg.poll_interval(), Duration::from_secs(1));
    }
}
