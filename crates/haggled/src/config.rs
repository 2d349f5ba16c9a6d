//! Configuration for haggled

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// haggled - Haggle opportunistic data sharing daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "haggled")]
#[command(about = "Node-local runtime for opportunistic, content-centric data sharing")]
pub struct Config {
    /// Storage directory (payload files, haggle.db, haggle.pid, trace.log)
    #[arg(short, long, env = "HAGGLE_STORAGE_DIR", default_value = "./data/haggle")]
    pub storage: PathBuf,

    /// Node name advertised in node descriptions (defaults to the hostname)
    #[arg(short, long)]
    pub name: Option<String>,

    /// UDP port for discovery beacons
    #[arg(long, default_value = "9697")]
    pub beacon_port: u16,

    /// TCP port for the object exchange
    #[arg(long, default_value = "9697")]
    pub tcp_port: u16,

    /// Loopback UDP port for application IPC
    #[arg(long, default_value = "8787")]
    pub ipc_port: u16,

    /// Beacon interval in seconds
    #[arg(long, default_value = "5")]
    pub beacon_interval_secs: u64,

    /// Age after which unmatched data objects are swept, in seconds
    #[arg(long, default_value = "86400")]
    pub max_data_object_age_secs: u64,

    /// How often the aging sweep runs, in seconds
    #[arg(long, default_value = "3600")]
    pub age_period_secs: u64,

    /// Detach and run in the background
    #[arg(short = 'd', long)]
    pub daemonize: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.beacon_interval_secs == 0 || self.beacon_interval_secs > u8::MAX as u64 {
            anyhow::bail!("beacon interval must be between 1 and 255 seconds");
        }
        if self.age_period_secs == 0 {
            anyhow::bail!("age period cannot be zero");
        }
        Ok(())
    }

    pub fn node_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        std::env::var("HOSTNAME").unwrap_or_else(|_| "haggle-node".to_string())
    }

    pub fn beacon_interval(&self) -> Duration {
        Duration::from_secs(self.beacon_interval_secs)
    }

    pub fn pid_file(&self) -> PathBuf {
        self.storage.join("haggle.pid")
    }

    pub fn db_path(&self) -> PathBuf {
        self.storage.join("haggle.db")
    }

    pub fn trace_log(&self) -> PathBuf {
        self.storage.join("trace.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::parse_from(["haggled"]);
        assert!(config.validate().is_ok());
        assert_eq!(config.beacon_port, 9697);
        assert_eq!(config.ipc_port, 8787);
        assert!(!config.daemonize);
    }

    #[test]
    fn test_validation_rejects_bad_interval() {
        let config = Config::parse_from(["haggled", "--beacon-interval-secs", "0"]);
        assert!(config.validate().is_err());
        let config = Config::parse_from(["haggled", "--beacon-interval-secs", "300"]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_paths_derive_from_storage() {
        let config = Config::parse_from(["haggled", "--storage", "/tmp/h"]);
        assert_eq!(config.pid_file(), PathBuf::from("/tmp/h/haggle.pid"));
        assert_eq!(config.db_path(), PathBuf::from("/tmp/h/haggle.db"));
        assert_eq!(config.trace_log(), PathBuf::from("/tmp/h/trace.log"));
    }
}
