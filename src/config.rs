use std::path::PathBuf;
use std::time::Duration;

/// Server configuration, read from `FLEETBOOK_*` environment variables.
/// Unset or unparsable values fall back to the defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub reconcile_interval: Duration,
    pub reconcile_timeout: Duration,
    pub reconcile_batch_size: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5480,
            data_dir: PathBuf::from("./data"),
            max_connections: 256,
            reconcile_interval: Duration::from_secs(60),
            reconcile_timeout: Duration::from_secs(30),
            reconcile_batch_size: 64,
            compact_threshold: 1000,
            metrics_port: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|s| s.trim().parse::<u64>().ok());

        Self {
            bind: lookup("FLEETBOOK_BIND").unwrap_or(defaults.bind),
            port: lookup("FLEETBOOK_PORT")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.port),
            data_dir: lookup("FLEETBOOK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            max_connections: parsed("FLEETBOOK_MAX_CONNECTIONS")
                .filter(|n| *n > 0)
                .map(|n| n as usize)
                .unwrap_or(defaults.max_connections),
            reconcile_interval: parsed("FLEETBOOK_RECONCILE_INTERVAL_SECS")
                .filter(|n| *n > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.reconcile_interval),
            reconcile_timeout: parsed("FLEETBOOK_RECONCILE_TIMEOUT_SECS")
                .filter(|n| *n > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.reconcile_timeout),
            reconcile_batch_size: parsed("FLEETBOOK_RECONCILE_BATCH")
                .filter(|n| *n > 0)
                .map(|n| n as usize)
                .unwrap_or(defaults.reconcile_batch_size),
            compact_threshold: parsed("FLEETBOOK_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            metrics_port: lookup("FLEETBOOK_METRICS_PORT").and_then(|s| s.parse().ok()),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn journal_path(&self) -> PathBuf {
        self.data_dir.join("fleetbook.journal")
    }
}
