use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::booking::BookingConfig;
use crate::limits::DEFAULT_MAX_CONNECTIONS;

/// Server settings, read from `BENB_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends since the last compaction before the compactor rewrites the log.
    pub compact_threshold: u64,
    pub store_timeout: Duration,
    pub release_retries: u32,
    pub reconcile_interval: Duration,
    pub reconcile_max_attempts: u32,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "benb".into(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            compact_threshold: 1000,
            store_timeout: Duration::from_millis(5000),
            release_retries: 3,
            reconcile_interval: Duration::from_secs(5),
            reconcile_max_attempts: 100,
            tls_cert: None,
            tls_key: None,
            metrics_port: None,
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key).and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        Self {
            port: parsed(&lookup, "BENB_PORT", d.port),
            bind: lookup("BENB_BIND").unwrap_or(d.bind),
            data_dir: lookup("BENB_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            password: lookup("BENB_PASSWORD").unwrap_or(d.password),
            max_connections: parsed(&lookup, "BENB_MAX_CONNECTIONS", d.max_connections).max(1),
            compact_threshold: parsed(&lookup, "BENB_COMPACT_THRESHOLD", d.compact_threshold),
            store_timeout: Duration::from_millis(parsed(
                &lookup,
                "BENB_STORE_TIMEOUT_MS",
                d.store_timeout.as_millis() as u64,
            )),
            release_retries: parsed(&lookup, "BENB_RELEASE_RETRIES", d.release_retries),
            reconcile_interval: Duration::from_secs(
                parsed(&lookup, "BENB_RECONCILE_INTERVAL_SECS", d.reconcile_interval.as_secs()).max(1),
            ),
            reconcile_max_attempts: parsed(&lookup, "BENB_RECONCILE_MAX_ATTEMPTS", d.reconcile_max_attempts),
            tls_cert: lookup("BENB_TLS_CERT"),
            tls_key: lookup("BENB_TLS_KEY"),
            metrics_port: lookup("BENB_METRICS_PORT").and_then(|s| s.trim().parse().ok()),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("benb.wal")
    }

    pub fn booking_config(&self) -> BookingConfig {
        BookingConfig {
            store_timeout: self.store_timeout,
            release_retries: self.release_retries,
            reconcile_max_attempts: self.reconcile_max_attempts,
        }
    }
}
