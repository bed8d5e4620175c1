//! Daemon configuration
//!
//! Each key resolves as: environment variable `RTCOPYD_<KEY>`, else the TOML
//! file, else the built-in default. A missing config file is not an error.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/castor/rtcpd.toml";
pub const ENV_PREFIX: &str = "RTCOPYD_";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub nb_bufs: usize,
    /// Total buffer pool size in bytes, split evenly over nb_bufs
    pub bufsz: usize,
    pub net_timeout_secs: u64,
    pub reuse_mounted_volume: bool,
    pub buffered_tape_marks: bool,
    /// Cumulative request list budget per session
    pub max_request_bytes: usize,
    pub min_uid: u32,
    pub disk_workers: usize,
    pub max_local_retries: u32,
    /// Account a client may claim when its uid is not known locally
    pub fallback_account: String,
    pub tape_root: PathBuf,
    pub accounting_log: Option<PathBuf>,
    pub no_more_tapes_file: PathBuf,
    pub bind: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nb_bufs: 8,
            bufsz: 128 * 1024 * 1024,
            net_timeout_secs: 60,
            reuse_mounted_volume: false,
            buffered_tape_marks: true,
            max_request_bytes: 4 * 1024 * 1024,
            min_uid: 100,
            disk_workers: num_cpus::get().clamp(1, 16),
            max_local_retries: 2,
            fallback_account: "stage".to_string(),
            tape_root: PathBuf::from("/var/spool/rtcpd/tapes"),
            accounting_log: None,
            no_more_tapes_file: PathBuf::from("/etc/castor/NOMORETAPES"),
            bind: "0.0.0.0:5011".to_string(),
        }
    }
}

impl Config {
    /// Load from `path` (or the default location) and apply the process
    /// environment on top
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let p = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
        let mut cfg = match std::fs::read_to_string(p) {
            Ok(data) => Self::from_toml(&data)
                .with_context(|| format!("parse config {}", p.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && path.is_none() => {
                Self::default()
            }
            Err(e) => return Err(e).with_context(|| format!("read config {}", p.display())),
        };
        cfg.apply_env(|k| std::env::var(k).ok())?;
        Ok(cfg)
    }

    pub fn from_toml(data: &str) -> Result<Self> {
        let cfg: Config = toml::from_str(data)?;
        Ok(cfg)
    }

    /// Override keys from `lookup("RTCOPYD_<KEY>")`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(&format!("{ENV_PREFIX}{}", key.to_ascii_uppercase()));

        fn parse<T: std::str::FromStr>(key: &str, v: &str) -> Result<T>
        where
            T::Err: std::fmt::Display,
        {
            v.trim()
                .parse::<T>()
                .map_err(|e| anyhow::anyhow!("{ENV_PREFIX}{}: {}", key.to_ascii_uppercase(), e))
        }

        if let Some(v) = get("nb_bufs") {
            self.nb_bufs = parse("nb_bufs", &v)?;
        }
        if let Some(v) = get("bufsz") {
            self.bufsz = parse("bufsz", &v)?;
        }
        if let Some(v) = get("net_timeout_secs") {
            self.net_timeout_secs = parse("net_timeout_secs", &v)?;
        }
        if let Some(v) = get("reuse_mounted_volume") {
            self.reuse_mounted_volume = parse_switch("reuse_mounted_volume", &v)?;
        }
        if let Some(v) = get("buffered_tape_marks") {
            self.buffered_tape_marks = parse_switch("buffered_tape_marks", &v)?;
        }
        if let Some(v) = get("max_request_bytes") {
            self.max_request_bytes = parse("max_request_bytes", &v)?;
        }
        if let Some(v) = get("min_uid") {
            self.min_uid = parse("min_uid", &v)?;
        }
        if let Some(v) = get("disk_workers") {
            self.disk_workers = parse("disk_workers", &v)?;
        }
        if let Some(v) = get("max_local_retries") {
            self.max_local_retries = parse("max_local_retries", &v)?;
        }
        if let Some(v) = get("fallback_account") {
            self.fallback_account = v;
        }
        if let Some(v) = get("tape_root") {
            self.tape_root = PathBuf::from(v);
        }
        if let Some(v) = get("accounting_log") {
            self.accounting_log = if v.is_empty() {
                None
            } else {
                Some(PathBuf::from(v))
            };
        }
        if let Some(v) = get("no_more_tapes_file") {
            self.no_more_tapes_file = PathBuf::from(v);
        }
        if let Some(v) = get("bind") {
            self.bind = v;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.nb_bufs == 0 {
            anyhow::bail!("nb_bufs must be at least 1");
        }
        if self.bufsz < self.nb_bufs {
            anyhow::bail!("bufsz {} too small for {} buffers", self.bufsz, self.nb_bufs);
        }
        if self.disk_workers == 0 {
            anyhow::bail!("disk_workers must be at least 1");
        }
        Ok(())
    }

    pub fn net_timeout(&self) -> Duration {
        Duration::from_secs(self.net_timeout_secs.max(1))
    }

    pub fn buffer_size(&self) -> usize {
        crate::buffer::buffer_size_for(self.bufsz, self.nb_bufs)
    }
}

/// Accepts the yes/no spellings used in castor config files
fn parse_switch(key: &str, v: &str) -> Result<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "yes" | "true" | "on" => Ok(true),
        "0" | "no" | "false" | "off" => Ok(false),
        other => anyhow::bail!("{ENV_PREFIX}{}: not a switch: {other}", key.to_ascii_uppercase()),
    }
}
