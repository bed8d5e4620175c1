//! Accounting records for the session lifecycle
//!
//! One record per event: request receipt, command start, command data,
//! command completion and, on failure, an error record. The daemon writes
//! them as JSON lines; embedders may plug in their own sink.

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountingKind {
    Receipt,
    CommandStart,
    CommandData,
    CommandCompletion,
    Error,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AccountingRecord {
    pub timestamp: String,
    pub host: String,
    pub session: String,
    pub kind: AccountingKind,
    /// cptpdsk / cpdsktp
    pub command: String,
    pub vid: String,
    pub unit: String,
    pub dgn: String,
    pub uid: u32,
    pub gid: u32,
    pub client_host: String,
    pub status: i32,
    pub severity: u32,
    pub files: u32,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub retries: u32,
    pub message: Option<String>,
}

impl AccountingRecord {
    pub fn new(session: &str, kind: AccountingKind) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            host: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown".to_string()),
            session: session.to_string(),
            kind,
            command: String::new(),
            vid: String::new(),
            unit: String::new(),
            dgn: String::new(),
            uid: 0,
            gid: 0,
            client_host: String::new(),
            status: 0,
            severity: 0,
            files: 0,
            bytes_in: 0,
            bytes_out: 0,
            retries: 0,
            message: None,
        }
    }
}

pub trait AccountingSink: Send + Sync {
    fn record(&self, _rec: &AccountingRecord) {}
}

pub struct NoopAccounting;
impl AccountingSink for NoopAccounting {}

/// Appends one JSON object per line
pub struct JsonlAccounting {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlAccounting {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())
            .with_context(|| format!("open accounting log {}", path.as_ref().display()))?;
        Ok(Self {
            path: path.as_ref().to_path_buf(),
            file: Mutex::new(f),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_records(path: &Path) -> Result<Vec<AccountingRecord>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(path).context("open accounting log for reading")?;
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }
}

impl AccountingSink for JsonlAccounting {
    fn record(&self, rec: &AccountingRecord) {
        let mut line = match serde_json::to_vec(rec) {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!("accounting record not serializable: {}", e);
                return;
            }
        };
        line.push(b'\n');
        let mut f = self.file.lock();
        if let Err(e) = f.write_all(&line).and_then(|_| f.flush()) {
            tracing::warn!(path = %self.path.display(), "accounting write failed: {}", e);
        }
    }
}

/// Keeps records in memory
#[derive(Default)]
pub struct MemoryAccounting {
    records: Mutex<Vec<AccountingRecord>>,
}

impl MemoryAccounting {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AccountingRecord> {
        self.records.lock().clone()
    }

    pub fn count(&self, kind: AccountingKind) -> usize {
        self.records.lock().iter().filter(|r| r.kind == kind).count()
    }
}

impl AccountingSink for MemoryAccounting {
    fn record(&self, rec: &AccountingRecord) {
        self.records.lock().push(rec.clone());
    }
}
