use serde::{Serialize, Deserialize};
use std::path::{Path, PathBuf};
use std::fs::{OpenOptions, File};
use std::io::{BufReader, BufWriter, Write, BufRead};
use std::sync::Mutex;
use anyhow::{Result, Context};
use chrono::Utc;
use uuid::Uuid;

use crate::protocol::{CommandKind, CommandRequest};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Rejected,
    Failed,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    List,
    Retrieve,
}

impl From<CommandKind> for TransferKind {
    fn from(k: CommandKind) -> Self {
        match k {
            CommandKind::ListDirectory => TransferKind::List,
            CommandKind::RetrieveFile => TransferKind::Retrieve,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TransferLogEntry {
    pub timestamp: String,
    pub command_id: String,
    pub peer: String,
    pub kind: Option<TransferKind>,
    pub file_name: Option<String>,
    pub data_port: Option<u16>,
    pub status: TransferStatus,
    pub bytes_transferred: u64,
    pub blake3: Option<String>,
    pub error: Option<String>,
}

impl TransferLogEntry {
    /// Fresh entry for one control connection; `request` is None when the
    /// line could not be parsed
    pub fn new(peer: &str, request: Option<&CommandRequest>) -> Self {
        TransferLogEntry {
            timestamp: Utc::now().to_rfc3339(),
            command_id: Uuid::new_v4().to_string(),
            peer: peer.to_string(),
            kind: request.map(|r| r.kind.into()),
            file_name: request.and_then(|r| r.file_name.clone()),
            data_port: request.map(|r| r.data_port),
            status: TransferStatus::Failed,
            bytes_transferred: 0,
            blake3: None,
            error: None,
        }
    }
}

/// Append-only JSONL record of every command the server handled
pub struct TransferLog {
    log_file_path: PathBuf,
    write_lock: Mutex<()>,
}

impl TransferLog {
    pub fn new(path: &Path) -> Self {
        TransferLog {
            log_file_path: path.to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn add_entry(&self, entry: &TransferLogEntry) -> Result<()> {
        let _guard = self.write_lock.lock().map_err(|_| anyhow::anyhow!("transfer log lock poisoned"))?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file_path)
            .context("Failed to open transfer log file")?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, entry)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    pub fn read_log(&self) -> Result<Vec<TransferLogEntry>> {
        if !self.log_file_path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.log_file_path)
            .context("Failed to open transfer log file for reading")?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: TransferLogEntry = serde_json::from_str(&line)?;
            entries.push(entry);
        }
        Ok(entries)
    }
}
