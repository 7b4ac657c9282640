use anyhow::Result;
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use crate::protocol::CommandKind;

/// Server-side event sink; every method defaults to a no-op
pub trait Logger: Send + Sync {
    fn connection(&self, _peer: &str) {}
    fn request(&self, _peer: &str, _line: &str) {}
    fn rejected(&self, _peer: &str, _reason: &str) {}
    fn data_ready(&self, _peer: &str, _port: u16) {}
    fn transfer_done(&self, _peer: &str, _kind: CommandKind, _name: &str, _bytes: u64, _seconds: f64) {}
    fn error(&self, _context: &str, _peer: &str, _msg: &str) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
        }
    }
}

impl Logger for TextLogger {
    fn connection(&self, peer: &str) {
        self.line(&format!("CONNECT peer={}", peer));
    }
    fn request(&self, peer: &str, line: &str) {
        self.line(&format!("REQUEST peer={} line={:?}", peer, line));
    }
    fn rejected(&self, peer: &str, reason: &str) {
        self.line(&format!("REJECT peer={} reason={:?}", peer, reason));
    }
    fn data_ready(&self, peer: &str, port: u16) {
        self.line(&format!("READY peer={} data_port={}", peer, port));
    }
    fn transfer_done(&self, peer: &str, kind: CommandKind, name: &str, bytes: u64, seconds: f64) {
        self.line(&format!(
            "DONE peer={peer} kind={kind} name={name} bytes={bytes} seconds={seconds:.3}"
        ));
    }
    fn error(&self, context: &str, peer: &str, msg: &str) {
        self.line(&format!("ERROR ctx={} peer={} msg={}", context, peer, msg));
    }
}
