//! Client and server settings, optionally loaded from a TOML file

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{FtError, Result};
use crate::protocol::timeouts::{ACCEPT_MS, CONNECT_MS, IO_MS, READY_MS};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub connect_timeout_ms: u64,
    pub ready_timeout_ms: u64,
    pub io_timeout_ms: u64,
    /// Where retrieved files land
    pub download_dir: PathBuf,
    pub progress: bool,
    pub verbose: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: CONNECT_MS,
            ready_timeout_ms: READY_MS,
            io_timeout_ms: IO_MS,
            download_dir: PathBuf::from("."),
            progress: false,
            verbose: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_host: String,
    pub control_port: u16,
    /// Host the per-command data listeners bind to
    pub data_bind_host: String,
    /// Directory being served
    pub root: PathBuf,
    pub accept_timeout_ms: u64,
    pub io_timeout_ms: u64,
    pub log_file: Option<PathBuf>,
    pub transfer_log: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            control_port: 0,
            data_bind_host: "0.0.0.0".to_string(),
            root: PathBuf::from("."),
            accept_timeout_ms: ACCEPT_MS,
            io_timeout_ms: IO_MS,
            log_file: None,
            transfer_log: None,
        }
    }
}

impl ServerConfig {
    pub fn control_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.control_port)
    }

    pub fn validate(&self) -> Result<()> {
        check_timeout("accept_timeout_ms", self.accept_timeout_ms)?;
        check_timeout("io_timeout_ms", self.io_timeout_ms)?;
        if !self.root.is_dir() {
            return Err(FtError::Config(format!(
                "root is not a directory: {}",
                self.root.display()
            )));
        }
        Ok(())
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        check_timeout("connect_timeout_ms", self.connect_timeout_ms)?;
        check_timeout("ready_timeout_ms", self.ready_timeout_ms)?;
        check_timeout("io_timeout_ms", self.io_timeout_ms)
    }
}

fn check_timeout(name: &str, ms: u64) -> Result<()> {
    if ms == 0 {
        return Err(FtError::Config(format!("{} must be greater than zero", name)));
    }
    Ok(())
}

/// Load settings from `path`, or defaults when no path is given
pub fn load<T>(path: Option<&Path>) -> Result<T>
where
    T: for<'de> Deserialize<'de> + Default,
{
    match path {
        Some(p) => {
            let data = std::fs::read_to_string(p).map_err(|e| FtError::local_io(p, e))?;
            Ok(toml::from_str(&data)?)
        }
        None => Ok(T::default()),
    }
}
