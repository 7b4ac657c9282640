//! Command-line surfaces for `ftclient` and `ftserver`

use clap::Parser;
use std::path::PathBuf;

use crate::config::{self, ClientConfig, ServerConfig};
use crate::error::{FtError, Result};
use crate::protocol::{CommandKind, CommandRequest, UnrecognizedRequest, MAX_CONTROL_LINE};
use crate::protocol_core::validate_file_name;

/// What one `ftclient` invocation sends to the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    Command(CommandRequest),
    /// Unknown flag; the server's verdict is what the user sees
    Unrecognized(UnrecognizedRequest),
}

/// ftclient <serverHost> <controlPort> (-l|-g) <dataPort> [<fileName>]
#[derive(Clone, Debug, Parser)]
#[command(
    name = "ftclient",
    version,
    about = "List a server directory (-l) or retrieve a file (-g) over a separate data connection"
)]
pub struct ClientArgs {
    /// Server host name or address
    pub server_host: String,

    /// Server control port
    pub control_port: u16,

    /// -l to list the server directory, -g to retrieve a file. Other values
    /// are sent as typed and answered by the server.
    #[arg(allow_hyphen_values = true)]
    pub command: String,

    /// Port the server opens for the data connection
    #[arg(value_parser = clap::value_parser!(u16).range(1..))]
    pub data_port: u16,

    /// File to retrieve (required with -g, ignored with -l)
    pub file_name: Option<String>,

    /// TOML file with client settings
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Directory retrieved files are written to
    #[arg(long = "download-dir")]
    pub download_dir: Option<PathBuf>,

    /// Show a transfer progress indicator on stderr
    #[arg(long)]
    pub progress: bool,

    /// Print transfer details (bytes, digest)
    #[arg(short, long)]
    pub verbose: bool,
}

impl ClientArgs {
    /// The command this invocation asks for. Local usage errors are caught
    /// here, before any network activity.
    pub fn request(&self) -> Result<Invocation> {
        let kind = match CommandKind::from_flag(&self.command) {
            Some(kind) => kind,
            None => return self.unrecognized().map(Invocation::Unrecognized),
        };
        match (kind, self.file_name.as_deref()) {
            // The server ignores a name given with -l
            (CommandKind::ListDirectory, _) => Ok(Invocation::Command(CommandRequest::list(self.data_port))),
            (CommandKind::RetrieveFile, None) => Err(FtError::Usage("-g requires a file name".into())),
            (CommandKind::RetrieveFile, Some(name)) => {
                validate_file_name(name).map_err(FtError::Usage)?;
                Ok(Invocation::Command(CommandRequest::retrieve(self.data_port, name)))
            }
        }
    }

    fn unrecognized(&self) -> Result<UnrecognizedRequest> {
        let framed = |s: &str| !s.is_empty() && !s.chars().any(|c| c.is_whitespace() || c.is_control());
        if !framed(&self.command) {
            return Err(FtError::Usage(format!("command {:?} cannot be sent", self.command)));
        }
        if let Some(name) = self.file_name.as_deref() {
            if !framed(name) {
                return Err(FtError::Usage(
                    "file names containing whitespace or control characters are not supported".into(),
                ));
            }
        }
        let request = UnrecognizedRequest {
            flag: self.command.clone(),
            data_port: self.data_port,
            file_name: self.file_name.clone(),
        };
        if request.to_line().len() > MAX_CONTROL_LINE {
            return Err(FtError::Usage(format!("request longer than {} bytes", MAX_CONTROL_LINE)));
        }
        Ok(request)
    }

    /// Config file (if any) with command-line flags layered on top
    pub fn client_config(&self) -> Result<ClientConfig> {
        let mut cfg: ClientConfig = config::load(self.config.as_deref())?;
        if let Some(dir) = &self.download_dir {
            cfg.download_dir = dir.clone();
        }
        cfg.progress |= self.progress;
        cfg.verbose |= self.verbose;
        cfg.validate()?;
        Ok(cfg)
    }
}

/// ftserver <controlPort> [options]
#[derive(Clone, Debug, Parser)]
#[command(name = "ftserver", version, about = "Serve one directory to ftclient")]
pub struct DaemonOpts {
    /// Control port to listen on
    pub port: u16,

    /// Address the control port binds to [default: 0.0.0.0]
    #[arg(long = "bind-host")]
    pub bind_host: Option<String>,

    /// Address data listeners bind to [default: 0.0.0.0]
    #[arg(long = "data-bind-host")]
    pub data_bind_host: Option<String>,

    /// Directory to serve [default: .]
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// TOML file with server settings
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Append human-readable events to this file
    #[arg(long = "log-file")]
    pub log_file: Option<PathBuf>,

    /// Append one JSON record per command to this file
    #[arg(long = "transfer-log")]
    pub transfer_log: Option<PathBuf>,
}

impl DaemonOpts {
    pub fn server_config(&self) -> Result<ServerConfig> {
        let mut cfg: ServerConfig = config::load(self.config.as_deref())?;
        cfg.control_port = self.port;
        if let Some(h) = &self.bind_host {
            cfg.bind_host = h.clone();
        }
        if let Some(h) = &self.data_bind_host {
            cfg.data_bind_host = h.clone();
        }
        if let Some(r) = &self.root {
            cfg.root = r.clone();
        }
        if self.log_file.is_some() {
            cfg.log_file = self.log_file.clone();
        }
        if self.transfer_log.is_some() {
            cfg.transfer_log = self.transfer_log.clone();
        }
        cfg.validate()?;
        Ok(cfg)
    }
}
