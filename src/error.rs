use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FtError>;

#[derive(Error, Debug)]
pub enum FtError {
    #[error("usage error: {0}")]
    Usage(String),
    #[error("cannot connect to {addr}: {source}")]
    Connection {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("{0}")]
    InvalidCommand(String),
    #[error("data channel timeout during {stage} ({ms} ms)")]
    DataChannelTimeout { stage: &'static str, ms: u64 },
    #[error("local I/O error on {}: {source}", path.display())]
    LocalIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("interrupted")]
    Interrupted,
}

impl FtError {
    pub fn local_io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::LocalIo {
            path: path.into(),
            source,
        }
    }

    /// Process exit status for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            FtError::Usage(_) => 2,
            FtError::InvalidCommand(_) => 3,
            FtError::Connection { .. } => 4,
            FtError::DataChannelTimeout { .. } => 5,
            FtError::LocalIo { .. } => 6,
            FtError::Protocol(_) | FtError::Io(_) => 7,
            FtError::Config(_) => 2,
            FtError::Interrupted => 130,
        }
    }
}

impl From<toml::de::Error> for FtError {
    fn from(e: toml::de::Error) -> Self {
        Self::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct_per_failure_class() {
        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let codes = [
            FtError::Usage("x".into()).exit_code(),
            FtError::InvalidCommand("x".into()).exit_code(),
            FtError::Connection { addr: "h:1".into(), source: refused }.exit_code(),
            FtError::DataChannelTimeout { stage: "accept", ms: 1 }.exit_code(),
            FtError::local_io("f", io::Error::new(io::ErrorKind::PermissionDenied, "no")).exit_code(),
            FtError::Protocol("x".into()).exit_code(),
            FtError::Interrupted.exit_code(),
        ];
        for (i, a) in codes.iter().enumerate() {
            assert_ne!(*a, 0);
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_invalid_command_displays_server_text() {
        let e = FtError::InvalidCommand("Error: file not found: a.txt".into());
        assert_eq!(e.to_string(), "Error: file not found: a.txt");
    }
}
