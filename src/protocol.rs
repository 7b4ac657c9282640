//! Shared protocol constants and control-channel messages for ftlink

use std::fmt;

/// Readiness token: sent only after the data listener is listening
pub const READY: &str = "READY";

/// Verdict token for an accepted command
pub const VALID_COMMAND: &str = "VALID_COMMAND";

/// Control lines (requests and verdicts) never exceed this many bytes
pub const MAX_CONTROL_LINE: usize = 512;

/// Third request token when listing (the server ignores it)
pub const LIST_PLACEHOLDER: &str = "-";

/// Fixed transfer buffer for payload streaming
pub const TRANSFER_BUF_SIZE: usize = 64 * 1024;

/// Suffix appended to a received file whose name is already taken locally
pub const COPY_SUFFIX: &str = "-COPY";

// Data channel header: MAGIC (4) | VERSION (2) | KIND (1) | LENGTH (8)
pub const DATA_MAGIC: &[u8; 4] = b"FTDC";
pub const DATA_VERSION: u16 = 1;
pub const DATA_HEADER_LEN: usize = 15;

// Payload kind IDs carried in the data header
pub mod payload_kind {
    pub const LISTING: u8 = 1;
    pub const FILE: u8 = 2;
}

// Centralized timeout defaults (ms); config files may override them
pub mod timeouts {
    // Control and data connect
    pub const CONNECT_MS: u64 = 5_000;

    // Client wait for READY or a rejection
    pub const READY_MS: u64 = 10_000;

    // Server wait for the client's data connection
    pub const ACCEPT_MS: u64 = 10_000;

    // Each control line and each payload chunk
    pub const IO_MS: u64 = 30_000;
}

/// The two commands a client may issue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    ListDirectory,
    RetrieveFile,
}

impl CommandKind {
    pub fn flag(self) -> &'static str {
        match self {
            CommandKind::ListDirectory => "-l",
            CommandKind::RetrieveFile => "-g",
        }
    }

    pub fn from_flag(flag: &str) -> Option<Self> {
        match flag {
            "-l" => Some(CommandKind::ListDirectory),
            "-g" => Some(CommandKind::RetrieveFile),
            _ => None,
        }
    }

    pub fn payload_kind(self) -> u8 {
        match self {
            CommandKind::ListDirectory => payload_kind::LISTING,
            CommandKind::RetrieveFile => payload_kind::FILE,
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandKind::ListDirectory => write!(f, "list"),
            CommandKind::RetrieveFile => write!(f, "retrieve"),
        }
    }
}

/// One command, scoped to a single client invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub kind: CommandKind,
    pub data_port: u16,
    pub file_name: Option<String>,
}

impl CommandRequest {
    pub fn list(data_port: u16) -> Self {
        Self {
            kind: CommandKind::ListDirectory,
            data_port,
            file_name: None,
        }
    }

    pub fn retrieve(data_port: u16, file_name: impl Into<String>) -> Self {
        Self {
            kind: CommandKind::RetrieveFile,
            data_port,
            file_name: Some(file_name.into()),
        }
    }

    /// Request line as sent on the control channel, newline included
    pub fn to_line(&self) -> String {
        let name = match (self.kind, self.file_name.as_deref()) {
            (CommandKind::RetrieveFile, Some(n)) => n,
            _ => LIST_PLACEHOLDER,
        };
        format!("{} {} {}\n", self.kind.flag(), self.data_port, name)
    }

    /// Parse a request line received from a client.
    ///
    /// The error string is sent back verbatim as the rejection verdict.
    pub fn parse_line(line: &str) -> Result<Self, String> {
        let tokens: Vec<&str> = line.split_ascii_whitespace().collect();
        let flag = match tokens.first() {
            Some(f) => *f,
            None => return Err("Error: empty command".to_string()),
        };
        let kind = CommandKind::from_flag(flag).ok_or_else(|| {
            format!(
                "Error: invalid command \"{}\". Use \"-l\" to list files, or \"-g <filename>\" to retrieve a file.",
                flag
            )
        })?;
        if tokens.len() > 3 {
            return Err("Error: file names containing whitespace are not supported".to_string());
        }
        let data_port = match tokens.get(1).map(|p| p.parse::<u16>()) {
            Some(Ok(p)) if p != 0 => p,
            Some(_) => return Err(format!("Error: invalid data port \"{}\"", tokens[1])),
            None => return Err("Error: missing data port".to_string()),
        };
        match kind {
            CommandKind::ListDirectory => Ok(Self::list(data_port)),
            CommandKind::RetrieveFile => {
                let name = tokens
                    .get(2)
                    .ok_or_else(|| "Error: \"-g\" requires a file name".to_string())?;
                crate::protocol_core::validate_file_name(name)
                    .map_err(|reason| format!("Error: {}", reason))?;
                Ok(Self::retrieve(data_port, *name))
            }
        }
    }
}

/// A request whose flag the client does not know. It is sent as typed so the
/// server's verdict can explain what went wrong.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnrecognizedRequest {
    pub flag: String,
    pub data_port: u16,
    pub file_name: Option<String>,
}

impl UnrecognizedRequest {
    pub fn to_line(&self) -> String {
        format!(
            "{} {} {}\n",
            self.flag,
            self.data_port,
            self.file_name.as_deref().unwrap_or(LIST_PLACEHOLDER)
        )
    }
}

/// The server's single answer to a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Valid,
    Invalid(String),
}

impl Verdict {
    /// Exact match on `VALID_COMMAND`; anything else is a rejection message
    pub fn parse(line: &str) -> Self {
        let text = line.trim_end_matches(['\r', '\n']);
        if text == VALID_COMMAND {
            Verdict::Valid
        } else {
            Verdict::Invalid(text.to_string())
        }
    }

    pub fn to_line(&self) -> String {
        match self {
            Verdict::Valid => format!("{}\n", VALID_COMMAND),
            // Keep the reply on one line
            Verdict::Invalid(reason) => format!("{}\n", reason.replace(['\r', '\n'], " ").trim_end()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_line_layout() {
        assert_eq!(CommandRequest::list(30021).to_line(), "-l 30021 -\n");
        assert_eq!(
            CommandRequest::retrieve(30022, "report.txt").to_line(),
            "-g 30022 report.txt\n"
        );
    }

    #[test]
    fn test_parse_request_accepts_both_commands() {
        assert_eq!(
            CommandRequest::parse_line("-l 4000 -\n").unwrap(),
            CommandRequest::list(4000)
        );
        // Placeholder is optional for listings
        assert_eq!(
            CommandRequest::parse_line("-l 4000").unwrap(),
            CommandRequest::list(4000)
        );
        assert_eq!(
            CommandRequest::parse_line("-g 4001 notes.md\r\n").unwrap(),
            CommandRequest::retrieve(4001, "notes.md")
        );
        // A name after -l is ignored
        assert_eq!(
            CommandRequest::parse_line("-l 4000 whatever").unwrap(),
            CommandRequest::list(4000)
        );
    }

    #[test]
    fn test_unrecognized_request_is_sent_as_typed() {
        let raw = UnrecognizedRequest {
            flag: "-x".to_string(),
            data_port: 4000,
            file_name: Some("a.txt".to_string()),
        };
        assert_eq!(raw.to_line(), "-x 4000 a.txt\n");
        let err = CommandRequest::parse_line(&raw.to_line()).unwrap_err();
        assert!(err.starts_with("Error: invalid command \"-x\""));

        let bare = UnrecognizedRequest { file_name: None, ..raw };
        assert_eq!(bare.to_line(), "-x 4000 -\n");
    }

    #[test]
    fn test_parse_request_rejections() {
        let unknown = CommandRequest::parse_line("-x 4000 a").unwrap_err();
        assert!(unknown.contains("invalid command \"-x\""));

        assert!(CommandRequest::parse_line("").is_err());
        assert!(CommandRequest::parse_line("-l").unwrap_err().contains("missing data port"));
        assert!(CommandRequest::parse_line("-l 0 -").unwrap_err().contains("invalid data port"));
        assert!(CommandRequest::parse_line("-l 70000 -").is_err());
        assert!(CommandRequest::parse_line("-g 4000").unwrap_err().contains("requires a file name"));
        assert!(CommandRequest::parse_line("-g 4000 my file.txt")
            .unwrap_err()
            .contains("whitespace"));
        assert!(CommandRequest::parse_line("-g 4000 ../etc/passwd").is_err());
    }

    #[test]
    fn test_verdict_exact_match() {
        assert_eq!(Verdict::parse("VALID_COMMAND"), Verdict::Valid);
        assert_eq!(Verdict::parse("VALID_COMMAND\r\n"), Verdict::Valid);
        assert_eq!(
            Verdict::parse("VALID_COMMANDS\n"),
            Verdict::Invalid("VALID_COMMANDS".to_string())
        );
        assert_eq!(
            Verdict::parse("Error: file not found: x\n"),
            Verdict::Invalid("Error: file not found: x".to_string())
        );
    }

    #[test]
    fn test_invalid_verdict_is_single_line() {
        let v = Verdict::Invalid("first\nsecond\n".to_string());
        assert_eq!(v.to_line(), "first second\n");
    }
}
