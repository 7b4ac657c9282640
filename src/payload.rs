//! Payload producer (server) and consumer (client)
//!
//! Both sides stream through a fixed `TRANSFER_BUF_SIZE` buffer; neither
//! holds a whole file in memory. The server writes a data header first so
//! the client can tell a finished transfer from a dropped connection.

use std::io;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Duration};

use crate::checksum::PayloadDigest;
use crate::error::{FtError, Result};
use crate::progress::TransferProgress;
use crate::protocol::{
    payload_kind, CommandKind, CommandRequest, COPY_SUFFIX, DATA_HEADER_LEN, TRANSFER_BUF_SIZE,
};
use crate::protocol_core::{build_data_header, normalize_under_root, parse_data_header, write_all_timed};

/// What one command streamed, as seen by either end
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSummary {
    pub kind: u8,
    pub bytes: u64,
    /// BLAKE3 hex of the payload bytes
    pub digest: String,
}

/// A validated payload, ready to stream once the data channel is up
#[derive(Debug)]
pub enum PayloadSource {
    Listing(Vec<u8>),
    File {
        path: PathBuf,
        file: tokio::fs::File,
        len: u64,
    },
}

impl PayloadSource {
    pub fn kind(&self) -> u8 {
        match self {
            PayloadSource::Listing(_) => payload_kind::LISTING,
            PayloadSource::File { .. } => payload_kind::FILE,
        }
    }

    pub fn len(&self) -> u64 {
        match self {
            PayloadSource::Listing(text) => text.len() as u64,
            PayloadSource::File { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Whether an entry name fits on one listing line as-is
fn listable(name: &str) -> bool {
    !name.chars().any(char::is_control)
}

/// Entry names of `dir`, sorted byte-wise. Not recursive; hidden entries
/// are included. Names that are not UTF-8 or contain control characters
/// (line breaks among them) are skipped.
pub async fn list_directory(dir: &Path) -> io::Result<Vec<String>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        match entry.file_name().into_string() {
            Ok(name) if listable(&name) => names.push(name),
            _ => {}
        }
    }
    names.sort();
    Ok(names)
}

/// One name per line, each `\n`-terminated; empty for an empty directory
pub fn render_listing(names: &[String]) -> Vec<u8> {
    let mut out = Vec::with_capacity(names.iter().map(|n| n.len() + 1).sum());
    for n in names {
        out.extend_from_slice(n.as_bytes());
        out.push(b'\n');
    }
    out
}

/// Parse a received listing back into entry names
pub fn parse_listing(text: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(text)
        .lines()
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Validate a request against the serving root and open what it names.
///
/// Runs before any data listener exists; the error string becomes the
/// rejection verdict.
pub async fn prepare(root: &Path, request: &CommandRequest) -> std::result::Result<PayloadSource, String> {
    match request.kind {
        CommandKind::ListDirectory => {
            let names = list_directory(root).await.map_err(|e| format!("Error: cannot read directory: {}", e))?;
            Ok(PayloadSource::Listing(render_listing(&names)))
        }
        CommandKind::RetrieveFile => {
            let name = request
                .file_name
                .as_deref()
                .ok_or_else(|| "Error: \"-g\" requires a file name".to_string())?;
            let path = normalize_under_root(root, name).map_err(|reason| format!("Error: {}", reason))?;
            let not_found = || format!("Error: file not found: {}", name);
            let file = tokio::fs::File::open(&path).await.map_err(|_| not_found())?;
            let meta = file.metadata().await.map_err(|_| not_found())?;
            if !meta.is_file() {
                return Err(not_found());
            }
            Ok(PayloadSource::File {
                path,
                file,
                len: meta.len(),
            })
        }
    }
}

/// Write header and payload to the data channel
pub async fn send_payload<W>(out: &mut W, source: PayloadSource, io_ms: u64) -> Result<TransferSummary>
where
    W: AsyncWrite + Unpin,
{
    let kind = source.kind();
    let len = source.len();
    write_all_timed(out, &build_data_header(kind, len), io_ms, "payload header write").await?;
    let mut digest = PayloadDigest::new();
    match source {
        PayloadSource::Listing(text) => {
            for chunk in text.chunks(TRANSFER_BUF_SIZE) {
                write_all_timed(out, chunk, io_ms, "payload write").await?;
                digest.update(chunk);
            }
        }
        PayloadSource::File { path, mut file, len } => {
            let mut buf = vec![0u8; TRANSFER_BUF_SIZE];
            let mut remaining = len;
            while remaining > 0 {
                let want = remaining.min(buf.len() as u64) as usize;
                let n = file
                    .read(&mut buf[..want])
                    .await
                    .map_err(|e| FtError::local_io(&path, e))?;
                if n == 0 {
                    let short = io::Error::new(io::ErrorKind::UnexpectedEof, "file shrank during transfer");
                    return Err(FtError::local_io(&path, short));
                }
                write_all_timed(out, &buf[..n], io_ms, "payload write").await?;
                digest.update(&buf[..n]);
                remaining -= n as u64;
            }
        }
    }
    Ok(TransferSummary {
        kind,
        bytes: digest.bytes(),
        digest: digest.finish(),
    })
}

async fn read_timed<R>(input: &mut R, buf: &mut [u8], ms: u64) -> Result<usize>
where
    R: AsyncRead + Unpin,
{
    match timeout(Duration::from_millis(ms), input.read(buf)).await {
        Ok(Ok(n)) => Ok(n),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(FtError::DataChannelTimeout { stage: "payload read", ms }),
    }
}

/// Read one payload of `expected_kind` from the data channel into `sink`.
///
/// `sink_name` only labels local write errors.
pub async fn receive_payload<R, W>(
    input: &mut R,
    expected_kind: u8,
    sink: &mut W,
    sink_name: &Path,
    io_ms: u64,
    progress: &TransferProgress,
) -> Result<TransferSummary>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut header = [0u8; DATA_HEADER_LEN];
    match timeout(Duration::from_millis(io_ms), input.read_exact(&mut header)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(FtError::Protocol("data channel closed before the payload header".into()));
        }
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => return Err(FtError::DataChannelTimeout { stage: "payload header read", ms: io_ms }),
    }
    let (kind, len) = parse_data_header(&header)?;
    if kind != expected_kind {
        return Err(FtError::Protocol(format!(
            "unexpected payload kind {} (expected {})",
            kind, expected_kind
        )));
    }
    progress.set_length(len);

    let mut digest = PayloadDigest::new();
    let mut buf = vec![0u8; TRANSFER_BUF_SIZE];
    let mut remaining = len;
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = read_timed(input, &mut buf[..want], io_ms).await?;
        if n == 0 {
            return Err(FtError::Protocol(format!(
                "data channel closed after {} of {} bytes",
                len - remaining,
                len
            )));
        }
        sink.write_all(&buf[..n])
            .await
            .map_err(|e| FtError::local_io(sink_name, e))?;
        digest.update(&buf[..n]);
        progress.inc(n as u64);
        remaining -= n as u64;
    }
    sink.flush().await.map_err(|e| FtError::local_io(sink_name, e))?;
    Ok(TransferSummary {
        kind,
        bytes: digest.bytes(),
        digest: digest.finish(),
    })
}

/// Local name for a received file: `name`, or `name-COPY` (repeated) until
/// nothing in `dir` has that name. Returns the path and whether it changed.
pub fn resolve_collision(dir: &Path, name: &str) -> (PathBuf, bool) {
    let mut candidate = name.to_string();
    let mut renamed = false;
    // symlink_metadata also catches dangling links
    while std::fs::symlink_metadata(dir.join(&candidate)).is_ok() {
        candidate.push_str(COPY_SUFFIX);
        renamed = true;
    }
    (dir.join(candidate), renamed)
}

/// Where a retrieved file ended up
#[derive(Debug, Clone)]
pub struct SavedFile {
    pub path: PathBuf,
    pub renamed: bool,
    pub summary: TransferSummary,
}

/// Receive a file payload into `dir` without ever overwriting an existing
/// file. Bytes land in a temp file first; a failed transfer leaves nothing
/// behind.
pub async fn receive_file<R>(
    input: &mut R,
    name: &str,
    dir: &Path,
    io_ms: u64,
    progress: &TransferProgress,
) -> Result<SavedFile>
where
    R: AsyncRead + Unpin,
{
    let (target, renamed) = resolve_collision(dir, name);
    let tmp = tempfile::Builder::new()
        .prefix(".ftlink-")
        .suffix(".part")
        .tempfile_in(dir)
        .map_err(|e| FtError::local_io(dir, e))?;
    let handle = tmp.reopen().map_err(|e| FtError::local_io(tmp.path(), e))?;
    let mut file = tokio::fs::File::from_std(handle);

    let summary = receive_payload(input, payload_kind::FILE, &mut file, &target, io_ms, progress).await?;
    file.sync_all().await.map_err(|e| FtError::local_io(&target, e))?;
    drop(file);

    tmp.persist_noclobber(&target)
        .map_err(|e| FtError::local_io(&target, e.error))?;
    Ok(SavedFile {
        path: target,
        renamed,
        summary,
    })
}
