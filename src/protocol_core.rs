//! Shared protocol logic for both the client and server halves
//!
//! Bounded control-line I/O, the data-channel header, and file-name rules.
//! Everything here is transport-agnostic so `net_async` and the tests can
//! drive it over any `AsyncRead`/`AsyncWrite`.

use std::path::{Path, PathBuf};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Duration};

use crate::error::{FtError, Result};
use crate::protocol::{DATA_HEADER_LEN, DATA_MAGIC, DATA_VERSION};

const MAX_FILE_NAME: usize = 255;

/// Check a file name before it goes on the wire or touches the filesystem.
///
/// Names are a single path component: no separators, no `.`/`..`, no
/// whitespace or control characters (the request line is whitespace-delimited).
pub fn validate_file_name(name: &str) -> std::result::Result<(), String> {
    if name.is_empty() {
        return Err("file name is empty".to_string());
    }
    if name == "." || name == ".." {
        return Err(format!("file name \"{}\" is not allowed", name));
    }
    if name.len() > MAX_FILE_NAME {
        return Err(format!("file name longer than {} bytes", MAX_FILE_NAME));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(format!("file name \"{}\" must not contain path separators", name));
    }
    if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err("file names containing whitespace or control characters are not supported".to_string());
    }
    Ok(())
}

/// Resolve a validated name inside the serving root.
///
/// The result is canonical and must stay under the canonical root, so a
/// symlink pointing elsewhere is refused.
pub fn normalize_under_root(root: &Path, name: &str) -> std::result::Result<PathBuf, String> {
    validate_file_name(name)?;
    let canon_root = root
        .canonicalize()
        .map_err(|e| format!("serving directory unavailable: {}", e))?;
    let joined = canon_root.join(name);
    let canon = joined
        .canonicalize()
        .map_err(|_| format!("file not found: {}", name))?;
    if !canon.starts_with(&canon_root) {
        return Err(format!("file \"{}\" escapes the serving directory", name));
    }
    Ok(canon)
}

/// Build the data-channel header
/// Format: MAGIC (4) | VERSION (2) | KIND (1) | LENGTH (8)
pub fn build_data_header(kind: u8, payload_len: u64) -> [u8; DATA_HEADER_LEN] {
    let mut header = [0u8; DATA_HEADER_LEN];
    header[0..4].copy_from_slice(DATA_MAGIC);
    header[4..6].copy_from_slice(&DATA_VERSION.to_le_bytes());
    header[6] = kind;
    header[7..15].copy_from_slice(&payload_len.to_le_bytes());
    header
}

/// Parse the data-channel header
/// Returns: (payload_kind, payload_length)
pub fn parse_data_header(header: &[u8; DATA_HEADER_LEN]) -> Result<(u8, u64)> {
    if &header[0..4] != DATA_MAGIC {
        return Err(FtError::Protocol("invalid magic in data header".into()));
    }
    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != DATA_VERSION {
        return Err(FtError::Protocol(format!(
            "data header version mismatch: got {}, expected {}",
            version, DATA_VERSION
        )));
    }
    let mut len = [0u8; 8];
    len.copy_from_slice(&header[7..15]);
    Ok((header[6], u64::from_le_bytes(len)))
}

/// Read one `\n`-terminated control line of at most `max` bytes.
///
/// Returns `Ok(None)` when the peer closed before sending anything. The
/// trailing line terminator is stripped.
pub async fn read_line_bounded<R>(
    reader: &mut R,
    max: usize,
    ms: u64,
    stage: &'static str,
) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::with_capacity(64);
    let mut limited = (&mut *reader).take(max as u64);
    let n = match timeout(Duration::from_millis(ms), limited.read_until(b'\n', &mut buf)).await {
        Ok(Ok(n)) => n,
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => return Err(FtError::DataChannelTimeout { stage, ms }),
    };
    if n == 0 {
        return Ok(None);
    }
    if buf.last() != Some(&b'\n') && n >= max {
        return Err(FtError::Protocol(format!("control line exceeds {} bytes", max)));
    }
    let line = String::from_utf8(buf)
        .map_err(|_| FtError::Protocol("control line is not valid UTF-8".into()))?;
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

#[inline]
pub async fn write_all_timed<W>(writer: &mut W, buf: &[u8], ms: u64, stage: &'static str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    match timeout(Duration::from_millis(ms), async {
        writer.write_all(buf).await?;
        writer.flush().await
    })
    .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(FtError::DataChannelTimeout { stage, ms }),
    }
}
