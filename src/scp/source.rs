//! Source half of the transfer protocol: streaming local files up.
//!
//! The remote sink speaks first with one acknowledgement byte; after that
//! every record we send (`C` file header, `D`/`E` directory bracketing,
//! file body with its trailing `\0`) is confirmed before the next one
//! goes out. A rejected record surfaces the sink's message and aborts the
//! transfer.

use std::path::Path;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::{ExecError, ExecResult};

use super::{TRANSFER_BUFFER_SIZE, read_ack};

/// Fallback permission bits on platforms without a Unix mode.
#[cfg(not(unix))]
const DEFAULT_FILE_MODE: u32 = 0o644;
#[cfg(not(unix))]
const DEFAULT_DIR_MODE: u32 = 0o755;

/// Upload each path in `sources` through the source state machine.
///
/// Directories require `recursive` and are walked depth-first. Returns
/// the number of files plus directories sent.
pub async fn send_local<S>(
    stream: &mut S,
    sources: &[impl AsRef<Path>],
    recursive: bool,
) -> ExecResult<usize>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    // The sink opens the conversation.
    read_ack(stream).await?;

    let mut count = 0;
    for source in sources {
        count += send_entry(stream, source.as_ref(), recursive).await?;
    }
    Ok(count)
}

async fn send_entry<S>(stream: &mut S, path: &Path, recursive: bool) -> ExecResult<usize>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| ExecError::path(path.display().to_string(), e))?;

    let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
        return Err(ExecError::UnsafePath {
            path: path.display().to_string(),
            reason: "has no final path component".to_string(),
        });
    };

    if meta.is_dir() {
        if !recursive {
            return Err(ExecError::UnsafePath {
                path: path.display().to_string(),
                reason: "is a directory and recursive copy was not requested".to_string(),
            });
        }
        send_directory(stream, path, &name, entry_mode(&meta)).await
    } else {
        send_file(stream, path, &name, entry_mode(&meta), meta.len()).await?;
        Ok(1)
    }
}

/// Bracket a directory in `D`/`E` records and recurse into its children.
async fn send_directory<S>(
    stream: &mut S,
    path: &Path,
    name: &str,
    mode: u32,
) -> ExecResult<usize>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    debug!("Sending directory {}", path.display());
    let header = format!("D{:04o} 0 {}\n", mode, name);
    stream.write_all(header.as_bytes()).await?;
    stream.flush().await?;
    read_ack(stream).await?;

    let mut children = Vec::new();
    let mut entries = tokio::fs::read_dir(path)
        .await
        .map_err(|e| ExecError::path(path.display().to_string(), e))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| ExecError::path(path.display().to_string(), e))?
    {
        children.push(entry.path());
    }
    children.sort();

    let mut count = 1;
    for child in children {
        count += Box::pin(send_entry(stream, &child, true)).await?;
    }

    stream.write_all(b"E\n").await?;
    stream.flush().await?;
    read_ack(stream).await?;

    Ok(count)
}

/// Send one `C` record: header, acknowledged body, trailing `\0`.
async fn send_file<S>(
    stream: &mut S,
    path: &Path,
    name: &str,
    mode: u32,
    size: u64,
) -> ExecResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    debug!("Sending file {} ({} bytes)", path.display(), size);
    let header = format!("C{:04o} {} {}\n", mode, size, name);
    stream.write_all(header.as_bytes()).await?;
    stream.flush().await?;
    read_ack(stream).await?;

    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| ExecError::path(path.display().to_string(), e))?;

    let mut remaining = size;
    let mut buf = vec![0u8; TRANSFER_BUFFER_SIZE];
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = file
            .read(&mut buf[..want])
            .await
            .map_err(|e| ExecError::path(path.display().to_string(), e))?;
        if n == 0 {
            // The file shrank underneath us; the announced size can no
            // longer be honored.
            return Err(ExecError::Protocol(format!(
                "{} truncated during transfer ({} bytes short)",
                path.display(),
                remaining
            )));
        }
        stream.write_all(&buf[..n]).await?;
        remaining -= n as u64;
    }

    stream.write_all(&[super::ACK_OK]).await?;
    stream.flush().await?;
    read_ack(stream).await
}

#[cfg(unix)]
fn entry_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn entry_mode(meta: &std::fs::Metadata) -> u32 {
    if meta.is_dir() {
        DEFAULT_DIR_MODE
    } else {
        DEFAULT_FILE_MODE
    }
}
