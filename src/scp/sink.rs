//! Sink half of the transfer protocol: receiving files onto local disk.
//!
//! The sink greets the source with an acknowledgement, then loops on
//! control records until the stream ends. `D` records push onto a
//! directory stack, `E` pops it, `C` records stream exactly the announced
//! number of bytes into a freshly created file. Every record and body is
//! acknowledged so the source can detect failures mid-transfer.

use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::{ExecError, ExecResult};

use super::{
    ACK_ERROR, ACK_FATAL, TRANSFER_BUFFER_SIZE, parse_header, read_ack, read_line, send_ack,
    validate_entry_name,
};

/// Receive a transfer into the local directory `target`.
///
/// The directory is created if missing. Returns the number of files plus
/// directories created. A `D` record without `recursive` is refused.
pub async fn receive_into<S>(stream: &mut S, target: &Path, recursive: bool) -> ExecResult<usize>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    tokio::fs::create_dir_all(target)
        .await
        .map_err(|e| ExecError::path(target.display().to_string(), e))?;

    // Greet the source; it sends nothing until this byte arrives.
    send_ack(stream).await?;

    let mut dirs: Vec<PathBuf> = vec![target.to_path_buf()];
    let mut count = 0;

    loop {
        let mut ctrl = [0u8; 1];
        let n = stream.read(&mut ctrl).await?;
        if n == 0 {
            if dirs.len() > 1 {
                return Err(ExecError::Protocol(
                    "stream ended inside an unterminated directory".to_string(),
                ));
            }
            break;
        }

        match ctrl[0] {
            b'C' => {
                let line = read_line(stream).await?;
                let (mode, size, name) = parse_header(&line)?;
                validate_entry_name(&name)?;

                // dirs always holds at least the target root.
                let dest = dirs[dirs.len() - 1].join(&name);
                receive_file(stream, &dest, mode, size).await?;
                count += 1;
            }
            b'D' => {
                if !recursive {
                    return Err(ExecError::Protocol(
                        "directory record in a non-recursive transfer".to_string(),
                    ));
                }
                let line = read_line(stream).await?;
                let (_mode, _size, name) = parse_header(&line)?;
                validate_entry_name(&name)?;

                let dest = dirs[dirs.len() - 1].join(&name);
                enter_directory(&dest).await?;
                dirs.push(dest);
                count += 1;
                send_ack(stream).await?;
            }
            b'E' => {
                // The record is just `E\n`.
                read_line(stream).await?;
                if dirs.len() <= 1 {
                    return Err(ExecError::Protocol(
                        "end-of-directory record without a matching directory".to_string(),
                    ));
                }
                dirs.pop();
                send_ack(stream).await?;
            }
            ACK_ERROR | ACK_FATAL => {
                let message = read_line(stream).await?;
                return Err(ExecError::TransferRejected(message));
            }
            other => {
                return Err(ExecError::Protocol(format!(
                    "unexpected control byte 0x{:02x}",
                    other
                )));
            }
        }
    }

    Ok(count)
}

/// Create (or verify) the local directory for a `D` record.
async fn enter_directory(dest: &Path) -> ExecResult<()> {
    match tokio::fs::metadata(dest).await {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(ExecError::UnsafePath {
            path: dest.display().to_string(),
            reason: "exists and is not a directory".to_string(),
        }),
        Err(_) => {
            debug!("Creating directory {}", dest.display());
            tokio::fs::create_dir(dest)
                .await
                .map_err(|e| ExecError::path(dest.display().to_string(), e))
        }
    }
}

/// Stream exactly `size` bytes of one `C` record into `dest`.
async fn receive_file<S>(stream: &mut S, dest: &Path, mode: u32, size: u64) -> ExecResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    debug!("Receiving file {} ({} bytes)", dest.display(), size);
    let mut file = tokio::fs::File::create(dest)
        .await
        .map_err(|e| ExecError::path(dest.display().to_string(), e))?;

    // Header accepted; the source streams the body next.
    send_ack(stream).await?;

    let mut remaining = size;
    let mut buf = vec![0u8; TRANSFER_BUFFER_SIZE];
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = stream.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(ExecError::Protocol(format!(
                "stream ended {} bytes short of the announced size of {}",
                remaining,
                dest.display()
            )));
        }
        file.write_all(&buf[..n])
            .await
            .map_err(|e| ExecError::path(dest.display().to_string(), e))?;
        remaining -= n as u64;
    }

    file.flush()
        .await
        .map_err(|e| ExecError::path(dest.display().to_string(), e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(dest, std::fs::Permissions::from_mode(mode & 0o7777))
            .await
            .map_err(|e| ExecError::path(dest.display().to_string(), e))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    // The source follows the body with its own status byte.
    read_ack(stream).await?;
    send_ack(stream).await
}
