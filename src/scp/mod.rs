//! The SCP wire protocol, spoken over an exec channel's byte stream.
//!
//! SCP is not a standalone protocol: the remote side is just `scp -t`
//! (sink, receiving an upload) or `scp -f` (source, producing a download)
//! started over SSH, and both ends exchange a small line-oriented framing
//! on the channel:
//!
//! * `C<mode> <size> <name>\n` announces a file, followed after an
//!   acknowledgement by exactly `size` raw bytes and a trailing `\0`;
//! * `D<mode> 0 <name>\n` enters a directory, `E\n` leaves it;
//! * every record is answered with one acknowledgement byte — `0` for ok,
//!   `1` (error) or `2` (fatal) followed by a message line that this
//!   implementation surfaces verbatim as an [`ExecError`].
//!
//! Both state machines here are generic over any `AsyncRead + AsyncWrite`
//! stream, so tests drive the two ends of a [`tokio::io::duplex`] pipe
//! against each other and the remote executor plugs in a channel stream.
//! A transfer either runs to a clean final acknowledgement or returns an
//! error; short reads and unexpected bytes never pass silently.

mod sink;
mod source;

pub use sink::receive_into;
pub use source::send_local;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ExecError, ExecResult};

/// Acknowledgement byte: record accepted.
pub(crate) const ACK_OK: u8 = 0;

/// Acknowledgement byte: record failed, message line follows.
pub(crate) const ACK_ERROR: u8 = 1;

/// Acknowledgement byte: unrecoverable failure, message line follows.
pub(crate) const ACK_FATAL: u8 = 2;

/// Chunk size for streaming file bodies (64 KB).
pub(crate) const TRANSFER_BUFFER_SIZE: usize = 64 * 1024;

/// Cap on one protocol header or error line.
pub(crate) const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Send one acknowledgement byte.
pub(crate) async fn send_ack<S>(stream: &mut S) -> ExecResult<()>
where
    S: AsyncWrite + Unpin + Send,
{
    stream.write_all(&[ACK_OK]).await?;
    stream.flush().await?;
    Ok(())
}

/// Read the peer's acknowledgement of the last record.
///
/// `0` is success; `1` and `2` carry a message line that is raised as
/// [`ExecError::TransferRejected`]. Anything else, including EOF, is a
/// protocol violation.
pub(crate) async fn read_ack<S>(stream: &mut S) -> ExecResult<()>
where
    S: AsyncRead + Unpin + Send,
{
    let mut byte = [0u8; 1];
    let n = stream.read(&mut byte).await?;
    if n == 0 {
        return Err(ExecError::Protocol(
            "stream closed while awaiting acknowledgement".to_string(),
        ));
    }

    match byte[0] {
        ACK_OK => Ok(()),
        ACK_ERROR | ACK_FATAL => {
            let message = read_line(stream).await?;
            Err(ExecError::TransferRejected(message))
        }
        other => Err(ExecError::Protocol(format!(
            "unexpected acknowledgement byte 0x{:02x}",
            other
        ))),
    }
}

/// Read up to and excluding the next `\n`.
pub(crate) async fn read_line<S>(stream: &mut S) -> ExecResult<String>
where
    S: AsyncRead + Unpin + Send,
{
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(ExecError::Protocol(
                "stream closed in the middle of a protocol line".to_string(),
            ));
        }
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
        if line.len() > MAX_LINE_LENGTH {
            return Err(ExecError::Protocol("protocol line too long".to_string()));
        }
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}

/// Parse the body of a `C`/`D` record: `<octal-mode> <size> <name>`.
///
/// The control byte has already been consumed; `name` may contain spaces.
pub(crate) fn parse_header(line: &str) -> ExecResult<(u32, u64, String)> {
    let bad = || ExecError::Protocol(format!("malformed transfer header `{}`", line));

    let mut parts = line.splitn(3, ' ');
    let mode_str = parts.next().ok_or_else(bad)?;
    let size_str = parts.next().ok_or_else(bad)?;
    let name = parts.next().ok_or_else(bad)?;

    let mode = u32::from_str_radix(mode_str, 8).map_err(|_| bad())?;
    let size = size_str.parse::<u64>().map_err(|_| bad())?;

    if name.is_empty() {
        return Err(bad());
    }

    Ok((mode, size, name.to_string()))
}

/// Refuse names that would escape the directory being written.
pub(crate) fn validate_entry_name(name: &str) -> ExecResult<()> {
    if name == "." || name == ".." || name.contains('/') || name.contains('\0') {
        return Err(ExecError::Protocol(format!(
            "refusing unsafe entry name `{}`",
            name.escape_default()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    mod acks {
        use super::*;

        #[tokio::test]
        async fn test_ok_ack() {
            let (mut near, mut far) = tokio::io::duplex(64);
            far.write_all(&[ACK_OK]).await.unwrap();
            read_ack(&mut near).await.unwrap();
        }

        #[tokio::test]
        async fn test_error_ack_carries_message() {
            let (mut near, mut far) = tokio::io::duplex(64);
            far.write_all(b"\x01disk full\n").await.unwrap();

            let err = read_ack(&mut near).await.unwrap_err();
            assert!(err.to_string().contains("disk full"));
        }

        #[tokio::test]
        async fn test_fatal_ack_carries_message() {
            let (mut near, mut far) = tokio::io::duplex(64);
            far.write_all(b"\x02scp: permission denied\n").await.unwrap();

            let err = read_ack(&mut near).await.unwrap_err();
            assert!(err.to_string().contains("permission denied"));
        }

        #[tokio::test]
        async fn test_eof_is_a_protocol_error() {
            let (mut near, far) = tokio::io::duplex(64);
            drop(far);
            assert!(matches!(
                read_ack(&mut near).await,
                Err(ExecError::Protocol(_))
            ));
        }

        #[tokio::test]
        async fn test_garbage_byte_is_rejected() {
            let (mut near, mut far) = tokio::io::duplex(64);
            far.write_all(b"Z").await.unwrap();
            assert!(matches!(
                read_ack(&mut near).await,
                Err(ExecError::Protocol(_))
            ));
        }
    }

    mod headers {
        use super::*;

        #[test]
        fn test_file_header() {
            let (mode, size, name) = parse_header("0644 1234 report.txt").unwrap();
            assert_eq!(mode, 0o644);
            assert_eq!(size, 1234);
            assert_eq!(name, "report.txt");
        }

        #[test]
        fn test_name_may_contain_spaces() {
            let (_, _, name) = parse_header("0644 10 with spaces.txt").unwrap();
            assert_eq!(name, "with spaces.txt");
        }

        #[test]
        fn test_directory_header() {
            let (mode, size, name) = parse_header("0755 0 subdir").unwrap();
            assert_eq!(mode, 0o755);
            assert_eq!(size, 0);
            assert_eq!(name, "subdir");
        }

        #[test]
        fn test_malformed_headers_rejected() {
            assert!(parse_header("").is_err());
            assert!(parse_header("0644").is_err());
            assert!(parse_header("0644 12").is_err());
            assert!(parse_header("notoctal9 12 f").is_err());
            assert!(parse_header("0644 notanumber f").is_err());
        }
    }

    mod names {
        use super::*;

        #[test]
        fn test_plain_names_pass() {
            validate_entry_name("file.txt").unwrap();
            validate_entry_name(".hidden").unwrap();
        }

        #[test]
        fn test_traversal_names_refused() {
            assert!(validate_entry_name("..").is_err());
            assert!(validate_entry_name(".").is_err());
            assert!(validate_entry_name("a/b").is_err());
            assert!(validate_entry_name("/etc/passwd").is_err());
        }
    }
}
