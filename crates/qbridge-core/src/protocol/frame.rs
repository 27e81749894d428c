//! Message framing.
//!
//! Every message on the wire is a decimal payload length, one space, the
//! UTF-8 JSON payload, and a terminating newline:
//!
//! ```text
//! <len> <payload bytes of len>\n
//! ```
//!
//! The length does not count the newline.

use crate::config::ProtocolConfig;
use crate::{BridgeError, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Read one frame from an async reader.
///
/// Returns `None` on clean EOF before the first byte of a frame. Any other
/// deviation from the frame structure is an error.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> Result<Option<Vec<u8>>> {
    let mut digits = Vec::with_capacity(ProtocolConfig::MAX_LENGTH_DIGITS);
    loop {
        let byte = match reader.read_u8().await {
            Ok(byte) => byte,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                if digits.is_empty() {
                    return Ok(None);
                }
                return Err(BridgeError::framing("stream ended inside size"));
            }
            Err(e) => return Err(e.into()),
        };

        if byte == b' ' {
            break;
        }
        if !byte.is_ascii_digit() {
            return Err(BridgeError::framing(format!(
                "invalid size byte 0x{:02x}",
                byte
            )));
        }
        if digits.len() >= ProtocolConfig::MAX_LENGTH_DIGITS {
            return Err(BridgeError::framing("size prefix too long"));
        }
        digits.push(byte);
    }

    if digits.is_empty() {
        return Err(BridgeError::framing("invalid size"));
    }

    let len: usize = std::str::from_utf8(&digits)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| BridgeError::framing("invalid size"))?;

    if len < 1 {
        return Err(BridgeError::framing("size too short"));
    }
    if len > max_size {
        return Err(BridgeError::framing(format!(
            "message size {} exceeds maximum {}",
            len, max_size
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            BridgeError::framing("short read")
        } else {
            e.into()
        }
    })?;

    match reader.read_u8().await {
        Ok(b'\n') => Ok(Some(payload)),
        Ok(other) => Err(BridgeError::framing(format!(
            "expected terminating newline, read 0x{:02x}",
            other
        ))),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(BridgeError::framing("missing terminating newline"))
        }
        Err(e) => Err(e.into()),
    }
}

/// Write one frame to an async writer and flush it.
pub async fn write_frame<W: AsyncWrite + Unpin + ?Sized>(
    writer: &mut W,
    payload: &[u8],
) -> Result<()> {
    let mut frame = Vec::with_capacity(payload.len() + ProtocolConfig::MAX_LENGTH_DIGITS + 2);
    frame.extend_from_slice(payload.len().to_string().as_bytes());
    frame.push(b' ');
    frame.extend_from_slice(payload);
    frame.push(b'\n');

    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
