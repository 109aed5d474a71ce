//! Line-framed JSON wire codec
//!
//! Every message is a single JSON object terminated by a newline:
//! ```text
//! {"cmd":"check_screen","mustmatch":["desktop"]}\n
//! ```
//! serde_json escapes newlines inside strings, so a frame never spans lines.

use serde_json::Value;
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame size (64 MB)
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Read one message from the stream
///
/// Returns `Ok(None)` once the peer has closed the stream, including when it
/// went away halfway through a frame. Blank lines are skipped. At most
/// `MAX_MESSAGE_SIZE` bytes are buffered for a single frame.
pub async fn read_message<R: AsyncBufRead + Unpin>(reader: &mut R) -> io::Result<Option<Value>> {
    loop {
        let mut frame = Vec::new();
        let bytes_read = (&mut *reader)
            .take(MAX_MESSAGE_SIZE as u64 + 1)
            .read_until(b'\n', &mut frame)
            .await?;

        if bytes_read == 0 {
            return Ok(None);
        }

        if frame.len() > MAX_MESSAGE_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Message exceeds {} bytes", MAX_MESSAGE_SIZE),
            ));
        }

        // Truncated frame: the peer is gone, nothing more will arrive
        if frame.last() != Some(&b'\n') {
            return Ok(None);
        }

        if frame.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        let value: Value = serde_json::from_slice(&frame).map_err(|e| {
            io::Error::new(io::ErrorKind::InvalidData, format!("Invalid JSON: {}", e))
        })?;

        if !value.is_object() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Message is not a JSON object",
            ));
        }

        return Ok(Some(value));
    }
}

/// Write one message to the stream
///
/// The frame is written with a single `write_all` and flushed.
pub async fn write_message<W: AsyncWrite + Unpin + ?Sized>(
    writer: &mut W,
    message: &Value,
) -> io::Result<()> {
    let mut frame = serde_json::to_vec(message)?;
    frame.push(b'\n');

    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
