//! JSON-lines framing for overlay connections.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use cairn_shared::constants::MAX_WIRE_LINE;
use cairn_shared::FloodMessage;

use crate::error::NetError;

/// Read one message. `Ok(None)` on a clean end of stream.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<FloodMessage>, NetError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let read = (&mut *reader)
        .take(MAX_WIRE_LINE as u64 + 1)
        .read_until(b'\n', &mut buf)
        .await?;

    if read == 0 {
        return Ok(None);
    }
    if buf.last() != Some(&b'\n') {
        if buf.len() > MAX_WIRE_LINE {
            return Err(NetError::LineTooLong { max: MAX_WIRE_LINE });
        }
        // Peer closed mid-line.
        return Err(NetError::ConnectionClosed);
    }

    let line = std::str::from_utf8(&buf)
        .map_err(|e| NetError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
    Ok(Some(FloodMessage::from_line(line)?))
}

pub async fn write_message<W>(writer: &mut W, message: &FloodMessage) -> Result<(), NetError>
where
    W: AsyncWrite + Unpin,
{
    let line = message.to_line()?;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
