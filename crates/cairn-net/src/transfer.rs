//! Direct file transfer between two nodes.
//!
//! The requester opens a fresh connection and sends `file_request`. The
//! serving side answers with a `file_header` line followed by exactly `size`
//! raw bytes, or a single `file_not_found` line, then closes. Nothing is
//! retried here; failures surface to the caller.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info};

use cairn_shared::FloodMessage;

use crate::error::NetError;
use crate::wire::{read_message, write_message};

/// Download `filename` (optionally pinned to `file_id`) from `host:port`.
///
/// Returns the bytes exactly as the peer stores them. Transfers announcing
/// more than `max_size` bytes are refused before any payload is read.
/// `timeout` applies to the connect and the header, and separately to
/// every payload read after them.
pub async fn fetch_file(
    host: &str,
    port: u16,
    filename: &str,
    file_id: Option<&str>,
    max_size: usize,
    timeout: Duration,
) -> Result<Vec<u8>, NetError> {
    let endpoint = format!("{host}:{port}");
    let stream = tokio::time::timeout(timeout, TcpStream::connect(&endpoint))
        .await
        .map_err(|_| NetError::Timeout(format!("connect to {endpoint}")))??;

    let (read, mut write) = stream.into_split();
    write_message(
        &mut write,
        &FloodMessage::FileRequest {
            filename: filename.to_string(),
            file_id: file_id.map(str::to_string),
        },
    )
    .await?;

    let mut reader = BufReader::new(read);
    let header = tokio::time::timeout(timeout, read_message(&mut reader))
        .await
        .map_err(|_| NetError::Timeout(format!("header from {endpoint}")))??;

    let size = match header {
        Some(FloodMessage::FileHeader { size, .. }) => size,
        Some(FloodMessage::FileNotFound { filename }) => {
            return Err(NetError::FileNotFound(filename))
        }
        Some(other) => {
            return Err(NetError::Handshake(format!(
                "unexpected {} in reply to file_request",
                other.kind()
            )))
        }
        None => return Err(NetError::ConnectionClosed),
    };

    if size > max_size as u64 {
        return Err(NetError::TooLarge {
            size,
            max: max_size,
        });
    }

    let data = read_payload(&mut reader, size as usize, timeout, &endpoint).await?;

    info!(peer = %endpoint, filename = %filename, size, "File downloaded");
    Ok(data)
}

/// Read exactly `size` payload bytes. `idle` bounds each read, so a slow
/// but moving transfer completes while a stalled one fails.
async fn read_payload<R>(
    reader: &mut R,
    size: usize,
    idle: Duration,
    endpoint: &str,
) -> Result<Vec<u8>, NetError>
where
    R: AsyncRead + Unpin,
{
    let mut data = vec![0u8; size];
    let mut filled = 0;
    while filled < size {
        let n = tokio::time::timeout(idle, reader.read(&mut data[filled..]))
            .await
            .map_err(|_| {
                NetError::Timeout(format!("payload from {endpoint} stalled at {filled}/{size} bytes"))
            })??;
        if n == 0 {
            return Err(NetError::ConnectionClosed);
        }
        filled += n;
    }
    Ok(data)
}

/// Answer one `file_request` on `writer`.
pub(crate) async fn serve_file<W>(
    writer: &mut W,
    filename: &str,
    data: Option<Vec<u8>>,
) -> Result<(), NetError>
where
    W: AsyncWrite + Unpin,
{
    match data {
        Some(bytes) => {
            write_message(
                writer,
                &FloodMessage::FileHeader {
                    filename: filename.to_string(),
                    size: bytes.len() as u64,
                },
            )
            .await?;
            writer.write_all(&bytes).await?;
            writer.flush().await?;
            debug!(filename = %filename, size = bytes.len(), "File served");
        }
        None => {
            write_message(
                writer,
                &FloodMessage::FileNotFound {
                    filename: filename.to_string(),
                },
            )
            .await?;
            debug!(filename = %filename, "Requested file not found");
        }
    }
    writer.shutdown().await?;
    Ok(())
}
