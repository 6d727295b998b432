//! Async command framing over a byte stream.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::command::{Command, FRAME_HEADER_SIZE};
use crate::error::{Error, Result};

/// Read one complete command from an async stream.
///
/// The length prefix is read first; empty frames and frames larger than
/// `max_frame_size` are rejected before the body is allocated.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_frame_size: usize,
) -> Result<Command> {
    let mut size_buf = [0u8; FRAME_HEADER_SIZE];
    reader.read_exact(&mut size_buf).await?;

    let size = u32::from_be_bytes(size_buf) as usize;
    if size == 0 {
        return Err(Error::malformed("empty frame"));
    }
    if size > max_frame_size {
        return Err(Error::malformed(format!(
            "frame of {size} bytes exceeds maximum of {max_frame_size} bytes"
        )));
    }

    let mut body = vec![0u8; size];
    reader.read_exact(&mut body).await?;

    Command::decode(Bytes::from(body))
}

/// Write one command to an async stream and flush it.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, command: &Command) -> Result<()> {
    writer.write_all(&command.to_frame()?).await?;
    writer.flush().await?;
    Ok(())
}
