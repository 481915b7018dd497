//! Length-prefixed frames: a little-endian `u32` length followed by the payload.

use anyhow::{bail, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame accepted from a peer (1 MiB).
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

pub async fn write_frame<W>(stream: &mut W, data: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if data.len() > MAX_FRAME_LEN {
        bail!("frame of {} bytes exceeds limit", data.len());
    }
    let len = data.len() as u32;
    stream.write_u32_le(len).await?;
    stream.write_all(data).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` means the peer closed the stream cleanly
/// before sending a length.
pub async fn read_frame<R>(stream: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let len = match stream.read_u32_le().await {
        Ok(v) => v as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        bail!("peer announced frame of {len} bytes");
    }

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(Some(buf))
}
