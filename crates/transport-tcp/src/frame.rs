//! Length-prefixed framing (u32 BE length, then the frame bytes).

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame; anything larger is treated as a protocol violation.
pub const MAX_FRAME_LEN: usize = 10 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame of {0} bytes exceeds the 10 MiB limit")]
    TooLarge(usize),
    #[error("malformed json frame: {0}")]
    Json(#[from] serde_json::Error),
}

impl FrameError {
    /// True when the peer closed the stream cleanly between frames.
    pub fn is_eof(&self) -> bool {
        matches!(self, FrameError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }
}

pub async fn write_frame<T: AsyncWrite + Unpin + Send>(
    transport: &mut T,
    data: &[u8],
) -> Result<(), FrameError> {
    if data.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(data.len()));
    }
    transport.write_all(&(data.len() as u32).to_be_bytes()).await?;
    transport.write_all(data).await?;
    transport.flush().await?;
    Ok(())
}

pub async fn read_frame<T: AsyncRead + Unpin + Send>(
    transport: &mut T,
) -> Result<Vec<u8>, FrameError> {
    let mut lenb = [0u8; 4];
    transport.read_exact(&mut lenb).await?;
    let len = u32::from_be_bytes(lenb) as usize;

    // Sanity check to prevent memory exhaustion
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }

    let mut buf = vec![0u8; len];
    transport.read_exact(&mut buf).await?;
    Ok(buf)
}

pub async fn write_json<T, M>(transport: &mut T, message: &M) -> Result<(), FrameError>
where
    T: AsyncWrite + Unpin + Send,
    M: Serialize,
{
    let bytes = serde_json::to_vec(message)?;
    write_frame(transport, &bytes).await
}

pub async fn read_json<T, M>(transport: &mut T) -> Result<M, FrameError>
where
    T: AsyncRead + Unpin + Send,
    M: DeserializeOwned,
{
    let bytes = read_frame(transport).await?;
    Ok(serde_json::from_slice(&bytes)?)
}
