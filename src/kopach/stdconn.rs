//! Length-prefixed bincode framing over a worker's stdin/stdout.
//!
//! Frame format: `[4-byte length (u32 big-endian)][bincode payload]`.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::container::JobContainer;
use crate::error::KopachError;

/// Jobs are tiny; anything near this is a corrupt stream.
pub const MAX_FRAME_SIZE: u32 = 1024 * 1024;

/// Commands a coordinator sends to a worker. Every command is answered with
/// a single `bool` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkerRequest {
    NewJob(JobContainer),
    Pause,
    Stop,
    SendPass(String),
}

pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), KopachError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = bincode::serialize(value)?;
    if payload.len() > MAX_FRAME_SIZE as usize {
        return Err(KopachError::FrameTooLarge(payload.len()));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Returns `Ok(None)` when the other end closed the pipe.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, KopachError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_SIZE {
        return Err(KopachError::FrameTooLarge(len as usize));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some(bincode::deserialize(&payload)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, &WorkerRequest::SendPass("secret".into()))
            .await
            .unwrap();
        write_frame(&mut a, &WorkerRequest::Pause).await.unwrap();
        drop(a);

        let first: Option<WorkerRequest> = read_frame(&mut b).await.unwrap();
        assert_eq!(first, Some(WorkerRequest::SendPass("secret".into())));
        let second: Option<WorkerRequest> = read_frame(&mut b).await.unwrap();
        assert_eq!(second, Some(WorkerRequest::Pause));
        let eof: Option<WorkerRequest> = read_frame(&mut b).await.unwrap();
        assert!(eof.is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(MAX_FRAME_SIZE + 1).to_be_bytes()).await.unwrap();
        let res: Result<Option<bool>, _> = read_frame(&mut b).await;
        assert!(matches!(res, Err(KopachError::FrameTooLarge(_))));
    }
}
