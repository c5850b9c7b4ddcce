//! Coordinator side of a worker's stdio channel.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::Mutex;

use super::container::JobContainer;
use super::stdconn::{read_frame, write_frame, WorkerRequest};
use crate::error::KopachError;

struct Pipe<W, R> {
    writer: W,
    reader: R,
}

/// Sends commands to one worker and waits for its acknowledgement.
pub struct WorkerClient<W = ChildStdin, R = ChildStdout> {
    pipe: Mutex<Pipe<W, R>>,
}

impl WorkerClient {
    /// Takes over the child's stdin/stdout. Fails if they were not piped.
    pub fn from_child(child: &mut Child) -> Result<Self, KopachError> {
        let writer = child.stdin.take().ok_or(KopachError::ChannelClosed)?;
        let reader = child.stdout.take().ok_or(KopachError::ChannelClosed)?;
        Ok(Self::new(writer, reader))
    }
}

impl<W, R> WorkerClient<W, R>
where
    W: AsyncWrite + Unpin + Send,
    R: AsyncRead + Unpin + Send,
{
    pub fn new(writer: W, reader: R) -> Self {
        Self {
            pipe: Mutex::new(Pipe { writer, reader }),
        }
    }

    async fn call(&self, request: &WorkerRequest) -> Result<bool, KopachError> {
        let mut pipe = self.pipe.lock().await;
        write_frame(&mut pipe.writer, request).await?;
        read_frame::<_, bool>(&mut pipe.reader)
            .await?
            .ok_or(KopachError::ChannelClosed)
    }

    pub async fn new_job(&self, job: &JobContainer) -> Result<(), KopachError> {
        if self.call(&WorkerRequest::NewJob(job.clone())).await? {
            Ok(())
        } else {
            Err(KopachError::NewJobNotAcknowledged)
        }
    }

    pub async fn pause(&self) -> Result<(), KopachError> {
        if self.call(&WorkerRequest::Pause).await? {
            Ok(())
        } else {
            Err(KopachError::PauseNotAcknowledged)
        }
    }

    pub async fn stop(&self) -> Result<(), KopachError> {
        if self.call(&WorkerRequest::Stop).await? {
            Ok(())
        } else {
            Err(KopachError::StopNotAcknowledged)
        }
    }

    pub async fn send_pass(&self, pass: &str) -> Result<(), KopachError> {
        if self.call(&WorkerRequest::SendPass(pass.to_string())).await? {
            Ok(())
        } else {
            Err(KopachError::SendPassNotAcknowledged)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_refused_command_maps_to_error() {
        let (client_w, mut server_r) = tokio::io::duplex(1024);
        let (mut server_w, client_r) = tokio::io::duplex(1024);
        let client = WorkerClient::new(client_w, client_r);

        let server = tokio::spawn(async move {
            let req: Option<WorkerRequest> = read_frame(&mut server_r).await.unwrap();
            assert_eq!(req, Some(WorkerRequest::Pause));
            write_frame(&mut server_w, &true).await.unwrap();
            let req: Option<WorkerRequest> = read_frame(&mut server_r).await.unwrap();
            assert_eq!(req, Some(WorkerRequest::Stop));
            write_frame(&mut server_w, &false).await.unwrap();
        });

        client.pause().await.unwrap();
        assert!(matches!(
            client.stop().await,
            Err(KopachError::StopNotAcknowledged)
        ));
        server.await.unwrap();

        // the worker end is gone
        assert!(matches!(
            client.send_pass("x").await,
            Err(KopachError::ChannelClosed) | Err(KopachError::Io(_))
        ));
    }
}
