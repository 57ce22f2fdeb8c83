//! Duplex message channel towards the downstream client.

use std::{io::ErrorKind, pin::Pin, sync::Arc, time::Duration};

use {
    async_trait::async_trait,
    futures::Stream,
    tokio::{
        io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Stdin, Stdout},
        sync::Mutex,
    },
    tracing::{debug, trace},
};

use crate::error::{Result, RouterError};

/// Send attempts on "temporarily unavailable" before giving up.
pub const MAX_SEND_ATTEMPTS: u32 = 5;
const SEND_RETRY_DELAY: Duration = Duration::from_millis(20);

pub type FrameStream<'a> = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send + 'a>>;

#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Write one complete frame.
    async fn send(&self, frame: &[u8]) -> Result<()>;

    /// Lazily read incoming frames until the peer closes. Calling this again
    /// resumes after the last frame any earlier stream consumed.
    fn frames(&self) -> FrameStream<'_>;
}

/// Newline-delimited JSON frames over any async reader/writer pair.
pub struct LineChannel<R, W> {
    reader: Arc<Mutex<BufReader<R>>>,
    writer: Mutex<W>,
}

pub type StdioChannel = LineChannel<Stdin, Stdout>;

impl StdioChannel {
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }
}

impl<R, W> LineChannel<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: Arc::new(Mutex::new(BufReader::new(reader))),
            writer: Mutex::new(writer),
        }
    }

    async fn write_frame(writer: &mut W, frame: &[u8]) -> std::io::Result<()> {
        writer.write_all(frame).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await
    }
}

fn is_transient(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::WouldBlock | ErrorKind::Interrupted)
}

#[async_trait]
impl<R, W> MessageChannel for LineChannel<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&self, frame: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match Self::write_frame(&mut writer, frame).await {
                Ok(()) => {
                    trace!(bytes = frame.len(), "frame sent");
                    return Ok(());
                },
                Err(e) if is_transient(e.kind()) && attempt < MAX_SEND_ATTEMPTS => {
                    debug!(attempt, error = %e, "channel busy, retrying send");
                    tokio::time::sleep(SEND_RETRY_DELAY * attempt).await;
                },
                Err(e) => {
                    return Err(RouterError::message(format!(
                        "send failed after {attempt} attempt(s): {e}"
                    )));
                },
            }
        }
    }

    fn frames(&self) -> FrameStream<'_> {
        let reader = Arc::clone(&self.reader);
        Box::pin(async_stream::stream! {
            loop {
                let mut line = String::new();
                let read = reader.lock().await.read_line(&mut line).await;
                match read {
                    Ok(0) => break,
                    Ok(_) => {
                        let trimmed = line.trim();
                        if !trimmed.is_empty() {
                            yield Ok(trimmed.as_bytes().to_vec());
                        }
                    },
                    Err(e) => {
                        yield Err(RouterError::Io(e));
                        break;
                    },
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        futures::StreamExt,
        tokio::io::{AsyncReadExt, duplex},
    };

    #[tokio::test]
    async fn frames_split_on_newlines_and_skip_blanks() {
        let (mut client, server) = duplex(1024);
        let (server_read, server_write) = tokio::io::split(server);
        let channel = LineChannel::new(server_read, server_write);

        client
            .write_all(b"{\"a\":1}\n\n  {\"b\":2}  \n")
            .await
            .unwrap();
        drop(client);

        let frames: Vec<_> = channel.frames().collect().await;
        let frames: Vec<Vec<u8>> = frames.into_iter().map(|f| f.unwrap()).collect();
        assert_eq!(frames, vec![b"{\"a\":1}".to_vec(), b"{\"b\":2}".to_vec()]);
    }

    #[tokio::test]
    async fn frames_resume_across_streams() {
        let (mut client, server) = duplex(1024);
        let (server_read, server_write) = tokio::io::split(server);
        let channel = LineChannel::new(server_read, server_write);
        client.write_all(b"one\ntwo\n").await.unwrap();
        drop(client);

        let first = channel.frames().next().await.unwrap().unwrap();
        assert_eq!(first, b"one");
        let rest: Vec<_> = channel.frames().collect().await;
        assert_eq!(rest.len(), 1);
    }

    #[tokio::test]
    async fn send_appends_newline() {
        let (client, server) = duplex(1024);
        let (server_read, server_write) = tokio::io::split(server);
        let channel = LineChannel::new(server_read, server_write);
        channel.send(b"{\"ok\":true}").await.unwrap();
        drop(channel);

        let mut out = String::new();
        let (mut client_read, _client_write) = tokio::io::split(client);
        client_read.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "{\"ok\":true}\n");
    }
}
