use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tracing::instrument;

/// Trait for line-oriented conversations.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Io: Send {
    /// Receives a line, or `None` once the conversation is over.
    async fn recv(&mut self) -> io::Result<Option<String>>;

    /// Sends a message, which may span several lines.
    async fn send(&mut self, msg: &str) -> io::Result<()>;

    /// Flushes the internal buffers.
    async fn flush(&mut self) -> io::Result<()>;
}

/// An [`Io`] interface over a pair of byte streams.
#[derive(Debug)]
pub struct Pipe<W: AsyncWrite, R: AsyncRead> {
    writer: W,
    reader: Lines<BufReader<R>>,
}

impl<W: AsyncWrite, R: AsyncRead> Pipe<W, R> {
    pub fn new(writer: W, reader: R) -> Self {
        Pipe {
            writer,
            reader: BufReader::new(reader).lines(),
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Send + Unpin, R: AsyncRead + Send + Unpin> Io for Pipe<W, R> {
    #[instrument(level = "trace", skip(self), ret, err)]
    async fn recv(&mut self) -> io::Result<Option<String>> {
        self.reader.next_line().await
    }

    #[instrument(level = "trace", skip(self), err)]
    async fn send(&mut self, msg: &str) -> io::Result<()> {
        self.writer.write_all(msg.as_bytes()).await?;
        if !msg.ends_with('\n') {
            self.writer.write_u8(b'\n').await?;
        }

        Ok(())
    }

    #[instrument(level = "trace", skip(self), err)]
    async fn flush(&mut self) -> io::Result<()> {
        self.writer.flush().await
    }
}
