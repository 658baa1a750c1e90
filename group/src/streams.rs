use anyhow::Context;
use bytes::Buf;
use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::instrument;

/// Type alias for boxed write stream (TCP write half or in-memory pipe)
pub type BoxedWrite = Box<dyn AsyncWrite + Unpin + Send>;
/// Type alias for boxed read stream (TCP read half or in-memory pipe)
pub type BoxedRead = Box<dyn AsyncRead + Unpin + Send>;

/// Framed send stream for length-delimited messages.
///
/// Generic over the underlying writer type - works with TCP or any AsyncWrite.
pub struct SendStream<W = BoxedWrite> {
    framed: tokio_util::codec::FramedWrite<W, tokio_util::codec::LengthDelimitedCodec>,
}

impl<W: AsyncWrite + Unpin> SendStream<W> {
    pub fn new(stream: W) -> Self {
        let framed = tokio_util::codec::FramedWrite::new(
            stream,
            tokio_util::codec::LengthDelimitedCodec::new(),
        );
        Self { framed }
    }

    pub async fn send_batch_message<T: serde::Serialize>(&mut self, obj: &T) -> anyhow::Result<()> {
        let bytes = bincode::serialize(obj)?;
        self.framed.send(bytes::Bytes::from(bytes)).await?;
        Ok(())
    }

    pub async fn send_control_message<T: serde::Serialize>(
        &mut self,
        obj: &T,
    ) -> anyhow::Result<()> {
        self.send_batch_message(obj).await?;
        SinkExt::<bytes::Bytes>::flush(&mut self.framed).await?;
        Ok(())
    }

    /// Sends an object followed by raw, unframed bytes.
    ///
    /// The receiver must know the payload size from the object and read it with
    /// [`RecvStream::recv_exact`] before expecting the next message.
    #[instrument(level = "trace", skip(self, obj, data), fields(len = data.len()))]
    pub async fn send_message_with_bytes<T: serde::Serialize>(
        &mut self,
        obj: &T,
        data: &[u8],
    ) -> anyhow::Result<()> {
        self.send_control_message(obj).await?;
        let data_stream = self.framed.get_mut();
        data_stream
            .write_all(data)
            .await
            .context("failed to write payload")?;
        data_stream.flush().await?;
        Ok(())
    }
}

/// Framed receive stream for length-delimited messages.
///
/// Generic over the underlying reader type - works with TCP or any AsyncRead.
pub struct RecvStream<R = BoxedRead> {
    framed: tokio_util::codec::FramedRead<R, tokio_util::codec::LengthDelimitedCodec>,
}

impl<R: AsyncRead + Unpin> RecvStream<R> {
    pub fn new(stream: R) -> Self {
        let framed = tokio_util::codec::FramedRead::new(
            stream,
            tokio_util::codec::LengthDelimitedCodec::new(),
        );
        Self { framed }
    }

    /// Receives the next message, `None` once the peer closed the stream.
    pub async fn recv_object<T: serde::de::DeserializeOwned>(
        &mut self,
    ) -> anyhow::Result<Option<T>> {
        if let Some(frame) = futures::StreamExt::next(&mut self.framed).await {
            let bytes = frame?;
            let obj = bincode::deserialize(&bytes)?;
            Ok(Some(obj))
        } else {
            Ok(None)
        }
    }

    /// Fills `buf` with the raw bytes that follow the last received message.
    ///
    /// Bytes already pulled into the framed reader's buffer are consumed first, the rest is
    /// read straight from the underlying stream, leaving it positioned at the next message.
    #[instrument(level = "trace", skip(self, buf), fields(len = buf.len()))]
    pub async fn recv_exact(&mut self, buf: &mut [u8]) -> anyhow::Result<()> {
        let read_buffer = self.framed.read_buffer_mut();
        let buffered = read_buffer.len().min(buf.len());
        if buffered > 0 {
            buf[..buffered].copy_from_slice(&read_buffer[..buffered]);
            read_buffer.advance(buffered);
        }
        if buffered == buf.len() {
            return Ok(());
        }
        let expected = buf.len();
        let data_stream = self.framed.get_mut();
        data_stream
            .read_exact(&mut buf[buffered..])
            .await
            .with_context(|| format!("unexpected EOF while receiving {expected} payload bytes"))?;
        Ok(())
    }
}
