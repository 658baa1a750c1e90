//! Fixed-capacity byte buffer reused for every chunk of a transfer

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// One allocation of `capacity` bytes holding the current chunk.
///
/// The buffer never grows; `fill` and `receive_slot` overwrite the previous chunk, so at most
/// `capacity` bytes of stream data are resident per process no matter how large the stream is.
#[derive(Debug)]
pub struct ChunkBuffer {
    data: Box<[u8]>,
    len: usize,
}

impl ChunkBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "chunk capacity must be positive");
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of bytes of the current chunk
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes of the current chunk
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Reads until the buffer is full or the reader reports end of stream.
    ///
    /// Returns the new chunk length, 0 only if the reader was already exhausted.
    pub async fn fill<R: AsyncRead + Unpin + ?Sized>(
        &mut self,
        reader: &mut R,
    ) -> std::io::Result<usize> {
        self.len = 0;
        while self.len < self.data.len() {
            match reader.read(&mut self.data[self.len..]).await {
                Ok(0) => break,
                Ok(n) => self.len += n,
                Err(error) if error.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(error) => return Err(error),
            }
        }
        tracing::trace!("filled chunk with {} bytes", self.len);
        Ok(self.len)
    }

    /// Resizes the current chunk to `len` bytes and exposes them for an in-place receive.
    pub fn receive_slot(&mut self, len: usize) -> std::io::Result<&mut [u8]> {
        if len > self.data.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "chunk of {} bytes exceeds buffer capacity of {} bytes",
                    len,
                    self.data.len()
                ),
            ));
        }
        self.len = len;
        Ok(&mut self.data[..len])
    }

    /// Writes the whole current chunk, retrying partial writes.
    ///
    /// A write that accepts zero bytes is reported as [`std::io::ErrorKind::WriteZero`]
    /// (e.g. a full disk behind a pipe), it is never retried.
    pub async fn drain<W: AsyncWrite + Unpin + ?Sized>(
        &self,
        writer: &mut W,
    ) -> std::io::Result<()> {
        let mut written = 0;
        while written < self.len {
            match writer.write(&self.data[written..self.len]).await {
                Ok(0) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        format!(
                            "writer accepted 0 of the remaining {} bytes",
                            self.len - written
                        ),
                    ));
                }
                Ok(n) => written += n,
                Err(error) if error.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(error) => return Err(error),
            }
        }
        writer.flush().await
    }
}
