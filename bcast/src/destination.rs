//! Per-process side of the pipeline: materializes the byte stream at the destination.

use std::future::Future;
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use common::ChunkBuffer;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::Error;

/// Consumes the archive stream one chunk at a time.
pub trait ChunkSink: Send {
    /// Writes the whole current chunk.
    fn write_chunk(
        &mut self,
        chunk: &ChunkBuffer,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Ends the stream and waits until everything written is materialized.
    fn close(&mut self) -> impl Future<Output = Result<(), Error>> + Send;
}

/// Sink stream feeding `tar -xf - -C <destination>`
pub struct ArchiveSink {
    child: tokio::process::Child,
    stdin: Option<tokio::process::ChildStdin>,
    destination: PathBuf,
}

impl ArchiveSink {
    /// Creates `destination` (with parents) and starts the extractor in it.
    pub async fn open(tar: &Path, destination: &Path) -> Result<Self, Error> {
        let open_error = |cause: anyhow::Error| Error::SinkOpen {
            path: destination.to_path_buf(),
            cause,
        };
        tokio::fs::create_dir_all(destination)
            .await
            .context("cannot create destination directory")
            .map_err(open_error)?;
        let mut child = tokio::process::Command::new(tar)
            .arg("-xf")
            .arg("-")
            .arg("-C")
            .arg(destination)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start extractor {tar:?}"))
            .map_err(open_error)?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| open_error(anyhow!("extractor has no stdin")))?;
        tracing::debug!("extracting into {:?}", destination);
        Ok(Self {
            child,
            stdin: Some(stdin),
            destination: destination.to_path_buf(),
        })
    }
}

impl ChunkSink for ArchiveSink {
    async fn write_chunk(&mut self, chunk: &ChunkBuffer) -> Result<(), Error> {
        let stdin = self.stdin.as_mut().ok_or_else(|| Error::StreamWrite {
            cause: anyhow!("extractor input already closed"),
        })?;
        chunk
            .drain(stdin)
            .await
            .with_context(|| format!("extractor for {:?}", self.destination))
            .map_err(|cause| Error::StreamWrite { cause })
    }

    async fn close(&mut self) -> Result<(), Error> {
        let close_error = |cause: anyhow::Error| Error::SinkClose {
            path: self.destination.clone(),
            cause,
        };
        // dropping stdin is the end of the archive for the extractor
        if let Some(mut stdin) = self.stdin.take() {
            stdin
                .shutdown()
                .await
                .context("failed to close extractor input")
                .map_err(close_error)?;
        }
        let status = self
            .child
            .wait()
            .await
            .context("failed to wait for the extractor")
            .map_err(close_error)?;
        if !status.success() {
            return Err(close_error(anyhow!("extractor exited with {status}")));
        }
        Ok(())
    }
}

/// Sink stream writing into any writer, e.g. a `Vec<u8>`
pub struct StreamSink<W> {
    writer: W,
}

impl<W> StreamSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<W: AsyncWrite + Unpin + Send> ChunkSink for StreamSink<W> {
    async fn write_chunk(&mut self, chunk: &ChunkBuffer) -> Result<(), Error> {
        chunk
            .drain(&mut self.writer)
            .await
            .map_err(|error| Error::StreamWrite {
                cause: error.into(),
            })
    }

    async fn close(&mut self) -> Result<(), Error> {
        self.writer
            .shutdown()
            .await
            .map_err(|error| Error::StreamWrite {
                cause: error.into(),
            })
    }
}
