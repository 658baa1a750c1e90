//! Coordinator side of the pipeline: turns the source tree into a byte stream.

use std::future::Future;
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use common::ChunkBuffer;
use tokio::io::AsyncRead;

use crate::Error;

/// Produces the archive stream one chunk at a time.
pub trait ChunkSource: Send {
    /// Replaces the buffer contents with the next chunk, returns its length (0 at end of stream).
    fn fill(
        &mut self,
        buffer: &mut ChunkBuffer,
    ) -> impl Future<Output = Result<usize, Error>> + Send;

    /// Called once the stream is exhausted, before the end is announced to the group.
    fn finish(&mut self) -> impl Future<Output = Result<(), Error>> + Send;
}

/// Splits `path` into the directory the archiver runs in and the entry it archives, so the
/// stream holds the leaf name (`/data/models/llama/` becomes `/data/models` + `llama`).
pub fn split_source(path: &Path) -> (PathBuf, PathBuf) {
    let normalized: PathBuf = path.components().collect();
    match normalized.file_name() {
        Some(entry) => {
            let base = match normalized.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
                _ => PathBuf::from("."),
            };
            (base, PathBuf::from(entry))
        }
        // "/", ".." and friends have no leaf, archive their contents
        None => (normalized, PathBuf::from(".")),
    }
}

/// Source stream read from the archiver's stdout
pub struct ArchiveSource {
    child: tokio::process::Child,
    stdout: tokio::process::ChildStdout,
    path: PathBuf,
}

impl ArchiveSource {
    /// Starts `tar -C <base> -cf - <entry>` for `path`.
    ///
    /// The path must exist, the archiver would otherwise only complain on stderr and produce a
    /// valid but empty stream.
    pub async fn spawn(tar: &Path, path: &Path) -> Result<Self, Error> {
        let open_error = |cause: anyhow::Error| Error::SourceOpen {
            path: path.to_path_buf(),
            cause,
        };
        tokio::fs::symlink_metadata(path)
            .await
            .context("cannot access source")
            .map_err(open_error)?;
        let (base, entry) = split_source(path);
        tracing::debug!("archiving {:?} relative to {:?}", entry, base);
        let mut child = tokio::process::Command::new(tar)
            .arg("-C")
            .arg(&base)
            .arg("-cf")
            .arg("-")
            .arg(&entry)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start archiver {tar:?}"))
            .map_err(open_error)?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| open_error(anyhow!("archiver has no stdout")))?;
        Ok(Self {
            child,
            stdout,
            path: path.to_path_buf(),
        })
    }
}

impl ChunkSource for ArchiveSource {
    async fn fill(&mut self, buffer: &mut ChunkBuffer) -> Result<usize, Error> {
        buffer
            .fill(&mut self.stdout)
            .await
            .context("archiver stdout")
            .map_err(|cause| Error::StreamRead { cause })
    }

    async fn finish(&mut self) -> Result<(), Error> {
        let status = self
            .child
            .wait()
            .await
            .context("failed to wait for the archiver")
            .map_err(|cause| Error::StreamRead { cause })?;
        if !status.success() {
            return Err(Error::StreamRead {
                cause: anyhow!("archiver failed on {:?} ({})", self.path, status),
            });
        }
        tracing::debug!("archiver finished");
        Ok(())
    }
}

/// Source stream read from any reader, e.g. an in-memory buffer
pub struct StreamSource<R> {
    reader: R,
}

impl<R> StreamSource<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

impl<R: AsyncRead + Unpin + Send> ChunkSource for StreamSource<R> {
    async fn fill(&mut self, buffer: &mut ChunkBuffer) -> Result<usize, Error> {
        buffer
            .fill(&mut self.reader)
            .await
            .map_err(|error| Error::StreamRead {
                cause: error.into(),
            })
    }

    async fn finish(&mut self) -> Result<(), Error> {
        Ok(())
    }
}
