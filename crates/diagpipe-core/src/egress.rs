//! Egress boundary.
//!
//! Pipelines hand a finished (or still-flowing) output stream to an
//! [`EgressProvider`], which delivers it to its destination and returns an
//! identifier for where the artifact ended up. The filesystem provider here
//! is the built-in implementation; blob-storage and friends plug in behind
//! the same trait.

use std::path::PathBuf;

use tokio::io::{AsyncRead, AsyncWriteExt, BufWriter};
use tracing::info;

use crate::error::{Error, Result};
use crate::pipeline::{BoxFuture, StopToken};

/// Delivers an output stream to a destination.
pub trait EgressProvider: Send + Sync {
    /// Consume `stream` under `name`, returning a destination identifier
    /// (e.g. the path the artifact was written to).
    ///
    /// Cancellation via `stop` abandons the transfer and surfaces
    /// [`Error::Cancelled`]; partially written artifacts are left for the
    /// operator to inspect.
    fn egress<'a>(
        &'a self,
        name: &'a str,
        stream: &'a mut (dyn AsyncRead + Send + Unpin),
        stop: StopToken,
    ) -> BoxFuture<'a, Result<String>>;
}

/// Writes artifacts into a root directory.
#[derive(Debug, Clone)]
pub struct FileSystemEgress {
    root: PathBuf,
}

impl FileSystemEgress {
    /// Egress into `root`; created on first use if missing.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl EgressProvider for FileSystemEgress {
    fn egress<'a>(
        &'a self,
        name: &'a str,
        stream: &'a mut (dyn AsyncRead + Send + Unpin),
        stop: StopToken,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            tokio::fs::create_dir_all(&self.root).await?;
            let path = self.root.join(name);
            let file = tokio::fs::File::create(&path).await?;
            let mut writer = BufWriter::new(file);

            let copied = tokio::select! {
                result = tokio::io::copy(stream, &mut writer) => result?,
                () = stop.stopped() => {
                    return Err(Error::Cancelled("egress transfer cancelled".to_string()));
                }
            };
            writer.flush().await?;

            let destination = path.display().to_string();
            info!(%destination, bytes = copied, "artifact egressed");
            Ok(destination)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_stream_to_named_file() {
        let dir = tempfile::tempdir().unwrap();
        let egress = FileSystemEgress::new(dir.path().join("artifacts"));
        let mut stream: &[u8] = b"nettrace-bytes";

        let destination = egress
            .egress("session.nettrace", &mut stream, StopToken::never())
            .await
            .unwrap();

        assert!(destination.ends_with("session.nettrace"));
        let written = std::fs::read(&destination).unwrap();
        assert_eq!(written, b"nettrace-bytes");
    }

    #[tokio::test]
    async fn creates_missing_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let egress = FileSystemEgress::new(dir.path().join("a/b/c"));
        let mut stream: &[u8] = b"x";
        let destination = egress
            .egress("dump.gcdump", &mut stream, StopToken::never())
            .await
            .unwrap();
        assert!(std::path::Path::new(&destination).exists());
    }

    #[tokio::test]
    async fn pre_cancelled_token_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let egress = FileSystemEgress::new(dir.path());
        let source = crate::pipeline::StopSource::new();
        source.stop();

        // A reader that never finishes; only cancellation can end this.
        let (_tx, rx) = tokio::io::duplex(16);
        let mut rx = Box::new(rx) as Box<dyn AsyncRead + Send + Unpin>;
        let err = egress
            .egress("never.bin", rx.as_mut(), source.token())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
    }
}
