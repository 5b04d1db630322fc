//! Verdict delivery
//!
//! The serialized verdict is handed to a sink; the checker itself never
//! knows where it ends up.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::core::verdict::TcResult;

/// Destination of a serialized verdict
#[async_trait]
pub trait VerdictSink: Send + Sync {
    async fn deliver(&self, bytes: &[u8]) -> Result<()>;
}

/// Writes the verdict to stdout, followed by a newline
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutSink;

#[async_trait]
impl VerdictSink for StdoutSink {
    async fn deliver(&self, bytes: &[u8]) -> Result<()> {
        let mut stdout = tokio::io::stdout();
        stdout.write_all(bytes).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
        Ok(())
    }
}

/// Writes the verdict to a file, replacing it atomically
#[derive(Debug, Clone)]
pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl VerdictSink for FileSink {
    async fn deliver(&self, bytes: &[u8]) -> Result<()> {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("Failed to write verdict to {:?}", tmp))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("Failed to move verdict into {:?}", self.path))?;
        Ok(())
    }
}

/// Serialize a finished verdict and hand it to the sink
pub async fn report(verdict: TcResult, sink: &dyn VerdictSink) -> Result<()> {
    let json = verdict.to_json().context("Failed to serialize verdict")?;
    sink.deliver(json.as_bytes()).await?;
    info!("Verdict delivered: result={}", verdict.result());
    Ok(())
}
