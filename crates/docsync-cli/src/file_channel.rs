//! A [`ServerChannel`] backed by local files, for driving a session without a
//! server.
//!
//! Every fetch re-reads the transform log, so appending to it while `watch`
//! runs behaves like the server publishing. Pushes are appended to an outbox
//! as JSON lines and always acknowledged in full.

use std::path::PathBuf;

use async_trait::async_trait;
use docsync_client::{ChannelError, LocalChange, PushAck, ServerChannel};
use docsync_core::{Seq, Transform};
use tokio::io::AsyncWriteExt;
use tracing::debug;

pub struct FileChannel {
    log: PathBuf,
    outbox: Option<PathBuf>,
}

impl FileChannel {
    pub fn new(log: impl Into<PathBuf>) -> Self {
        Self { log: log.into(), outbox: None }
    }

    pub fn with_outbox(mut self, outbox: impl Into<PathBuf>) -> Self {
        self.outbox = Some(outbox.into());
        self
    }
}

fn transport(e: std::io::Error) -> ChannelError {
    ChannelError::Transport(e.to_string())
}

#[async_trait]
impl ServerChannel for FileChannel {
    async fn fetch_transforms_since(&self, watermark: Seq) -> Result<Vec<Transform>, ChannelError> {
        let text = tokio::fs::read_to_string(&self.log).await.map_err(transport)?;
        let log: Vec<Transform> = serde_json::from_str(&text)?;
        Ok(log.into_iter().filter(|t| t.seq > watermark).collect())
    }

    async fn push_local_changes(&self, changes: &[LocalChange]) -> Result<PushAck, ChannelError> {
        if let Some(path) = &self.outbox {
            let mut lines = String::new();
            for change in changes {
                lines.push_str(&serde_json::to_string(change)?);
                lines.push('\n');
            }
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await
                .map_err(transport)?;
            file.write_all(lines.as_bytes()).await.map_err(transport)?;
            debug!(count = changes.len(), outbox = %path.display(), "changes written");
        }
        Ok(PushAck::all(changes))
    }
}
