//! Destinations for decoded notifications

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Local;
use tokio::sync::mpsc::UnboundedSender;

use crate::message::Message;
use crate::utils::Logger;

/// Receives every message successfully parsed for the tenant it is bound to.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn accept(&self, message: Message) -> Result<()>;
}

#[async_trait]
impl MessageSink for UnboundedSender<Message> {
    async fn accept(&self, message: Message) -> Result<()> {
        self.send(message)
            .map_err(|_| anyhow::anyhow!("notification channel closed"))
    }
}

/// Prints notifications through the logger.
pub struct LogSink {
    identity: String,
    logger: Logger,
}

impl LogSink {
    pub fn new(identity: impl Into<String>, logger: Logger) -> Self {
        Self {
            identity: identity.into(),
            logger,
        }
    }
}

#[async_trait]
impl MessageSink for LogSink {
    async fn accept(&self, message: Message) -> Result<()> {
        let origin = SocketAddr::from(([0, 0, 0, 0], 0));
        self.logger
            .log(
                &origin,
                &format!("Notification for {}: {}", self.identity, message.subject),
            )
            .await;
        self.logger
            .log_verbose(&origin, "NOTIFICATION BODY", &message.body)
            .await;
        Ok(())
    }
}

/// Writes one file per notification into a directory.
pub struct DirectorySink {
    identity: String,
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(identity: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            identity: identity.into(),
            dir: dir.into(),
        }
    }
}

#[async_trait]
impl MessageSink for DirectorySink {
    async fn accept(&self, message: Message) -> Result<()> {
        let timestamp = Local::now().format("%Y%m%d_%H%M%S%.3f");
        let safe_identity: String = self
            .identity
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        let filepath = self
            .dir
            .join(format!("{}_{}.txt", timestamp, safe_identity));

        let mut content = String::new();
        content.push_str(&format!("Subject: {}\r\n", message.subject));
        content.push_str(&format!("X-Tenant: {}\r\n", self.identity));
        content.push_str("\r\n");
        content.push_str(&message.body);

        tokio::fs::write(&filepath, content)
            .await
            .with_context(|| format!("Failed to write notification: {:?}", filepath))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_sink() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Message>();
        tx.accept(Message::new("s", "b")).await.unwrap();
        assert_eq!(rx.recv().await, Some(Message::new("s", "b")));

        drop(rx);
        assert!(tx.accept(Message::new("s", "b")).await.is_err());
    }

    #[tokio::test]
    async fn test_directory_sink_writes_file() {
        let dir = std::env::temp_dir().join(format!("smtp-notify-sink-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();

        let sink = DirectorySink::new("ops@team", &dir);
        sink.accept(Message::new("Backup", "done")).await.unwrap();

        let mut entries = tokio::fs::read_dir(&dir).await.unwrap();
        let entry = entries.next_entry().await.unwrap().unwrap();
        let name = entry.file_name().to_string_lossy().into_owned();
        assert!(name.ends_with("_ops_team.txt"));

        let content = tokio::fs::read_to_string(entry.path()).await.unwrap();
        assert_eq!(content, "Subject: Backup\r\nX-Tenant: ops@team\r\n\r\ndone");

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
