// ABOUTME: Chat transport abstraction carrying replies back to a conversation thread
// ABOUTME: Long replies are split to the platform length limit before delivery

use crate::text::{split_message, MAX_MESSAGE_LEN};
use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

pub const ERROR_PREFIX: &str = "❌ **Error**\n";

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to deliver message to {thread_id}: {reason}")]
    DeliveryFailed { thread_id: String, reason: String },

    #[error("Malformed inbound event: {0}")]
    MalformedEvent(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// A chat message addressed to the service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub thread_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
}

impl InboundEvent {
    /// Parse `thread<TAB>sender<TAB>name<TAB>content`
    pub fn parse_line(line: &str) -> Result<Self> {
        let mut parts = line.splitn(4, '\t');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(thread), Some(sender), Some(name), Some(content))
                if !thread.is_empty() && !sender.is_empty() =>
            {
                Ok(Self {
                    thread_id: thread.to_string(),
                    sender_id: sender.to_string(),
                    sender_name: name.to_string(),
                    content: content.to_string(),
                })
            }
            _ => Err(TransportError::MalformedEvent(line.to_string())),
        }
    }
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Deliver one message that already fits the length limit
    async fn send_chunk(&self, thread_id: &str, text: &str) -> Result<()>;

    async fn send_message(&self, thread_id: &str, text: &str) -> Result<()> {
        for chunk in split_message(text, MAX_MESSAGE_LEN) {
            self.send_chunk(thread_id, &chunk).await?;
        }
        Ok(())
    }

    async fn send_error(&self, thread_id: &str, text: &str) -> Result<()> {
        self.send_message(thread_id, &format!("{}{}", ERROR_PREFIX, text))
            .await
    }
}

/// Writes each chunk to a stream, prefixed with its thread
pub struct ConsoleTransport<W> {
    out: Mutex<W>,
}

impl ConsoleTransport<tokio::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

impl<W> ConsoleTransport<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

#[async_trait]
impl<W> ChatTransport for ConsoleTransport<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn send_chunk(&self, thread_id: &str, text: &str) -> Result<()> {
        let line = format!("[{}] {}\n", thread_id, text);
        let mut out = self.out.lock().await;
        let delivered = async {
            out.write_all(line.as_bytes()).await?;
            out.flush().await
        };
        delivered
            .await
            .map_err(|e| TransportError::DeliveryFailed {
                thread_id: thread_id.to_string(),
                reason: e.to_string(),
            })
    }
}
