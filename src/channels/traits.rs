//! Channel abstraction shared by all messaging platforms.

use async_trait::async_trait;

/// A normalized incoming message from any channel.
#[derive(Debug, Clone)]
pub struct ChannelMessage {
    /// Platform message id (or a generated one when the platform omits it).
    pub id: String,
    /// Stable sender id — this is the device session key for auth.
    pub sender: String,
    /// Short-lived token for the platform's reply API, when one exists.
    pub reply_token: Option<String>,
    pub content: String,
    /// Unix epoch seconds.
    pub timestamp: u64,
}

/// An outgoing message.
#[derive(Debug, Clone)]
pub struct SendMessage {
    /// Platform user id to deliver to.
    pub recipient: String,
    pub content: String,
}

/// A messaging platform adapter.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Channel identifier for logs.
    fn name(&self) -> &str;

    /// Push a message to a recipient, outside any reply context.
    async fn send(&self, message: &SendMessage) -> anyhow::Result<()>;

    /// Whether the platform API is currently reachable with our credentials.
    async fn health_check(&self) -> bool;
}
