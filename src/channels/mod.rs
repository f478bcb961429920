//! Messaging-platform adapters.
//!
//! A channel turns platform webhooks into [`ChannelMessage`]s and sends
//! [`SendMessage`]s back out. The auth machine itself is transport-agnostic;
//! everything platform-specific (signatures, payload shapes, reply tokens,
//! length limits) lives here.

pub mod line;
pub mod traits;

pub use line::LineChannel;
pub use traits::{Channel, ChannelMessage, SendMessage};
