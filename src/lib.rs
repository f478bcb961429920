//! Shiokaze — chat-driven member authentication for a LINE bot.
//!
//! Members register and log in entirely through chat messages. Each member
//! identity is bound to at most one device session at a time; a login from
//! a second device must be approved with a one-time code sent to the first.

pub mod auth;
pub mod channels;
pub mod config;
pub mod error;
pub mod gateway;
pub mod store;
