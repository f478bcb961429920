//! LINE Messaging API channel.
//!
//! Operates in webhook mode: incoming messages arrive via the gateway's
//! `/line` endpoint and are answered through the Reply API while the reply
//! token is fresh; pushes to *other* devices (takeover codes, replacement
//! notices, abuse alerts) go through the Push Message API.

use async_trait::async_trait;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::traits::{Channel, ChannelMessage, SendMessage};

const PUSH_URL: &str = "https://api.line.me/v2/bot/message/push";
const REPLY_URL: &str = "https://api.line.me/v2/bot/message/reply";

/// LINE caps one text message at 5000 characters.
const MAX_TEXT_LEN: usize = 5000;

pub struct LineChannel {
    channel_access_token: String,
    channel_secret: String,
    client: reqwest::Client,
}

impl LineChannel {
    pub fn new(channel_access_token: String, channel_secret: String) -> Self {
        Self {
            channel_access_token,
            channel_secret,
            client: reqwest::Client::new(),
        }
    }

    /// Verify the X-Line-Signature header using HMAC-SHA256 over the raw
    /// request body.
    pub fn verify_signature(&self, body: &[u8], signature: &str) -> bool {
        let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(self.channel_secret.as_bytes()) else {
            return false;
        };
        mac.update(body);
        let computed =
            base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());
        computed == signature
    }

    /// Parse an incoming LINE webhook payload and extract text messages.
    ///
    /// Non-message events, non-text messages, empty texts, and events with
    /// no sender id are skipped. Who may do what is not decided here — the
    /// auth machine answers every sender.
    pub fn parse_webhook_payload(&self, payload: &serde_json::Value) -> Vec<ChannelMessage> {
        let mut messages = Vec::new();

        let Some(events) = payload.get("events").and_then(|e| e.as_array()) else {
            return messages;
        };

        for event in events {
            let event_type = event.get("type").and_then(|t| t.as_str()).unwrap_or("");
            if event_type != "message" {
                continue;
            }

            let msg = match event.get("message") {
                Some(m) => m,
                None => continue,
            };
            let msg_type = msg.get("type").and_then(|t| t.as_str()).unwrap_or("");
            if msg_type != "text" {
                continue;
            }

            let text = msg
                .get("text")
                .and_then(|t| t.as_str())
                .unwrap_or("")
                .to_string();
            if text.is_empty() {
                continue;
            }

            let user_id = event
                .get("source")
                .and_then(|s| s.get("userId"))
                .and_then(|u| u.as_str())
                .unwrap_or("");
            if user_id.is_empty() {
                continue;
            }

            // LINE always sends a message id in practice, but the field is
            // not guaranteed by the schema.
            let message_id = msg
                .get("id")
                .and_then(|i| i.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

            let reply_token = event
                .get("replyToken")
                .and_then(|t| t.as_str())
                .map(str::to_string);

            // Webhook timestamps are in milliseconds.
            let timestamp = event
                .get("timestamp")
                .and_then(|t| t.as_u64())
                .map(|ms| ms / 1000)
                .unwrap_or_else(|| {
                    std::time::SystemTime::now()
                        .duration_since(std::time::UNIX_EPOCH)
                        .unwrap_or_default()
                        .as_secs()
                });

            messages.push(ChannelMessage {
                id: message_id,
                sender: user_id.to_string(),
                reply_token,
                content: text,
                timestamp,
            });
        }

        messages
    }

    /// Answer an inbound message through the Reply API. Reply tokens are
    /// single-use and short-lived; on failure the caller should fall back to
    /// a push.
    pub async fn reply(&self, reply_token: &str, content: &str) -> anyhow::Result<()> {
        // The Reply API takes at most 5 message objects in one call.
        let chunks = split_message(content, MAX_TEXT_LEN);
        let msg_objects: Vec<serde_json::Value> = chunks
            .iter()
            .take(5)
            .map(|text| serde_json::json!({ "type": "text", "text": text }))
            .collect();

        let body = serde_json::json!({
            "replyToken": reply_token,
            "messages": msg_objects
        });

        let resp = self
            .client
            .post(REPLY_URL)
            .bearer_auth(&self.channel_access_token)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let error_body = resp.text().await.unwrap_or_default();
            tracing::error!("LINE reply failed: {status} — {error_body}");
            anyhow::bail!("LINE API error: {status}");
        }

        Ok(())
    }
}

#[async_trait]
impl Channel for LineChannel {
    fn name(&self) -> &str {
        "line"
    }

    async fn send(&self, message: &SendMessage) -> anyhow::Result<()> {
        let chunks = split_message(&message.content, MAX_TEXT_LEN);

        // Push allows max 5 messages per request.
        for chunk_group in chunks.chunks(5) {
            let msg_objects: Vec<serde_json::Value> = chunk_group
                .iter()
                .map(|text| serde_json::json!({ "type": "text", "text": text }))
                .collect();

            let body = serde_json::json!({
                "to": message.recipient,
                "messages": msg_objects
            });

            let resp = self
                .client
                .post(PUSH_URL)
                .bearer_auth(&self.channel_access_token)
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await?;

            if !resp.status().is_success() {
                let status = resp.status();
                let error_body = resp.text().await.unwrap_or_default();
                tracing::error!("LINE send failed: {status} — {error_body}");
                anyhow::bail!("LINE API error: {status}");
            }
        }

        Ok(())
    }

    async fn health_check(&self) -> bool {
        let resp = self
            .client
            .get("https://api.line.me/v2/bot/info")
            .bearer_auth(&self.channel_access_token)
            .send()
            .await;

        match resp {
            Ok(r) => r.status().is_success(),
            Err(_) => false,
        }
    }
}

/// Split a message into chunks of at most `max_len` characters.
fn split_message(text: &str, max_len: usize) -> Vec<&str> {
    if text.len() <= max_len {
        return vec![text];
    }
    let mut chunks = Vec::new();
    let mut remaining = text;
    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining);
            break;
        }
        // Back off to a char boundary first; replies embed user-supplied
        // names, so the cut point can land inside a multibyte char.
        let mut cut = max_len;
        while cut > 0 && !remaining.is_char_boundary(cut) {
            cut -= 1;
        }
        if cut == 0 {
            // max_len is smaller than the first char; emit the whole char
            cut = remaining.chars().next().map_or(1, char::len_utf8);
        }
        // Prefer a newline or space boundary
        let boundary = remaining[..cut]
            .rfind('\n')
            .or_else(|| remaining[..cut].rfind(' '))
            .unwrap_or(cut);
        // Prevent infinite loop when no boundary is found at position 0
        let boundary = if boundary == 0 { cut } else { boundary };
        let (chunk, rest) = remaining.split_at(boundary);
        chunks.push(chunk);
        remaining = rest.trim_start_matches('\n');
    }
    chunks
}
