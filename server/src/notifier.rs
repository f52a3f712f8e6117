// Copyright (c) 2025 sbksba
//
// This software is licensed under the terms of the MIT License.
// See the LICENSE file in the project root for the full license text.
#[cfg(any(test, feature = "test-util"))]
use std::collections::HashSet;

use anyhow::{Context, Result};
use async_trait::async_trait;
#[cfg(any(test, feature = "test-util"))]
use parking_lot::Mutex;
use tracing::{debug, info};

/// Outbound channel used by the scheduler to reach a user.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Delivers one message to `owner`. Success means the call was accepted,
    /// nothing more.
    async fn send(&self, owner: i64, text: &str) -> Result<()>;
}

/// Sends messages through the Telegram Bot API (`sendMessage`).
pub struct TelegramNotifier {
    api_base: String,
    token: String,
    client: reqwest::Client,
}

impl TelegramNotifier {
    pub fn new(api_base: &str, token: &str) -> Self {
        Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn send_message_url(&self) -> String {
        format!("{}/bot{}/sendMessage", self.api_base, self.token)
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, owner: i64, text: &str) -> Result<()> {
        let body = serde_json::json!({
            "chat_id": owner,
            "text": text,
        });

        let response = self
            .client
            .post(self.send_message_url())
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Failed to reach Telegram for chat {owner}"))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("telegram send failed ({status}): {body}");
        }

        debug!("Message delivered to chat {}", owner);
        Ok(())
    }
}

/// Writes messages to the log instead of sending them.
/// Used when no bot token is configured.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, owner: i64, text: &str) -> Result<()> {
        info!(owner, "Notification: {}", text);
        Ok(())
    }
}

/// Keeps every sent message in memory. Owners listed in `failing` get an error.
#[cfg(any(test, feature = "test-util"))]
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<(i64, String)>>,
    failing: Mutex<HashSet<i64>>,
}

#[cfg(any(test, feature = "test-util"))]
impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent send to `owner` fail.
    pub fn fail_for(&self, owner: i64) {
        self.failing.lock().insert(owner);
    }

    pub fn sent(&self) -> Vec<(i64, String)> {
        self.sent.lock().clone()
    }

    pub fn sent_to(&self, owner: i64) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter(|(o, _)| *o == owner)
            .map(|(_, text)| text.clone())
            .collect()
    }
}

#[cfg(any(test, feature = "test-util"))]
#[async_trait]
impl Notifier for MemoryNotifier {
    async fn send(&self, owner: i64, text: &str) -> Result<()> {
        if self.failing.lock().contains(&owner) {
            anyhow::bail!("delivery to {owner} refused");
        }
        self.sent.lock().push((owner, text.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_telegram_notifier_posts_send_message() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/bot123:abc/sendMessage"))
            .and(body_json(serde_json::json!({
                "chat_id": 42,
                "text": "hello",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "ok": true })))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = TelegramNotifier::new(&format!("{}/", server.uri()), "123:abc");
        notifier.send(42, "hello").await.unwrap();
    }

    #[tokio::test]
    async fn test_telegram_notifier_reports_http_errors() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/bot123:abc/sendMessage"))
            .respond_with(ResponseTemplate::new(403).set_body_string("Forbidden: bot was blocked"))
            .mount(&server)
            .await;

        let notifier = TelegramNotifier::new(&server.uri(), "123:abc");
        let err = notifier.send(42, "hello").await.unwrap_err();
        assert!(err.to_string().contains("403"));
        assert!(err.to_string().contains("bot was blocked"));
    }

    #[tokio::test]
    async fn test_memory_notifier_records_and_fails() {
        let notifier = MemoryNotifier::new();
        notifier.send(1, "first").await.unwrap();
        notifier.fail_for(2);
        assert!(notifier.send(2, "second").await.is_err());

        assert_eq!(notifier.sent(), vec![(1, "first".to_string())]);
        assert!(notifier.sent_to(2).is_empty());
    }
}
