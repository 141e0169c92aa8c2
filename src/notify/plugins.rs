//! Telegram bot API and Discord webhook plugins

use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use super::{NotificationPlugin, PluginStats};
use crate::error::{Error, Result};

const TELEGRAM_API: &str = "https://api.telegram.org";

fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::Notification(format!("failed to build HTTP client: {}", e)))
}

/// Treat any 2xx as delivered
async fn post_json(client: &reqwest::Client, url: &str, body: serde_json::Value) -> Result<()> {
    let response = client.post(url).json(&body).send().await?;
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let detail = response.text().await.unwrap_or_default();
    Err(Error::Notification(format!("HTTP {}: {}", status, detail)))
}

pub struct TelegramPlugin {
    client: reqwest::Client,
    endpoint: String,
    chat_id: String,
    stats: PluginStats,
}

impl TelegramPlugin {
    pub fn new(bot_token: &str, chat_id: &str, timeout: Duration) -> Result<Self> {
        Self::with_api_base(TELEGRAM_API, bot_token, chat_id, timeout)
    }

    /// Point at a different bot API host (self-hosted servers, tests)
    pub fn with_api_base(api_base: &str, bot_token: &str, chat_id: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            endpoint: format!("{}/bot{}/sendMessage", api_base.trim_end_matches('/'), bot_token),
            chat_id: chat_id.to_string(),
            stats: PluginStats::default(),
        })
    }
}

#[async_trait]
impl NotificationPlugin for TelegramPlugin {
    fn name(&self) -> &str {
        "telegram"
    }

    fn stats(&self) -> &PluginStats {
        &self.stats
    }

    async fn deliver(&self, message: &str) -> Result<()> {
        debug!(chat_id = %self.chat_id, "Sending Telegram message");
        post_json(
            &self.client,
            &self.endpoint,
            json!({
                "chat_id": self.chat_id,
                "text": message,
                "parse_mode": "HTML",
            }),
        )
        .await
    }
}

pub struct DiscordPlugin {
    client: reqwest::Client,
    webhook_url: String,
    stats: PluginStats,
}

impl DiscordPlugin {
    pub fn new(webhook_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            webhook_url: webhook_url.to_string(),
            stats: PluginStats::default(),
        })
    }
}

#[async_trait]
impl NotificationPlugin for DiscordPlugin {
    fn name(&self) -> &str {
        "discord"
    }

    fn stats(&self) -> &PluginStats {
        &self.stats
    }

    async fn deliver(&self, message: &str) -> Result<()> {
        post_json(&self.client, &self.webhook_url, json!({ "content": message })).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::testing::fast_policy;
    use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
    use std::sync::{Arc, Mutex};

    type Seen = Arc<Mutex<Vec<(String, serde_json::Value)>>>;

    async fn spawn_receiver(status: StatusCode) -> (String, Seen) {
        let seen: Seen = Arc::default();
        let app = Router::new()
            .route(
                "/*path",
                post(
                    move |State(seen): State<Seen>,
                          axum::extract::Path(path): axum::extract::Path<String>,
                          Json(body): Json<serde_json::Value>| async move {
                        seen.lock().unwrap().push((path, body));
                        status
                    },
                ),
            )
            .with_state(seen.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (format!("http://{}", addr), seen)
    }

    #[tokio::test]
    async fn test_telegram_payload() {
        let (base, seen) = spawn_receiver(StatusCode::OK).await;
        let plugin =
            TelegramPlugin::with_api_base(&base, "123:abc", "42", Duration::from_secs(2)).unwrap();

        assert!(plugin.send_notification("<b>hi</b>", &fast_policy()).await);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "bot123:abc/sendMessage");
        assert_eq!(seen[0].1["chat_id"], "42");
        assert_eq!(seen[0].1["text"], "<b>hi</b>");
        assert_eq!(seen[0].1["parse_mode"], "HTML");
    }

    #[tokio::test]
    async fn test_discord_non_2xx_is_failure() {
        let (base, seen) = spawn_receiver(StatusCode::TOO_MANY_REQUESTS).await;
        let plugin = DiscordPlugin::new(&format!("{}/api/webhooks/1/t", base), Duration::from_secs(2)).unwrap();

        assert!(!plugin.send_notification("hello", &fast_policy()).await);
        assert_eq!(plugin.stats().failure(), 1);
        assert_eq!(plugin.stats().success(), 0);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].1["content"], "hello");
    }
}
