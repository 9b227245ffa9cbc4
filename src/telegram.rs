// =============================================================================
// Telegram Bot API client — sendMessage / getUpdates long-poll plumbing
// =============================================================================
//
// A deliberately thin wrapper: the supervisor owns all polling/offset logic,
// this module only shapes requests. A missing token degrades every call to a
// logged no-op result so the engine runs fine without a bot configured.
// =============================================================================

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, warn};

/// Long-poll wait passed to getUpdates, seconds.
pub const LONG_POLL_TIMEOUT_SECS: u64 = 25;

/// One inbound update, message and callback parts pre-flattened to what the
/// supervisor dispatches on.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub chat: Option<Chat>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackQuery {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub message: Option<Message>,
}

#[derive(Debug, Deserialize)]
struct UpdatesResponse {
    #[serde(default)]
    result: Vec<Update>,
}

/// Persistent reply keyboard advertising the view command.
pub fn menu_keyboard() -> serde_json::Value {
    serde_json::json!({
        "keyboard": [[{ "text": "查看" }]],
        "resize_keyboard": true,
    })
}

/// Inline button attached to rebalance alerts.
pub fn view_inline_keyboard() -> serde_json::Value {
    serde_json::json!({
        "inline_keyboard": [[{ "text": "查看状态", "callback_data": "view_noop" }]],
    })
}

/// Bot API client for one token.
#[derive(Clone)]
pub struct TelegramClient {
    token: String,
    http: reqwest::Client,
}

impl TelegramClient {
    /// Build a client; `None` when no token is configured.
    pub fn from_env() -> Option<Self> {
        let token = std::env::var("TELEGRAM_BOT_TOKEN")
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())?;
        Some(Self::new(token))
    }

    pub fn new(token: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(LONG_POLL_TIMEOUT_SECS + 10))
            .build()
            .expect("failed to build reqwest client");
        Self {
            token: token.into(),
            http,
        }
    }

    fn url(&self, method: &str) -> String {
        format!("https://api.telegram.org/bot{}/{}", self.token, method)
    }

    /// POST a JSON payload with up to 3 attempts and a 1 s pause between.
    async fn post_json(&self, method: &str, payload: &serde_json::Value) -> Result<serde_json::Value> {
        let mut last_err = None;
        for attempt in 0..3u32 {
            match self.http.post(self.url(method)).json(payload).send().await {
                Ok(resp) => {
                    let json = resp
                        .json::<serde_json::Value>()
                        .await
                        .with_context(|| format!("decoding {method} response"))?;
                    return Ok(json);
                }
                Err(e) => {
                    warn!(method, attempt = attempt + 1, error = %e, "telegram post failed");
                    last_err = Some(e);
                    if attempt < 2 {
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                }
            }
        }
        Err(last_err.expect("at least one attempt ran")).context(format!("POST {method} failed"))
    }

    /// Send a message, optionally with a reply markup. Returns `Ok(false)`
    /// when the chat id is absent.
    pub async fn send_message(
        &self,
        chat_id: Option<&str>,
        text: &str,
        reply_markup: Option<serde_json::Value>,
    ) -> Result<bool> {
        let Some(chat_id) = chat_id.filter(|c| !c.is_empty()) else {
            debug!("send_message skipped: no chat id");
            return Ok(false);
        };
        if text.trim().is_empty() {
            return Ok(false);
        }

        let mut payload = serde_json::json!({ "chat_id": chat_id, "text": text });
        if let Some(markup) = reply_markup {
            payload["reply_markup"] = markup;
        }
        self.post_json("sendMessage", &payload).await?;
        Ok(true)
    }

    /// Long-poll for updates past `offset`.
    pub async fn get_updates(&self, offset: Option<i64>) -> Result<Vec<Update>> {
        let mut url = format!(
            "{}?timeout={}",
            self.url("getUpdates"),
            LONG_POLL_TIMEOUT_SECS
        );
        if let Some(offset) = offset {
            url.push_str(&format!("&offset={offset}"));
        }
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .context("getUpdates request failed")?;
        let data: UpdatesResponse = resp.json().await.context("decoding getUpdates response")?;
        Ok(data.result)
    }

    pub async fn answer_callback_query(&self, callback_id: &str, text: Option<&str>) -> Result<()> {
        let mut payload = serde_json::json!({ "callback_query_id": callback_id });
        if let Some(text) = text {
            payload["text"] = serde_json::Value::from(text);
        }
        self.post_json("answerCallbackQuery", &payload).await?;
        Ok(())
    }

    /// Long-polling and webhooks are mutually exclusive; clear any webhook
    /// before the first getUpdates.
    pub async fn delete_webhook(&self) -> Result<()> {
        self.post_json(
            "deleteWebhook",
            &serde_json::json!({ "drop_pending_updates": false }),
        )
        .await?;
        Ok(())
    }
}

impl std::fmt::Debug for TelegramClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramClient")
            .field("token", &"<redacted>")
            .finish()
    }
}
