//! Telegram bot API backend.
use std::borrow::Cow;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use reqwest::Client;
use serde_derive::Deserialize;
use serde_json::json;

use super::{render, Notify};
use crate::error::{ConfigError, DeliveryError};
use crate::model::NotificationEvent;

pub const TELEGRAM_API: &str = "https://api.telegram.org";

/// Longest text the `sendMessage` method accepts.
const MAX_MESSAGE_CHARS: usize = 4096;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Bot credentials and destination chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelegramConfig {
    pub token: String,
    pub chat_id: String,
    pub api_base: String,
}

impl TelegramConfig {
    /// Validates the token and chat id.
    ///
    /// The token is the raw `123456:ABC...` value from BotFather, without
    /// the `bot` prefix the API URL adds. Chat ids are (possibly negative)
    /// integers.
    pub fn new(token: &str, chat_id: &str) -> Result<Self, ConfigError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(ConfigError::InvalidTelegramToken("token is empty".to_owned()));
        }
        if token.starts_with("bot") {
            return Err(ConfigError::InvalidTelegramToken(
                "drop the leading \"bot\" from the token".to_owned(),
            ));
        }

        let chat_id = chat_id.trim();
        let digits = chat_id.strip_prefix('-').unwrap_or(chat_id);
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(ConfigError::InvalidChatId(chat_id.to_owned()));
        }

        Ok(Self {
            token: token.to_owned(),
            chat_id: chat_id.to_owned(),
            api_base: TELEGRAM_API.to_owned(),
        })
    }

    #[must_use]
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    fn method_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.api_base.trim_end_matches('/'),
            self.token
        )
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    description: Option<String>,
    result: Option<serde_json::Value>,
}

/// Sends notifications as messages from a Telegram bot.
pub struct TelegramNotifier {
    client: Client,
    config: TelegramConfig,
}

impl TelegramNotifier {
    pub fn new(config: TelegramConfig) -> Result<Self, DeliveryError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("reconwatch/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, config })
    }

    /// Posts `text` (HTML) to the configured chat.
    pub async fn send_text(&self, text: &str) -> Result<(), DeliveryError> {
        let payload = json!({
            "chat_id": self.config.chat_id,
            "text": truncate(text, MAX_MESSAGE_CHARS),
            "parse_mode": "HTML",
        });

        let response = self
            .client
            .post(self.config.method_url("sendMessage"))
            .json(&payload)
            .send()
            .await?;

        check(response).await.map(|_| ())
    }

    /// Returns the bot's username, proving the token is valid.
    pub async fn get_me(&self) -> Result<String, DeliveryError> {
        let response = self
            .client
            .get(self.config.method_url("getMe"))
            .send()
            .await?;

        let result = check(response).await?;
        Ok(result
            .as_ref()
            .and_then(|bot| bot.get("username"))
            .and_then(serde_json::Value::as_str)
            .unwrap_or("unknown")
            .to_owned())
    }

    /// Checks the token, then sends a test message to the chat.
    pub async fn test_connection(&self) -> Result<String, DeliveryError> {
        let bot = self.get_me().await?;
        debug!("Telegram token belongs to @{bot}");
        self.send_text("<b>reconwatch</b> test message\nTelegram notifications are working.")
            .await?;
        info!("Telegram connection test successful");
        Ok(bot)
    }
}

#[async_trait]
impl Notify for TelegramNotifier {
    async fn send(&self, event: &NotificationEvent) -> Result<(), DeliveryError> {
        self.send_text(&render(event)).await
    }
}

/// Maps a bot API response onto its `result` field or a delivery error.
async fn check(response: reqwest::Response) -> Result<Option<serde_json::Value>, DeliveryError> {
    let status = response.status();
    let body = response.text().await?;
    let parsed = serde_json::from_str::<ApiResponse>(&body).ok();

    match parsed {
        Some(api) if status.is_success() && api.ok => Ok(api.result),
        Some(api) => Err(DeliveryError::Rejected {
            status: status.as_u16(),
            body: api.description.unwrap_or(body),
        }),
        None => Err(DeliveryError::Rejected {
            status: status.as_u16(),
            body,
        }),
    }
}

/// Cuts rendered HTML to at most `max_chars`.
///
/// Backs off to the last complete line, so no entity or tag is split. A
/// single oversized line is cut before any partial entity or tag and an
/// open `<b>` is closed.
fn truncate(text: &str, max_chars: usize) -> Cow<'_, str> {
    let Some((index, _)) = text.char_indices().nth(max_chars) else {
        return Cow::Borrowed(text);
    };
    let cut = &text[..index];
    if let Some(line_end) = cut.rfind('\n') {
        return Cow::Borrowed(&cut[..line_end]);
    }

    // Room for the closing tag.
    let cut = match cut.char_indices().rev().nth(3) {
        Some((index, _)) => &cut[..index],
        None => "",
    };
    let cut = before_unterminated(cut, '&', ';');
    let cut = before_unterminated(cut, '<', '>');
    if cut.matches("<b>").count() > cut.matches("</b>").count() {
        Cow::Owned(format!("{cut}</b>"))
    } else {
        Cow::Borrowed(cut)
    }
}

/// Drops a trailing `open` that is not followed by its `close`.
fn before_unterminated(text: &str, open: char, close: char) -> &str {
    match text.rfind(open) {
        Some(start) if !text[start..].contains(close) => &text[..start],
        _ => text,
    }
}
