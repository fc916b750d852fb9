//! Telegram Bot API delivery channel.
//!
//! Sends text messages with `POST /bot<token>/sendMessage`. A 429 response is
//! retried after the `parameters.retry_after` delay from the response body;
//! every other non-success response fails the delivery.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;

use laterbird_common::config::AppConfig;
use laterbird_common::error::AppError;
use laterbird_engine::channel::DeliveryChannel;

/// Total `sendMessage` attempts while rate limited.
const MAX_RATE_LIMIT_ATTEMPTS: u32 = 3;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Wait used when a 429 carries no `retry_after`.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    result: Option<T>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct BotUser {
    id: i64,
    #[serde(default)]
    username: Option<String>,
}

pub struct TelegramChannel {
    client: Client,
    api_url: String,
    bot_token: String,
}

impl TelegramChannel {
    pub fn new(api_url: impl Into<String>, bot_token: impl Into<String>) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AppError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            bot_token: bot_token.into(),
        })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, AppError> {
        Self::new(&config.telegram_api_url, &config.telegram_bot_token)
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_url, self.bot_token, method)
    }

    /// Authorize the bot token with `getMe`. Returns the bot username.
    ///
    /// Any refusal, including a response that is not Bot API JSON, is a
    /// configuration error.
    pub async fn verify(&self) -> Result<String, AppError> {
        let response = self
            .client
            .get(self.method_url("getMe"))
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        if !status.is_success() {
            let description = response
                .json::<ApiResponse<BotUser>>()
                .await
                .ok()
                .and_then(|body| body.description)
                .unwrap_or_default();
            return Err(AppError::Config(format!(
                "telegram bot authorization failed: {} {}",
                status, description
            )));
        }

        let body: ApiResponse<BotUser> = response.json().await.map_err(|e| {
            AppError::Config(format!("invalid getMe response: {}", e.without_url()))
        })?;

        match body.result {
            Some(bot) if body.ok => {
                let username = bot.username.unwrap_or_else(|| bot.id.to_string());
                tracing::info!(bot_username = %username, "Telegram bot authorized successfully");
                Ok(username)
            }
            _ => Err(AppError::Config(format!(
                "telegram bot authorization failed: {} {}",
                status,
                body.description.unwrap_or_default()
            ))),
        }
    }

    async fn send_with_retry(&self, payload: &serde_json::Value) -> Result<(), AppError> {
        let url = self.method_url("sendMessage");
        let mut attempts = 0;

        loop {
            attempts += 1;

            let response = self
                .client
                .post(&url)
                .json(payload)
                .send()
                .await
                .map_err(request_error)?;

            let status = response.status();
            let body: Option<ApiResponse<serde_json::Value>> = response.json().await.ok();

            if status.is_success() && body.as_ref().is_some_and(|b| b.ok) {
                return Ok(());
            }

            if status == StatusCode::TOO_MANY_REQUESTS {
                let retry_after = body
                    .as_ref()
                    .and_then(|b| b.parameters.as_ref())
                    .and_then(|p| p.retry_after)
                    .map(Duration::from_secs);

                if attempts >= MAX_RATE_LIMIT_ATTEMPTS {
                    tracing::warn!(
                        attempts,
                        retry_after = ?retry_after,
                        "Telegram rate limit: giving up"
                    );
                    return Err(AppError::Delivery(format!(
                        "telegram rate limit exceeded after {} attempts",
                        attempts
                    )));
                }

                let wait = retry_after.unwrap_or(DEFAULT_RETRY_AFTER);
                tracing::debug!(
                    attempt = attempts,
                    wait_ms = wait.as_millis() as u64,
                    "Telegram rate limited, waiting before retry"
                );
                tokio::time::sleep(wait).await;
                continue;
            }

            let description = body
                .and_then(|b| b.description)
                .unwrap_or_else(|| "no description".to_string());
            return Err(AppError::Delivery(format!(
                "telegram sendMessage failed: {} - {}",
                status, description
            )));
        }
    }
}

/// Transport errors carry the request URL, which embeds the bot token.
fn request_error(e: reqwest::Error) -> AppError {
    AppError::Delivery(format!("telegram request failed: {}", e.without_url()))
}

#[async_trait]
impl DeliveryChannel for TelegramChannel {
    fn channel_type(&self) -> &'static str {
        "telegram"
    }

    async fn send(&self, chat_id: i64, text: &str) -> Result<(), AppError> {
        let payload = json!({
            "chat_id": chat_id,
            "text": text,
        });

        self.send_with_retry(&payload).await?;
        tracing::info!(chat_id, "Telegram message sent successfully");
        Ok(())
    }
}
