use std::time::Duration;

use error_stack::{Report, ResultExt};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::config::{TelegramConfig, TelegramCredentials};
use crate::error::NotifyError;
use crate::model::AlertEvent;
use crate::notifier::{AlertMessage, Notifier};
use crate::retry::{RetryDecision, RetryPolicy, retry_when};

const NOTIFIER_NAME: &str = "telegram";
/// Used when a 429 response carries no `retry_after`.
const DEFAULT_RETRY_AFTER_SECS: u64 = 1;
/// Longest `retry_after` worth waiting for; beyond it the send gives up.
const MAX_RETRY_AFTER_SECS: u64 = 30;

/// The JSON payload for the Telegram `sendMessage` endpoint.
#[derive(Debug, Serialize)]
struct SendMessagePayload<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'a str,
}

#[derive(Debug, Deserialize)]
struct TelegramResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

/// Sends alerts to a Telegram group through the Bot API.
pub struct TelegramNotifier {
    client: reqwest::Client,
    api_url: String,
    credentials: TelegramCredentials,
    retry: RetryPolicy,
}

impl TelegramNotifier {
    pub fn new(
        config: &TelegramConfig,
        credentials: TelegramCredentials,
    ) -> Result<Self, Report<NotifyError>> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .change_context(NotifyError::Request {
                notifier: NOTIFIER_NAME.into(),
            })?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_owned(),
            credentials,
            retry: RetryPolicy::new(config.max_retries),
        })
    }

    /// Send a MarkdownV2 text message to the configured chat.
    pub async fn send_message(&self, text: &str) -> Result<(), Report<NotifyError>> {
        retry_when(
            &self.retry,
            "telegram sendMessage",
            move || self.send_once(text),
            retry_decision,
        )
        .await
    }

    async fn send_once(&self, text: &str) -> Result<(), Report<NotifyError>> {
        let url = format!(
            "{}/bot{}/sendMessage",
            self.api_url, self.credentials.bot_token
        );
        let payload = SendMessagePayload {
            chat_id: &self.credentials.chat_id,
            text,
            parse_mode: "MarkdownV2",
        };

        // `without_url` keeps the bot token out of error reports.
        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                Report::new(e.without_url()).change_context(NotifyError::Request {
                    notifier: NOTIFIER_NAME.into(),
                })
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            Report::new(e.without_url()).change_context(NotifyError::Request {
                notifier: NOTIFIER_NAME.into(),
            })
        })?;

        check_response(status, &body)
    }
}

impl Notifier for TelegramNotifier {
    fn name(&self) -> &str {
        NOTIFIER_NAME
    }

    fn notify<'a>(
        &'a self,
        event: &'a AlertEvent,
    ) -> BoxFuture<'a, Result<(), Report<NotifyError>>> {
        Box::pin(async move {
            let text = render_markdown(&AlertMessage::from_event(event));
            self.send_message(&text)
                .await
                .attach_with(|| format!("alert_id: {}", event.id))
        })
    }
}

fn check_response(status: reqwest::StatusCode, body: &str) -> Result<(), Report<NotifyError>> {
    let parsed = serde_json::from_str::<TelegramResponse>(body).ok();
    if status.is_success() && parsed.as_ref().is_some_and(|r| r.ok) {
        return Ok(());
    }

    let notifier = NOTIFIER_NAME.to_owned();
    let (description, retry_after) = match parsed {
        Some(response) => (
            response
                .description
                .unwrap_or_else(|| format!("HTTP status {status}")),
            response.parameters.and_then(|p| p.retry_after),
        ),
        None => (format!("HTTP status {status}, unreadable body"), None),
    };

    let context = if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        NotifyError::RateLimited {
            notifier,
            retry_after_secs: retry_after.unwrap_or(DEFAULT_RETRY_AFTER_SECS),
        }
    } else if status.is_server_error() {
        NotifyError::Unavailable {
            notifier,
            description,
        }
    } else {
        NotifyError::Rejected {
            notifier,
            description,
        }
    };
    Err(Report::new(context))
}

/// Transport failures, 5xx and 429 are retried; any other rejection is final.
fn retry_decision(report: &Report<NotifyError>) -> RetryDecision {
    match report.current_context() {
        NotifyError::Request { .. } | NotifyError::Unavailable { .. } => RetryDecision::Backoff,
        NotifyError::RateLimited {
            retry_after_secs, ..
        } if *retry_after_secs <= MAX_RETRY_AFTER_SECS => {
            RetryDecision::After(Duration::from_secs(*retry_after_secs))
        }
        NotifyError::RateLimited { .. } | NotifyError::Rejected { .. } => RetryDecision::GiveUp,
    }
}

fn render_markdown(message: &AlertMessage) -> String {
    format!(
        "*{}*\n{}",
        escape_markdown(&message.headline),
        escape_markdown(&message.details)
    )
}

/// Escape characters that have special meaning in Telegram's MarkdownV2.
fn escape_markdown(text: &str) -> String {
    const SPECIAL: &str = r"\_*[]()~`>#+-=|{}.!";
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if SPECIAL.contains(c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
