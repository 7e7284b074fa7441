use std::future::Future;

use reqwest::Client;
use serde_json::json;
use thiserror::Error;

const TELEGRAM_API_URL: &str = "https://api.telegram.org";

/// Channel failures never leave the dispatcher; they are logged and counted.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("channel rejected the message (status {status}): {body}")]
    Rejected { status: u16, body: String },
}

pub trait EmailSender: Send + Sync {
    fn send(
        &self,
        address: &str,
        subject: &str,
        body: &str,
    ) -> impl Future<Output = Result<(), ChannelError>> + Send;
}

pub trait TelegramSender: Send + Sync {
    fn send(
        &self,
        chat_id: &str,
        text: &str,
    ) -> impl Future<Output = Result<(), ChannelError>> + Send;
}

/// Email delivery through an HTTP mail gateway.
#[derive(Clone)]
pub struct EmailChannel {
    client: Client,
    gateway_url: String,
    from: String,
}

impl EmailChannel {
    pub fn new(gateway_url: String, from: String) -> Self {
        Self {
            client: Client::new(),
            gateway_url,
            from,
        }
    }
}

impl EmailSender for EmailChannel {
    fn send(
        &self,
        address: &str,
        subject: &str,
        body: &str,
    ) -> impl Future<Output = Result<(), ChannelError>> + Send {
        let request = self.client.post(&self.gateway_url).json(&json!({
            "from": self.from,
            "to": address,
            "subject": subject,
            "body": body,
        }));

        async move {
            let resp = request.send().await?;
            if !resp.status().is_success() {
                let status = resp.status().as_u16();
                let body = resp.text().await.unwrap_or_default();
                return Err(ChannelError::Rejected { status, body });
            }
            Ok(())
        }
    }
}

/// Reminder delivery through the Telegram Bot API.
#[derive(Clone)]
pub struct TelegramChannel {
    client: Client,
    token: String,
}

impl TelegramChannel {
    pub fn new(token: String) -> Self {
        Self {
            client: Client::new(),
            token,
        }
    }
}

impl TelegramSender for TelegramChannel {
    fn send(
        &self,
        chat_id: &str,
        text: &str,
    ) -> impl Future<Output = Result<(), ChannelError>> + Send {
        let url = format!("{}/bot{}/sendMessage", TELEGRAM_API_URL, self.token);
        let request = self.client.post(url).json(&json!({
            "chat_id": chat_id,
            "text": text,
        }));

        async move {
            let resp = request.send().await?;
            if !resp.status().is_success() {
                let status = resp.status().as_u16();
                let body = resp.text().await.unwrap_or_default();
                return Err(ChannelError::Rejected { status, body });
            }
            Ok(())
        }
    }
}
