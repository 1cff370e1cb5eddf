// =============================================================================
// Notification Sink — single send() contract + Telegram implementation
// =============================================================================
//
// The sink may fail; callers never surface those failures. The Telegram
// implementation posts sendMessage with a 10 s timeout and logs non-200
// responses at WARN. `NullSink` swallows everything (tests, disabled config).
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{info, warn};

use crate::bus::{self, EventBus};
use crate::config::TelegramConfig;

#[async_trait]
pub trait NotifySink: Send + Sync {
    async fn send(&self, text: &str, parse_mode: Option<&str>) -> Result<()>;
}

// =============================================================================
// Telegram
// =============================================================================

pub struct TelegramSink {
    base: String,
    chat_id: String,
    client: reqwest::Client,
}

impl TelegramSink {
    pub fn new(token: &str, chat_id: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("failed to build telegram client")?;
        Ok(Self {
            base: format!("https://api.telegram.org/bot{token}"),
            chat_id: chat_id.to_string(),
            client,
        })
    }
}

#[async_trait]
impl NotifySink for TelegramSink {
    async fn send(&self, text: &str, parse_mode: Option<&str>) -> Result<()> {
        let url = format!("{}/sendMessage", self.base);
        let payload = serde_json::json!({
            "chat_id": self.chat_id,
            "text": text,
            "parse_mode": parse_mode.unwrap_or("Markdown"),
            "disable_web_page_preview": true,
        });
        let resp = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .context("telegram send failed")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_else(|_| "<no body>".into());
            warn!(%status, body = %body, "telegram send rejected");
            anyhow::bail!("telegram returned {status}");
        }
        Ok(())
    }
}

// =============================================================================
// Null sink
// =============================================================================

pub struct NullSink;

#[async_trait]
impl NotifySink for NullSink {
    async fn send(&self, _text: &str, _parse_mode: Option<&str>) -> Result<()> {
        Ok(())
    }
}

/// Build the sink from config: Telegram when enabled and credentialed, the
/// null sink otherwise.
pub fn build_sink(cfg: &TelegramConfig) -> Arc<dyn NotifySink> {
    if cfg.enabled {
        if let (Some(token), Some(chat_id)) = (&cfg.token, &cfg.chat_id) {
            match TelegramSink::new(token, chat_id) {
                Ok(sink) => {
                    info!("telegram notification sink enabled");
                    return Arc::new(sink);
                }
                Err(e) => warn!(error = %e, "telegram sink build failed — using null sink"),
            }
        }
    }
    Arc::new(NullSink)
}

/// Forward `notify.telegram` bus events to the sink, swallowing errors.
pub fn wire_notify_topic(bus: &EventBus, sink: Arc<dyn NotifySink>) {
    bus.subscribe(
        "notify.telegram",
        bus::handler(move |payload| {
            let sink = sink.clone();
            async move {
                let text = payload["text"].as_str().unwrap_or_default().to_string();
                if text.is_empty() {
                    return;
                }
                let parse_mode = payload["parse_mode"].as_str().map(|s| s.to_string());
                if let Err(e) = sink.send(&text, parse_mode.as_deref()).await {
                    warn!(error = %e, "notify.telegram delivery failed");
                }
            }
        }),
    );
}

// =============================================================================
// Test support
// =============================================================================

/// In-memory sink recording every message; optionally failing each send.
#[cfg(test)]
pub struct RecordingSink {
    pub messages: parking_lot::Mutex<Vec<String>>,
    pub fail: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            messages: parking_lot::Mutex::new(vec![]),
            fail: std::sync::atomic::AtomicBool::new(false),
        })
    }
}

#[cfg(test)]
#[async_trait]
impl NotifySink for RecordingSink {
    async fn send(&self, text: &str, _parse_mode: Option<&str>) -> Result<()> {
        if self.fail.load(std::sync::atomic::Ordering::Relaxed) {
            anyhow::bail!("sink down");
        }
        self.messages.lock().push(text.to_string());
        Ok(())
    }
}
