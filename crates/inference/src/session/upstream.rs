//! Upstream session - an inference session backed by an OpenAI-compatible
//! HTTP endpoint (llama.cpp `llama-server`, Ollama, LM Studio)
//!
//! The upstream server is stateless per request, so the conversation of the
//! current context is kept here and replayed on every submission. `reset`
//! starts a fresh context.

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::Notify;

use super::{EventCallback, InferenceSession, Prompt, PromptImage, SessionError, SessionEvent};

/// Connection settings for the upstream endpoint
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Base URL, e.g. `http://127.0.0.1:11434`
    pub base_url: String,
    /// Model name sent upstream and reported by `/v1/models`
    pub model: String,
    /// How often the background probe checks readiness
    pub probe_interval: Duration,
}

impl UpstreamConfig {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            probe_interval: Duration::from_secs(2),
        }
    }
}

pub struct UpstreamSession {
    config: UpstreamConfig,
    http_client: reqwest::Client,
    ready: AtomicBool,
    /// Messages of the current context, replayed upstream
    history: Arc<Mutex<Vec<Value>>>,
    /// Wakes the in-flight generation on cancel
    current_cancel: Mutex<Option<Arc<Notify>>>,
}

impl UpstreamSession {
    pub fn new(config: UpstreamConfig) -> Self {
        Self {
            config,
            http_client: reqwest::Client::new(),
            ready: AtomicBool::new(false),
            history: Arc::new(Mutex::new(Vec::new())),
            current_cancel: Mutex::new(None),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    /// Check the upstream once and update readiness
    pub async fn probe(&self) -> bool {
        let url = format!("{}/v1/models", self.config.base_url);
        let ready = match self
            .http_client
            .get(&url)
            .timeout(Duration::from_secs(2))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                log::debug!("Upstream probe failed: {}", e);
                false
            }
        };

        let was_ready = self.ready.swap(ready, Ordering::SeqCst);
        if ready != was_ready {
            if ready {
                log::info!("Upstream {} is ready", self.config.base_url);
            } else {
                log::warn!("Upstream {} is not responding", self.config.base_url);
            }
        }
        ready
    }

    /// Probe readiness in the background until the session is dropped
    pub fn spawn_probe(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let session = Arc::downgrade(self);
        let interval = self.config.probe_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(session) = session.upgrade() else {
                    break;
                };
                session.probe().await;
            }
        })
    }

    /// Number of messages held for the current context
    pub fn history_len(&self) -> usize {
        self.history.lock().len()
    }

    fn user_message(prompt: &Prompt) -> Result<Value, SessionError> {
        if prompt.images.is_empty() {
            return Ok(json!({ "role": "user", "content": prompt.text }));
        }

        let mut parts = vec![json!({ "type": "text", "text": prompt.text })];
        for image in &prompt.images {
            parts.push(json!({
                "type": "image_url",
                "image_url": { "url": encode_data_uri(image)? }
            }));
        }
        Ok(json!({ "role": "user", "content": parts }))
    }
}

/// Re-encode a decoded bitmap as a PNG data URI
fn encode_data_uri(image: &PromptImage) -> Result<String, SessionError> {
    let buffer = image::RgbaImage::from_raw(image.width, image.height, image.rgba.clone())
        .ok_or_else(|| {
            SessionError::Image(format!(
                "Pixel buffer does not match {}x{}",
                image.width, image.height
            ))
        })?;

    let mut png = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgba8(buffer)
        .write_to(&mut png, image::ImageFormat::Png)
        .map_err(|e| SessionError::Image(e.to_string()))?;

    Ok(format!(
        "data:image/png;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(png.into_inner())
    ))
}

/// One parsed line of an upstream SSE reply
#[derive(Debug, PartialEq)]
enum SseLine {
    Delta(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }

    serde_json::from_str::<Value>(data)
        .ok()
        .and_then(|json| {
            json.get("choices")
                .and_then(|c| c.get(0))
                .and_then(|c| c.get("delta"))
                .and_then(|d| d.get("content"))
                .and_then(|c| c.as_str())
                .filter(|c| !c.is_empty())
                .map(|c| SseLine::Delta(c.to_string()))
        })
        .unwrap_or(SseLine::Skip)
}

/// Post the conversation and forward every delta; returns the full reply
async fn stream_reply(
    client: &reqwest::Client,
    url: &str,
    body: &Value,
    on_event: &EventCallback,
) -> Result<String, SessionError> {
    let response = client.post(url).json(body).send().await?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(SessionError::Inference(format!(
            "API error {}: {}",
            status, body
        )));
    }

    let mut stream = response.bytes_stream();
    let mut pending: Vec<u8> = Vec::new();
    let mut reply = String::new();

    while let Some(chunk) = stream.next().await {
        pending.extend_from_slice(&chunk?);

        // Only complete lines; a UTF-8 sequence may straddle two chunks
        while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            match parse_sse_line(line.trim()) {
                SseLine::Delta(content) => {
                    reply.push_str(&content);
                    on_event(SessionEvent::Fragment(content));
                }
                SseLine::Done => return Ok(reply),
                SseLine::Skip => {}
            }
        }
    }

    Ok(reply)
}

#[async_trait]
impl InferenceSession for UpstreamSession {
    fn model_name(&self) -> String {
        self.config.model.clone()
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn reset(&self) -> Result<(), SessionError> {
        self.history.lock().clear();
        Ok(())
    }

    fn submit(&self, prompt: Prompt, on_event: EventCallback) -> Result<(), SessionError> {
        if !self.is_ready() {
            return Err(SessionError::NotReady);
        }

        let user_message = Self::user_message(&prompt)?;
        let mut messages = self.history.lock().clone();
        messages.push(user_message.clone());

        let body = json!({
            "model": self.config.model,
            "messages": messages,
            "stream": true,
        });

        let cancel = Arc::new(Notify::new());
        *self.current_cancel.lock() = Some(cancel.clone());

        let client = self.http_client.clone();
        let url = format!("{}/v1/chat/completions", self.config.base_url);
        let history = self.history.clone();

        tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = cancel.notified() => None,
                result = stream_reply(&client, &url, &body, &on_event) => Some(result),
            };

            match outcome {
                None => on_event(SessionEvent::Cancelled),
                Some(Ok(reply)) => {
                    let mut history = history.lock();
                    history.push(user_message);
                    history.push(json!({ "role": "assistant", "content": reply }));
                    drop(history);
                    on_event(SessionEvent::Completed);
                }
                Some(Err(e)) => on_event(SessionEvent::Failed(e)),
            }
        });

        Ok(())
    }

    fn cancel(&self) {
        if let Some(cancel) = self.current_cancel.lock().take() {
            cancel.notify_one();
        }
    }
}
