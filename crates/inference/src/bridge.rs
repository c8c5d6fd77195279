//! Generation bridge - the only path into the inference session
//!
//! The bridge serializes generations over the single session, waits for the
//! session to become ready, enforces the token budget and adapts the
//! callback-driven session into either a blocking call returning the full
//! text or a live feed of fragments into a [`FragmentSink`].
//!
//! ```text
//! Idle -> AwaitingSession -> Generating -> {Completed | Cancelled | Failed} -> Idle
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};

use crate::constants::timeouts;
use crate::logs::LogBuffer;
use crate::session::{InferenceSession, Prompt, SessionEvent};

/// Error types for generation
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("Model not ready after {}s", .0.as_secs())]
    ModelNotReady(Duration),

    #[error("Generation failed: {0}")]
    Failure(String),
}

/// Timing knobs for the bridge
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// How long to wait for the session to report ready
    pub ready_timeout: Duration,
    /// Interval between readiness checks
    pub ready_poll_interval: Duration,
    /// How long to wait for a terminal event after a budget cancel
    pub cancel_grace: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(timeouts::SESSION_READY_SECS),
            ready_poll_interval: Duration::from_millis(timeouts::SESSION_READY_POLL_MS),
            cancel_grace: Duration::from_secs(timeouts::CANCEL_GRACE_SECS),
        }
    }
}

/// One generation request
#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub prompt: Prompt,
    /// Fragment budget; `None` means unlimited
    pub max_tokens: Option<u32>,
}

/// Outcome of a generation that did not fail
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationResult {
    /// Accumulated text of every accepted fragment
    pub text: String,
    /// Number of accepted fragments
    pub completion_tokens: usize,
    /// Whether the token budget stopped the generation early
    pub cancelled: bool,
    pub error: Option<String>,
}

/// Receiver of live fragments for the streaming view
#[async_trait]
pub trait FragmentSink: Send {
    /// Called once the session accepted the prompt, before any fragment
    async fn started(&mut self) {}

    async fn push(&mut self, fragment: &str);
}

/// Sink for the blocking view, which only needs the accumulated text
struct DiscardSink;

#[async_trait]
impl FragmentSink for DiscardSink {
    async fn push(&mut self, _fragment: &str) {}
}

/// Holds the generation lock for a submitted prompt.
///
/// If the caller stops waiting (its future is dropped), the remaining events
/// are drained on a background task and the lock is released only once the
/// session reached a terminal event.
struct InFlight {
    guard: Option<OwnedMutexGuard<()>>,
    events: Option<mpsc::UnboundedReceiver<SessionEvent>>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let (Some(guard), Some(mut events)) = (self.guard.take(), self.events.take()) else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        log::debug!("Generation abandoned by its caller, draining in background");
        runtime.spawn(async move {
            while let Some(event) = events.recv().await {
                if !matches!(event, SessionEvent::Fragment(_)) {
                    break;
                }
            }
            drop(guard);
        });
    }
}

/// Timing of a single generation
#[derive(Debug, Clone, Copy)]
pub struct GenerationStats {
    pub tokens: usize,
    pub time_to_first_token: Option<Duration>,
    pub decode_time: Duration,
}

impl GenerationStats {
    /// Tokens per second of decode time (first fragment to end)
    pub fn decode_rate(&self) -> f64 {
        let secs = self.decode_time.as_secs_f64();
        if secs > 0.0 {
            self.tokens as f64 / secs
        } else {
            0.0
        }
    }

    pub fn summary(&self) -> String {
        let ttft = self
            .time_to_first_token
            .map(|d| d.as_millis().to_string())
            .unwrap_or_else(|| "-".to_string());
        format!(
            "Generated {} tokens | TTFT {} ms | {:.2} tok/s",
            self.tokens,
            ttft,
            self.decode_rate()
        )
    }
}

/// Serializes all generations over one inference session.
pub struct GenerationBridge {
    session: Arc<dyn InferenceSession>,
    logs: Arc<LogBuffer>,
    /// Held for the whole generation lifecycle; tokio's mutex is FIFO-fair
    lock: Arc<Mutex<()>>,
    config: BridgeConfig,
}

impl GenerationBridge {
    pub fn new(session: Arc<dyn InferenceSession>, logs: Arc<LogBuffer>) -> Self {
        Self::with_config(session, logs, BridgeConfig::default())
    }

    pub fn with_config(
        session: Arc<dyn InferenceSession>,
        logs: Arc<LogBuffer>,
        config: BridgeConfig,
    ) -> Self {
        Self {
            session,
            logs,
            lock: Arc::new(Mutex::new(())),
            config,
        }
    }

    pub fn session(&self) -> &Arc<dyn InferenceSession> {
        &self.session
    }

    pub fn model_name(&self) -> String {
        self.session.model_name()
    }

    pub fn logs(&self) -> &Arc<LogBuffer> {
        &self.logs
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Run a generation and return the full text once it finishes
    pub async fn generate(
        &self,
        request: GenerationRequest,
    ) -> Result<GenerationResult, GenerationError> {
        self.generate_into(request, &mut DiscardSink).await
    }

    /// Run a generation, pushing every accepted fragment into `sink` as it
    /// arrives. The returned result carries the same accumulated text.
    pub async fn generate_into(
        &self,
        request: GenerationRequest,
        sink: &mut dyn FragmentSink,
    ) -> Result<GenerationResult, GenerationError> {
        let mut in_flight = InFlight {
            guard: Some(self.lock.clone().lock_owned().await),
            events: None,
        };

        if let Err(e) = self.wait_for_ready().await {
            self.logs.push(e.to_string());
            return Err(e);
        }

        if let Err(e) = self.session.reset().await {
            let err = GenerationError::Failure(format!("Session reset failed: {}", e));
            self.logs.push(err.to_string());
            return Err(err);
        }

        self.logs.push(format!(
            "Generation started ({} chars, {} images, budget {})",
            request.prompt.text.chars().count(),
            request.prompt.images.len(),
            request
                .max_tokens
                .map(|n| n.to_string())
                .unwrap_or_else(|| "unlimited".to_string()),
        ));

        match self.drive(request, sink, &mut in_flight).await {
            Ok((result, stats)) => {
                let mut line = stats.summary();
                if result.cancelled {
                    line.push_str(" (budget reached)");
                }
                self.logs.push(line);
                Ok(result)
            }
            Err(e) => {
                self.logs.push(e.to_string());
                Err(e)
            }
        }
    }

    async fn wait_for_ready(&self) -> Result<(), GenerationError> {
        if self.session.is_ready() {
            return Ok(());
        }

        log::debug!("Waiting for session to become ready");
        let period = self.config.ready_poll_interval.max(Duration::from_millis(1));
        let poll = async {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if self.session.is_ready() {
                    break;
                }
            }
        };

        tokio::time::timeout(self.config.ready_timeout, poll)
            .await
            .map_err(|_| GenerationError::ModelNotReady(self.config.ready_timeout))
    }

    async fn drive(
        &self,
        request: GenerationRequest,
        sink: &mut dyn FragmentSink,
        in_flight: &mut InFlight,
    ) -> Result<(GenerationResult, GenerationStats), GenerationError> {
        let (tx, rx) = mpsc::unbounded_channel::<SessionEvent>();

        let started = Instant::now();
        self.session
            .submit(
                request.prompt,
                Box::new(move |event| {
                    // Receiver is gone only once the bridge stopped listening
                    let _ = tx.send(event);
                }),
            )
            .map_err(|e| GenerationError::Failure(e.to_string()))?;
        let rx = in_flight.events.insert(rx);
        sink.started().await;

        let budget = request.max_tokens.map(|n| n as usize);
        let mut seen = 0usize;
        let mut accepted = 0usize;
        let mut first_fragment_at: Option<Instant> = None;
        let mut text = String::new();
        let mut cancelled = false;

        let outcome = loop {
            let event = if cancelled {
                match tokio::time::timeout(self.config.cancel_grace, rx.recv()).await {
                    Ok(event) => event,
                    Err(_) => {
                        log::warn!("Session did not acknowledge cancel, releasing anyway");
                        break Ok(());
                    }
                }
            } else {
                rx.recv().await
            };

            match event {
                Some(SessionEvent::Fragment(fragment)) => {
                    if cancelled {
                        continue;
                    }
                    seen += 1;
                    if budget.is_some_and(|limit| seen > limit) {
                        log::debug!("Token budget exceeded, cancelling generation");
                        self.session.cancel();
                        cancelled = true;
                        continue;
                    }
                    first_fragment_at.get_or_insert_with(Instant::now);
                    accepted += 1;
                    text.push_str(&fragment);
                    sink.push(&fragment).await;
                }
                Some(SessionEvent::Completed) | Some(SessionEvent::Cancelled) => break Ok(()),
                Some(SessionEvent::Failed(e)) if e.is_cancellation() => break Ok(()),
                Some(SessionEvent::Failed(e)) => {
                    break Err(GenerationError::Failure(e.to_string()));
                }
                None if cancelled => break Ok(()),
                None => {
                    break Err(GenerationError::Failure(
                        "Session closed without completing".to_string(),
                    ));
                }
            }
        };

        // Terminal event seen: the lock may go as soon as this returns
        in_flight.events = None;
        outcome?;

        let stats = GenerationStats {
            tokens: accepted,
            time_to_first_token: first_fragment_at.map(|t| t.duration_since(started)),
            decode_time: first_fragment_at
                .map(|t| t.elapsed())
                .unwrap_or_default(),
        };

        Ok((
            GenerationResult {
                text,
                completion_tokens: accepted,
                cancelled,
                error: None,
            },
            stats,
        ))
    }
}

/// Shared bridge type for server state
pub type SharedBridge = Arc<GenerationBridge>;
