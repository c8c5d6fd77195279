//! Scripted in-memory session for tests
//!
//! Replays a fixed list of fragments for every prompt, honours `cancel()`
//! between fragments and records a trace of everything it did.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{EventCallback, InferenceSession, Prompt, SessionError, SessionEvent};

pub struct ScriptedSession {
    model: String,
    fragments: Vec<String>,
    ready: AtomicBool,
    failure: Mutex<Option<SessionError>>,
    fragment_delay: Duration,
    current_cancel: Mutex<Option<Arc<AtomicBool>>>,
    prompts: Arc<Mutex<Vec<Prompt>>>,
    trace: Arc<Mutex<Vec<String>>>,
    resets: AtomicUsize,
    cancels: AtomicUsize,
}

impl ScriptedSession {
    pub fn new<I, S>(model: impl Into<String>, fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            model: model.into(),
            fragments: fragments.into_iter().map(Into::into).collect(),
            ready: AtomicBool::new(true),
            failure: Mutex::new(None),
            fragment_delay: Duration::ZERO,
            current_cancel: Mutex::new(None),
            prompts: Arc::new(Mutex::new(Vec::new())),
            trace: Arc::new(Mutex::new(Vec::new())),
            resets: AtomicUsize::new(0),
            cancels: AtomicUsize::new(0),
        }
    }

    /// Start out not ready; flip with [`set_ready`](Self::set_ready)
    pub fn not_ready(self) -> Self {
        self.ready.store(false, Ordering::SeqCst);
        self
    }

    /// Emit `error` after the scripted fragments instead of completing
    pub fn with_failure_after(self, error: SessionError) -> Self {
        *self.failure.lock() = Some(error);
        self
    }

    pub fn with_fragment_delay(mut self, delay: Duration) -> Self {
        self.fragment_delay = delay;
        self
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn clear_failure(&self) {
        *self.failure.lock() = None;
    }

    /// Text of every submitted prompt, in submission order
    pub fn submitted_prompts(&self) -> Vec<String> {
        self.prompts.lock().iter().map(|p| p.text.clone()).collect()
    }

    /// Every submitted prompt including images
    pub fn submitted(&self) -> Vec<Prompt> {
        self.prompts.lock().clone()
    }

    /// `start:<prompt>`, `fragment:<text>` and `end:<prompt>` entries
    pub fn trace(&self) -> Vec<String> {
        self.trace.lock().clone()
    }

    pub fn reset_count(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    pub fn cancel_count(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    fn scripted_failure(&self) -> Option<SessionError> {
        self.failure.lock().as_ref().map(|e| match e {
            SessionError::NotReady => SessionError::NotReady,
            SessionError::Cancelled => SessionError::Cancelled,
            SessionError::Inference(msg) => SessionError::Inference(msg.clone()),
            SessionError::Image(msg) => SessionError::Image(msg.clone()),
            SessionError::Http(e) => SessionError::Inference(e.to_string()),
        })
    }
}

#[async_trait]
impl InferenceSession for ScriptedSession {
    fn model_name(&self) -> String {
        self.model.clone()
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn reset(&self) -> Result<(), SessionError> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn submit(&self, prompt: Prompt, on_event: EventCallback) -> Result<(), SessionError> {
        if !self.is_ready() {
            return Err(SessionError::NotReady);
        }

        let cancel = Arc::new(AtomicBool::new(false));
        *self.current_cancel.lock() = Some(cancel.clone());

        let label = prompt.text.clone();
        self.prompts.lock().push(prompt);

        let fragments = self.fragments.clone();
        let failure = self.scripted_failure();
        let delay = self.fragment_delay;
        let trace = self.trace.clone();

        tokio::spawn(async move {
            trace.lock().push(format!("start:{}", label));
            for fragment in fragments {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if cancel.load(Ordering::SeqCst) {
                    trace.lock().push(format!("end:{}", label));
                    on_event(SessionEvent::Cancelled);
                    return;
                }
                trace.lock().push(format!("fragment:{}", fragment));
                on_event(SessionEvent::Fragment(fragment));
            }
            trace.lock().push(format!("end:{}", label));
            match failure {
                Some(error) => on_event(SessionEvent::Failed(error)),
                None => on_event(SessionEvent::Completed),
            }
        });

        Ok(())
    }

    fn cancel(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        if let Some(flag) = self.current_cancel.lock().as_ref() {
            flag.store(true, Ordering::SeqCst);
        }
    }
}
