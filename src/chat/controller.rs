//! Conversation controller: one transcript per selected chat endpoint.
//!
//! SYSTEM CONTEXT
//! ==============
//! The controller sits between a UI (the `lisa` CLI, or any other front end)
//! and the [`ChatApi`]. It loads persisted history when an endpoint is
//! selected, appends user messages optimistically, asks the backend for an
//! answer and reconciles the reply into the transcript. Credentials are
//! never handled here; the API reads them from the shared session.
//!
//! STATE MACHINE
//! =============
//! `Idle -> LoadingHistory -> Ready <-> Sending`, `Ready <-> ClearingHistory`.
//! Selecting an endpoint from any state bumps a generation counter, clears
//! the transcript and drops the pending request. Every in-flight call
//! captures the generation it was issued under; a result arriving under a
//! newer generation is discarded instead of merged.
//!
//! ERROR HANDLING
//! ==============
//! Nothing here returns an error to the caller. History failures degrade to
//! an empty transcript, answer failures to a fixed fallback bot message,
//! clear failures to an error notice. Outcome enums report what happened.
//!
//! CONCURRENCY
//! ===========
//! State sits behind a `std::sync::Mutex` that is never held across an
//! `.await`. In-flight calls hold a [`FlightGuard`]; if the calling future
//! is dropped mid-request the guard settles the state back to `Ready`
//! (with the fallback reply for sends), so cancellation cannot strand the
//! controller in `Sending`.

#[cfg(test)]
#[path = "controller_test.rs"]
mod controller_test;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::endpoint::ConversationEndpoint;
use super::message::{BotReply, Message, explanation_reply, format_timestamp_ms, messages_from_history};
use super::thinking::{THINKING_INTERVAL, ThinkingFrame, ThinkingLease};
use super::transcript::Transcript;
use crate::clock::Clock;
use crate::config::DEFAULT_HISTORY_PAGE_SIZE;
use crate::net::api::{AnswerRequest, ChatApi, HistoryQuery};
use crate::net::error::ApiError;
use crate::net::types::{ExplanationRequest, QuizReview};
use crate::session::credential::SessionContext;

/// Bot reply appended when an answer request fails.
pub const SEND_FAILURE_TEXT: &str = "Error, cannot connect to server";

/// Bot reply appended when an explanation request fails.
pub const EXPLANATION_FAILURE_TEXT: &str = "Could not load the explanation. Please try again later.";

pub const CLEAR_FAILURE_NOTICE: &str = "Could not clear chat history. Please try again later.";

// =============================================================================
// COLLABORATORS
// =============================================================================

/// Speech output for bot replies.
pub trait Speaker: Send + Sync {
    fn speak(&self, text: &str);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSpeaker;

impl Speaker for NoopSpeaker {
    fn speak(&self, _text: &str) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeKind {
    Success,
    Error,
}

/// Transient, dismissible notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub kind: NoticeKind,
    pub text: String,
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// Writes notices to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notice: Notice) {
        match notice.kind {
            NoticeKind::Success => info!(text = %notice.text, "notice"),
            NoticeKind::Error => warn!(text = %notice.text, "notice"),
        }
    }
}

// =============================================================================
// OUTCOMES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    LoadingHistory,
    Ready,
    Sending,
    ClearingHistory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Blank,
    /// A request is already pending.
    Busy,
    /// No endpoint selected, or history still loading or clearing.
    NotReady,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Answered,
    /// The request failed and the fallback reply was appended.
    Failed,
    /// The endpoint changed while the request was in flight.
    Discarded,
    Rejected(RejectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded { count: usize },
    Empty,
    Failed,
    Discarded,
    /// No signed-in user, so there is no history to load.
    NoUser,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearOutcome {
    Cleared { deleted: u64 },
    Failed,
    Rejected(RejectReason),
    Discarded,
}

/// Snapshot of everything a UI renders.
#[derive(Debug, Clone, Serialize)]
pub struct ChatView {
    pub phase: Phase,
    pub endpoint: Option<ConversationEndpoint>,
    pub messages: Vec<Message>,
    pub thinking: Option<ThinkingFrame>,
    /// Ready with nothing to show; the UI's empty-state prompt.
    pub is_empty_state: bool,
}

// =============================================================================
// CONTROLLER
// =============================================================================

struct PendingRequest {
    generation: u64,
    lease: ThinkingLease,
}

struct Inner {
    endpoint: Option<ConversationEndpoint>,
    generation: u64,
    phase: Phase,
    transcript: Transcript,
    pending: Option<PendingRequest>,
}

pub struct ConversationController {
    api: Arc<dyn ChatApi>,
    session: SessionContext,
    clock: Arc<dyn Clock>,
    speaker: Arc<dyn Speaker>,
    notifier: Arc<dyn Notifier>,
    user: Option<String>,
    history_page_size: u32,
    thinking_interval: Duration,
    voice_output: AtomicBool,
    inner: Mutex<Inner>,
}

impl ConversationController {
    #[must_use]
    pub fn new(api: Arc<dyn ChatApi>, session: SessionContext, clock: Arc<dyn Clock>) -> Self {
        Self {
            api,
            session,
            clock,
            speaker: Arc::new(NoopSpeaker),
            notifier: Arc::new(LogNotifier),
            user: None,
            history_page_size: DEFAULT_HISTORY_PAGE_SIZE,
            thinking_interval: THINKING_INTERVAL,
            voice_output: AtomicBool::new(false),
            inner: Mutex::new(Inner {
                endpoint: None,
                generation: 0,
                phase: Phase::Idle,
                transcript: Transcript::default(),
                pending: None,
            }),
        }
    }

    #[must_use]
    pub fn with_speaker(mut self, speaker: Arc<dyn Speaker>) -> Self {
        self.speaker = speaker;
        self
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Fixed user id. Without it the id is read from the credential's subject.
    #[must_use]
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    #[must_use]
    pub fn with_history_page_size(mut self, size: u32) -> Self {
        self.history_page_size = size.max(1);
        self
    }

    #[must_use]
    pub fn with_thinking_interval(mut self, interval: Duration) -> Self {
        self.thinking_interval = interval;
        self
    }

    pub fn set_voice_output(&self, enabled: bool) {
        self.voice_output.store(enabled, Ordering::Relaxed);
    }

    #[must_use]
    pub fn voice_output(&self) -> bool {
        self.voice_output.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.lock().phase
    }

    #[must_use]
    pub fn view(&self) -> ChatView {
        let inner = self.lock();
        ChatView {
            phase: inner.phase,
            endpoint: inner.endpoint.clone(),
            messages: inner.transcript.messages().to_vec(),
            thinking: inner.pending.as_ref().map(|p| p.lease.frame()),
            is_empty_state: inner.phase == Phase::Ready && inner.transcript.is_empty(),
        }
    }

    /// Selectable endpoints from the backend catalog.
    ///
    /// # Errors
    ///
    /// Returns the [`ApiError`] from the catalog request.
    pub async fn catalog(&self) -> Result<Vec<ConversationEndpoint>, ApiError> {
        let entries = self.api.fetch_catalog().await?;
        Ok(entries.into_iter().map(ConversationEndpoint::from).collect())
    }

    /// Make `endpoint` active and load its persisted history.
    pub async fn select_endpoint(&self, endpoint: ConversationEndpoint) -> LoadOutcome {
        let generation = {
            let mut inner = self.lock();
            inner.generation += 1;
            inner.endpoint = Some(endpoint.clone());
            inner.transcript.clear();
            inner.pending = None;
            inner.phase = Phase::LoadingHistory;
            inner.generation
        };
        info!(source = %endpoint.source_key, generation, "endpoint selected");

        let Some(user) = self.current_user() else {
            return if self.settle_load(generation, Vec::new()) {
                LoadOutcome::NoUser
            } else {
                LoadOutcome::Discarded
            };
        };

        let query = HistoryQuery {
            user,
            source: endpoint.source_key.clone(),
            limit: self.history_page_size,
            skip: 0,
        };
        let guard = FlightGuard::new(self, generation, OnCancel::Ready);
        let result = self.api.fetch_history(&query).await;
        guard.disarm();

        let (messages, failed) = match result {
            Ok(records) => (messages_from_history(records), false),
            Err(e) => {
                warn!(error = %e, source = %query.source, "history load failed");
                (Vec::new(), true)
            }
        };
        let count = messages.len();
        if !self.settle_load(generation, messages) {
            return LoadOutcome::Discarded;
        }
        match (failed, count) {
            (true, _) => LoadOutcome::Failed,
            (false, 0) => LoadOutcome::Empty,
            (false, count) => LoadOutcome::Loaded { count },
        }
    }

    /// Append `text` as a user message and ask the active endpoint for an answer.
    pub async fn send_message(&self, text: &str) -> SendOutcome {
        let text = text.trim();
        if text.is_empty() {
            return SendOutcome::Rejected(RejectReason::Blank);
        }
        let user_message = Message::user(text, self.clock.now_ms());
        let (generation, endpoint) = match self.begin_pending(Some(user_message)) {
            Ok(started) => started,
            Err(reason) => return SendOutcome::Rejected(reason),
        };

        let request = if endpoint.is_aggregate() {
            Some(AnswerRequest::Aggregate { query: text.to_owned() })
        } else {
            self.current_user().map(|user| AnswerRequest::Topic {
                query: text.to_owned(),
                source: endpoint.source_key.clone(),
                user,
            })
        };

        let api = Arc::clone(&self.api);
        self.run_pending(generation, SEND_FAILURE_TEXT, async move {
            let request = request.ok_or(ApiError::MissingCredential)?;
            api.ask(&request).await.map(BotReply::from)
        })
        .await
    }

    /// Ask for an explanation of a reviewed quiz question.
    ///
    /// Goes through the same pending/indicator/generation machinery as
    /// [`send_message`](Self::send_message) but appends only the bot reply.
    pub async fn request_explanation(&self, review: &QuizReview) -> SendOutcome {
        let (generation, endpoint) = match self.begin_pending(None) {
            Ok(started) => started,
            Err(reason) => return SendOutcome::Rejected(reason),
        };
        let request =
            ExplanationRequest::for_review(review, &endpoint.source_key, format_timestamp_ms(self.clock.now_ms()));

        let api = Arc::clone(&self.api);
        self.run_pending(generation, EXPLANATION_FAILURE_TEXT, async move {
            let response = api.explain(&request).await?;
            explanation_reply(response)
        })
        .await
    }

    /// Delete the active endpoint's persisted history.
    pub async fn clear_history(&self) -> ClearOutcome {
        let (generation, endpoint) = {
            let mut inner = self.lock();
            if inner.pending.is_some() || inner.phase == Phase::Sending {
                return ClearOutcome::Rejected(RejectReason::Busy);
            }
            let Some(endpoint) = inner.endpoint.clone().filter(|_| inner.phase == Phase::Ready) else {
                return ClearOutcome::Rejected(RejectReason::NotReady);
            };
            inner.phase = Phase::ClearingHistory;
            (inner.generation, endpoint)
        };

        let guard = FlightGuard::new(self, generation, OnCancel::Ready);
        let result = match self.current_user() {
            Some(user) => self.api.clear_history(&user, &endpoint.source_key).await,
            None => Err(ApiError::MissingCredential),
        };
        guard.disarm();

        let notice;
        let outcome;
        {
            let mut inner = self.lock();
            if inner.generation != generation {
                debug!(generation, "discarding stale clear result");
                return ClearOutcome::Discarded;
            }
            inner.phase = Phase::Ready;
            match result {
                Ok(deleted) => {
                    inner.transcript.clear();
                    info!(source = %endpoint.source_key, deleted, "history cleared");
                    notice = Notice { kind: NoticeKind::Success, text: format!("Deleted {deleted} chat messages.") };
                    outcome = ClearOutcome::Cleared { deleted };
                }
                Err(e) => {
                    warn!(error = %e, source = %endpoint.source_key, "history clear failed");
                    notice = Notice { kind: NoticeKind::Error, text: CLEAR_FAILURE_NOTICE.to_owned() };
                    outcome = ClearOutcome::Failed;
                }
            }
        }
        self.notifier.notify(notice);
        outcome
    }

    // -------------------------------------------------------------------------
    // internals
    // -------------------------------------------------------------------------

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_user(&self) -> Option<String> {
        self.user.clone().or_else(|| self.session.user_id())
    }

    /// Install `messages` if `generation` is still current. Returns false when stale.
    fn settle_load(&self, generation: u64, messages: Vec<Message>) -> bool {
        let mut inner = self.lock();
        if inner.generation != generation {
            debug!(generation, current = inner.generation, "discarding stale history");
            return false;
        }
        inner.transcript.replace(messages);
        inner.phase = Phase::Ready;
        true
    }

    /// Enter `Sending`: checks readiness, appends `user_message`, starts the indicator.
    fn begin_pending(&self, user_message: Option<Message>) -> Result<(u64, ConversationEndpoint), RejectReason> {
        let mut inner = self.lock();
        if inner.pending.is_some() || inner.phase == Phase::Sending {
            return Err(RejectReason::Busy);
        }
        let Some(endpoint) = inner.endpoint.clone().filter(|_| inner.phase == Phase::Ready) else {
            return Err(RejectReason::NotReady);
        };
        if let Some(message) = user_message {
            inner.transcript.push(message);
        }
        let generation = inner.generation;
        inner.phase = Phase::Sending;
        inner.pending = Some(PendingRequest { generation, lease: ThinkingLease::start(self.thinking_interval) });
        Ok((generation, endpoint))
    }

    /// Await `call` and append its reply (or `fallback`) unless the endpoint changed.
    async fn run_pending<F>(&self, generation: u64, fallback: &'static str, call: F) -> SendOutcome
    where
        F: Future<Output = Result<BotReply, ApiError>>,
    {
        let guard = FlightGuard::new(self, generation, OnCancel::Reply(fallback));
        let result = call.await;
        guard.disarm();

        let spoken;
        let outcome;
        {
            let mut inner = self.lock();
            if inner.generation != generation {
                debug!(generation, current = inner.generation, "discarding stale reply");
                return SendOutcome::Discarded;
            }
            let now = self.clock.now_ms();
            match result {
                Ok(reply) => {
                    spoken = Some(reply.text.clone());
                    inner.transcript.push(reply.into_message(now));
                    outcome = SendOutcome::Answered;
                }
                Err(e) => {
                    warn!(error = %e, retryable = e.retryable(), "answer request failed");
                    spoken = None;
                    inner.transcript.push(Message::bot(fallback, None, now));
                    outcome = SendOutcome::Failed;
                }
            }
            inner.pending = None;
            inner.phase = Phase::Ready;
        }

        if let Some(text) = spoken.filter(|_| self.voice_output()) {
            self.speaker.speak(&text);
        }
        outcome
    }

    /// Settle a request whose future was dropped before it completed.
    fn settle_cancelled(&self, generation: u64, on_cancel: OnCancel) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }
        let had_pending = inner.pending.take_if(|p| p.generation == generation).is_some();
        if let (OnCancel::Reply(text), true) = (on_cancel, had_pending) {
            let now = self.clock.now_ms();
            inner.transcript.push(Message::bot(text, None, now));
        }
        inner.phase = Phase::Ready;
        debug!(generation, "in-flight request cancelled");
    }
}

// =============================================================================
// FLIGHT GUARD
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum OnCancel {
    Ready,
    Reply(&'static str),
}

/// Armed for the duration of one network call. If it is dropped while
/// still armed, the call's future was cancelled.
struct FlightGuard<'a> {
    controller: &'a ConversationController,
    generation: u64,
    on_cancel: OnCancel,
    armed: bool,
}

impl<'a> FlightGuard<'a> {
    fn new(controller: &'a ConversationController, generation: u64, on_cancel: OnCancel) -> Self {
        Self { controller, generation, on_cancel, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.controller.settle_cancelled(self.generation, self.on_cancel);
        }
    }
}
