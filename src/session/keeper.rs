//! Activity-driven proactive credential renewal.
//!
//! DESIGN
//! ======
//! UI code reports user presence (scroll, pointer, keys, taps, clicks) on an
//! [`ActivityBus`]. A mounted [`SessionKeeper`] owns one subscription and a
//! background task that debounces signals: each signal restarts a 500 ms
//! timer and only the trailing signal of a burst runs [`maybe_refresh`].
//! Renewal happens on the keeper task, never on the emitter, so the action
//! that produced the signal is not delayed.
//!
//! Only *proactive* renewal lives here. An already-expired credential is left
//! for the reactive 401 path in the HTTP layer, and failed renewals are
//! logged without logging the user out.
//!
//! LIFECYCLE
//! =========
//! Mounting without a stored credential yields an inert keeper with no
//! subscription and no task. [`SessionKeeper::teardown`] aborts the task and
//! waits for it, so no renewal can land after it returns.

#[cfg(test)]
#[path = "keeper_test.rs"]
mod keeper_test;

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::credential::{Credential, SessionContext};
use crate::clock::Clock;
use crate::net::error::ApiError;

pub const DEFAULT_DEBOUNCE_MS: u64 = 500;
pub const DEFAULT_REFRESH_WINDOW_MS: u64 = 30_000;
pub const DEFAULT_RENEWED_LIFETIME_MS: u64 = 3 * 60 * 1000;
pub const DEFAULT_MIN_LIFETIME_MS: u64 = 45_000;

const ACTIVITY_CHANNEL_CAPACITY: usize = 64;

// =============================================================================
// ACTIVITY
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityKind {
    Scroll,
    PointerMove,
    KeyDown,
    Click,
    TouchStart,
}

/// Activity kinds the keeper treats as user presence.
pub const WATCHED_ACTIVITY: [ActivityKind; 5] = [
    ActivityKind::Scroll,
    ActivityKind::PointerMove,
    ActivityKind::KeyDown,
    ActivityKind::Click,
    ActivityKind::TouchStart,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivitySignal {
    pub kind: ActivityKind,
    pub at_ms: i64,
}

/// Fan-out point for activity signals. Cheap to clone.
#[derive(Clone)]
pub struct ActivityBus {
    tx: broadcast::Sender<ActivitySignal>,
    clock: Arc<dyn Clock>,
}

impl ActivityBus {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (tx, _) = broadcast::channel(ACTIVITY_CHANNEL_CAPACITY);
        Self { tx, clock }
    }

    /// Report one activity signal. Never blocks.
    pub fn emit(&self, kind: ActivityKind) {
        let signal = ActivitySignal { kind, at_ms: self.clock.now_ms() };
        if self.tx.send(signal).is_err() {
            debug!(?kind, "activity signal dropped; no listeners");
        }
    }

    /// Number of attached listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }

    fn subscribe(&self) -> broadcast::Receiver<ActivitySignal> {
        self.tx.subscribe()
    }
}

// =============================================================================
// POLICY
// =============================================================================

/// Timing knobs for proactive renewal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshPolicy {
    /// Quiet period after the last signal before checking expiry.
    pub debounce: Duration,
    /// Renew when the credential expires within this window.
    pub refresh_window: Duration,
    /// Lifetime assigned to a renewed credential.
    pub renewed_lifetime: Duration,
    /// Renewed credentials living shorter than this are logged as suspect.
    pub min_lifetime: Duration,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            refresh_window: Duration::from_millis(DEFAULT_REFRESH_WINDOW_MS),
            renewed_lifetime: Duration::from_millis(DEFAULT_RENEWED_LIFETIME_MS),
            min_lifetime: Duration::from_millis(DEFAULT_MIN_LIFETIME_MS),
        }
    }
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

// =============================================================================
// RENEWAL
// =============================================================================

/// Network call that exchanges the ambient session cookie for a new token.
#[async_trait]
pub trait CredentialRenewer: Send + Sync {
    async fn renew(&self) -> Result<String, ApiError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    NoCredential,
    NoExpiry,
    /// Left for the reactive path.
    Expired,
    NotDue,
    Renewed { expires_at_ms: i64 },
    Failed,
}

/// Renew the credential if it expires within the refresh window.
pub async fn maybe_refresh(
    session: &SessionContext,
    renewer: &dyn CredentialRenewer,
    clock: &dyn Clock,
    policy: &RefreshPolicy,
) -> RefreshOutcome {
    let Some(current) = session.credential() else {
        return RefreshOutcome::NoCredential;
    };
    let Some(remaining) = current.remaining_ms(clock.now_ms()) else {
        return RefreshOutcome::NoExpiry;
    };
    if remaining <= 0 {
        return RefreshOutcome::Expired;
    }
    if remaining >= millis(policy.refresh_window) {
        return RefreshOutcome::NotDue;
    }

    info!(remaining_ms = remaining, "proactively refreshing credential");
    let token = match renewer.renew().await {
        Ok(token) => token,
        Err(e) => {
            warn!(error = %e, "credential refresh failed");
            return RefreshOutcome::Failed;
        }
    };

    let now = clock.now_ms();
    let mut expires_at_ms = now.saturating_add(millis(policy.renewed_lifetime));
    if let Some(jwt_exp) = Credential::new(token.as_str(), None).jwt_expiry_ms() {
        expires_at_ms = expires_at_ms.min(jwt_exp);
    }
    if expires_at_ms - now < millis(policy.min_lifetime) {
        warn!(lifetime_ms = expires_at_ms - now, "renewed credential is already close to expiry");
    }
    let renewed = Credential::new(token, Some(expires_at_ms));

    match session.set_credential(&renewed) {
        Ok(()) => {
            info!(expires_at_ms, "credential refreshed");
            RefreshOutcome::Renewed { expires_at_ms }
        }
        Err(e) => {
            warn!(error = %e, "failed to store refreshed credential");
            RefreshOutcome::Failed
        }
    }
}

// =============================================================================
// KEEPER
// =============================================================================

pub struct SessionKeeper {
    task: Option<JoinHandle<()>>,
    last_activity_ms: Arc<AtomicI64>,
}

impl SessionKeeper {
    /// Attach to `bus` if a credential is present; otherwise return an inert keeper.
    #[must_use]
    pub fn mount(
        session: SessionContext,
        renewer: Arc<dyn CredentialRenewer>,
        clock: Arc<dyn Clock>,
        bus: &ActivityBus,
        policy: RefreshPolicy,
    ) -> Self {
        let last_activity_ms = Arc::new(AtomicI64::new(0));
        if session.credential().is_none() {
            debug!("no credential at mount; session keeper inert");
            return Self { task: None, last_activity_ms };
        }

        let rx = bus.subscribe();
        let last = last_activity_ms.clone();
        let task = tokio::spawn(async move {
            run_keeper(rx, session, renewer, clock, policy, last).await;
        });
        debug!("session keeper mounted");
        Self { task: Some(task), last_activity_ms }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Timestamp of the most recent watched signal, 0 if none yet.
    #[must_use]
    pub fn last_activity_ms(&self) -> i64 {
        self.last_activity_ms.load(Ordering::SeqCst)
    }

    /// Detach from the bus and cancel any pending debounce timer.
    pub async fn teardown(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "session keeper task failed");
                }
            }
            debug!("session keeper torn down");
        }
    }
}

impl Drop for SessionKeeper {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run_keeper(
    mut rx: broadcast::Receiver<ActivitySignal>,
    session: SessionContext,
    renewer: Arc<dyn CredentialRenewer>,
    clock: Arc<dyn Clock>,
    policy: RefreshPolicy,
    last_activity_ms: Arc<AtomicI64>,
) {
    let mut deadline: Option<Instant> = None;
    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Ok(signal) => {
                    if WATCHED_ACTIVITY.contains(&signal.kind) {
                        last_activity_ms.store(signal.at_ms, Ordering::SeqCst);
                        deadline = Some(Instant::now() + policy.debounce);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "activity listener lagged");
                    last_activity_ms.store(clock.now_ms(), Ordering::SeqCst);
                    deadline = Some(Instant::now() + policy.debounce);
                }
                Err(RecvError::Closed) => break,
            },
            () = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                deadline = None;
                let outcome = maybe_refresh(&session, renewer.as_ref(), clock.as_ref(), &policy).await;
                debug!(?outcome, "activity refresh check");
            }
        }
    }
}
