//! Rotating "thinking" indicator shown while a request is in flight.
//!
//! DESIGN
//! ======
//! The indicator is a lease: [`ThinkingLease::start`] spawns a tokio
//! interval task that advances a shared frame index, and dropping the
//! lease aborts that task. Whoever owns the pending request owns the
//! lease, so every way out of the sending state stops the rotation.

#[cfg(test)]
#[path = "thinking_test.rs"]
mod thinking_test;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};

/// Time each frame stays on screen.
pub const THINKING_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ThinkingFrame {
    pub emoji: &'static str,
    pub text: &'static str,
    pub subtitle: &'static str,
}

pub const THINKING_FRAMES: [ThinkingFrame; 5] = [
    ThinkingFrame { emoji: "💭", text: "The assistant is thinking...", subtitle: "Working on your question" },
    ThinkingFrame { emoji: "🔍", text: "Searching for information...", subtitle: "Hang on, results are coming" },
    ThinkingFrame { emoji: "📊", text: "Analyzing the data...", subtitle: "The system is hard at work" },
    ThinkingFrame { emoji: "✨", text: "Preparing the answer...", subtitle: "Almost done, thanks for waiting" },
    ThinkingFrame { emoji: "🤖", text: "Connecting to the AI...", subtitle: "The model is on it" },
];

#[derive(Debug)]
pub struct ThinkingLease {
    index: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl ThinkingLease {
    /// Start at frame 0 and advance one frame per `period`.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn start(period: Duration) -> Self {
        let index = Arc::new(AtomicUsize::new(0));
        let ticker = Arc::clone(&index);
        let task = tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            loop {
                interval.tick().await;
                let next = (ticker.load(Ordering::Relaxed) + 1) % THINKING_FRAMES.len();
                ticker.store(next, Ordering::Relaxed);
            }
        });
        Self { index, task }
    }

    #[must_use]
    pub fn index(&self) -> usize {
        self.index.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn frame(&self) -> ThinkingFrame {
        THINKING_FRAMES[self.index() % THINKING_FRAMES.len()]
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Shared index cell, for observing the rotation after the lease is gone.
    #[cfg(test)]
    pub(crate) fn index_handle(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.index)
    }
}

impl Drop for ThinkingLease {
    fn drop(&mut self) {
        self.task.abort();
    }
}
