// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Completion signals.
//!
//! A [`CompletionSignal`] travels with every message and is resolved exactly
//! once, into [`Outcome::Completed`], [`Outcome::Failed`] or
//! [`Outcome::Dropped`]. Resolution consumes the signal, so resolving twice
//! is impossible by construction. A signal that goes out of scope unresolved
//! resolves as `Dropped`.
//!
//! Fan-out splits one parent into N children:
//!
//! ```text
//!                 ┌── child 0 ──> output 0
//!   parent ──split┼── child 1 ──> output 1
//!                 └── child 2 ──> output 2
//! ```
//!
//! The parent resolves once every child has resolved, combining the child
//! outcomes with a [`SplitPolicy`].

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Deserialize;
use tokio::sync::oneshot;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed(String),
    Dropped,
}

impl Outcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed)
    }
}

/// How a split parent combines the outcomes of its children.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitPolicy {
    /// Completed only if every child completed. Any failure fails the parent,
    /// otherwise any drop drops it.
    #[default]
    FailIfAnyFails,
    /// Completed as soon as one child completed. Without a completed child a
    /// failure wins over a drop.
    SucceedIfAnySucceeds,
}

enum Kind {
    Noop,
    Channel(oneshot::Sender<Outcome>),
    Split(Arc<SplitState>),
    Composite(Vec<CompletionSignal>),
}

pub struct CompletionSignal {
    kind: Option<Kind>,
}

impl CompletionSignal {
    /// Creates a signal and the receiver the producer awaits.
    pub fn new() -> (Self, SignalReceiver) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                kind: Some(Kind::Channel(tx)),
            },
            SignalReceiver { rx },
        )
    }

    /// A signal whose outcome nobody observes.
    pub fn noop() -> Self {
        Self {
            kind: Some(Kind::Noop),
        }
    }

    /// Groups signals so one outcome resolves all of them.
    pub fn composite(mut signals: Vec<CompletionSignal>) -> Self {
        signals.retain(|s| !s.is_noop());
        match signals.len() {
            0 => Self::noop(),
            1 => signals.remove(0),
            _ => Self {
                kind: Some(Kind::Composite(signals)),
            },
        }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self.kind, Some(Kind::Noop))
    }

    /// Splits this signal into `n` children.
    ///
    /// With `n == 1` the signal itself is returned. With `n == 0` there is
    /// nobody left to deliver to, so the signal resolves as `Dropped`.
    pub fn split(self, n: usize, policy: SplitPolicy) -> Vec<CompletionSignal> {
        if n == 1 {
            return vec![self];
        }
        if n == 0 {
            self.dropped();
            return Vec::new();
        }
        if self.is_noop() {
            return (0..n).map(|_| Self::noop()).collect();
        }

        let state = Arc::new(SplitState {
            inner: Mutex::new(SplitInner {
                remaining: n,
                completed: 0,
                dropped: 0,
                failure: None,
                policy,
                parent: Some(self),
            }),
        });
        (0..n)
            .map(|_| Self {
                kind: Some(Kind::Split(Arc::clone(&state))),
            })
            .collect()
    }

    pub fn completed(self) {
        self.resolve(Outcome::Completed);
    }

    pub fn failed(self, reason: impl Into<String>) {
        self.resolve(Outcome::Failed(reason.into()));
    }

    pub fn dropped(self) {
        self.resolve(Outcome::Dropped);
    }

    pub fn resolve(mut self, outcome: Outcome) {
        if let Some(kind) = self.kind.take() {
            fire(kind, outcome);
        }
    }
}

fn fire(kind: Kind, outcome: Outcome) {
    match kind {
        Kind::Noop => {}
        Kind::Channel(tx) => {
            // The producer may have stopped waiting, which is fine.
            let _ = tx.send(outcome);
        }
        Kind::Split(state) => state.child_resolved(outcome),
        Kind::Composite(signals) => {
            for signal in signals {
                signal.resolve(outcome.clone());
            }
        }
    }
}

impl Drop for CompletionSignal {
    fn drop(&mut self) {
        if let Some(kind) = self.kind.take() {
            fire(kind, Outcome::Dropped);
        }
    }
}

impl fmt::Debug for CompletionSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            None => "resolved",
            Some(Kind::Noop) => "noop",
            Some(Kind::Channel(_)) => "channel",
            Some(Kind::Split(_)) => "split",
            Some(Kind::Composite(_)) => "composite",
        };
        f.debug_struct("CompletionSignal").field("kind", &kind).finish()
    }
}

struct SplitState {
    inner: Mutex<SplitInner>,
}

struct SplitInner {
    remaining: usize,
    completed: usize,
    dropped: usize,
    failure: Option<String>,
    policy: SplitPolicy,
    parent: Option<CompletionSignal>,
}

impl SplitState {
    fn child_resolved(&self, outcome: Outcome) {
        let parent_outcome = {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            match outcome {
                Outcome::Completed => inner.completed += 1,
                Outcome::Dropped => inner.dropped += 1,
                Outcome::Failed(reason) => {
                    inner.failure.get_or_insert(reason);
                }
            }
            inner.remaining = inner.remaining.saturating_sub(1);
            if inner.remaining > 0 {
                return;
            }
            let outcome = inner.combine();
            inner.parent.take().map(|parent| (parent, outcome))
        };

        // Resolve outside the lock: the parent may itself be a split child.
        if let Some((parent, outcome)) = parent_outcome {
            parent.resolve(outcome);
        }
    }
}

impl SplitInner {
    fn combine(&mut self) -> Outcome {
        match self.policy {
            SplitPolicy::FailIfAnyFails => {
                if let Some(reason) = self.failure.take() {
                    Outcome::Failed(reason)
                } else if self.dropped > 0 {
                    Outcome::Dropped
                } else {
                    Outcome::Completed
                }
            }
            SplitPolicy::SucceedIfAnySucceeds => {
                if self.completed > 0 {
                    Outcome::Completed
                } else if let Some(reason) = self.failure.take() {
                    Outcome::Failed(reason)
                } else {
                    Outcome::Dropped
                }
            }
        }
    }
}

/// The producer side of a [`CompletionSignal`].
#[derive(Debug)]
pub struct SignalReceiver {
    rx: oneshot::Receiver<Outcome>,
}

impl SignalReceiver {
    pub async fn wait(self) -> Outcome {
        self.rx.await.unwrap_or(Outcome::Dropped)
    }

    /// Returns the outcome if the signal already resolved.
    pub fn try_outcome(&mut self) -> Option<Outcome> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Outcome::Dropped),
        }
    }
}
