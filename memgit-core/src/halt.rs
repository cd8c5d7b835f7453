//! Process-wide task-queue halt switch.
//!
//! Owned explicitly and shared by `Arc` between every store that should
//! observe the same halt state.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

/// Snapshot of the halt flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HaltStatus {
    /// Whether claims are currently refused.
    pub halted: bool,
    /// Reason given when halting.
    pub reason: Option<String>,
    /// When the halt took effect.
    pub since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct HaltState {
    reason: String,
    since: DateTime<Utc>,
}

/// Global halt flag with idempotent set and clear.
#[derive(Debug, Default)]
pub struct HaltSwitch {
    state: RwLock<Option<HaltState>>,
}

impl HaltSwitch {
    /// A switch in the running state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Halt. Returns `true` if this call changed the state; a repeated halt
    /// keeps the original reason.
    pub fn halt(&self, reason: &str) -> bool {
        let mut state = self.state.write();
        if state.is_some() {
            return false;
        }
        *state = Some(HaltState {
            reason: reason.to_string(),
            since: Utc::now(),
        });
        true
    }

    /// Clear the flag. Returns `true` if the switch was halted.
    pub fn resume(&self) -> bool {
        self.state.write().take().is_some()
    }

    /// Whether claims are refused.
    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.state.read().is_some()
    }

    /// The halt reason, if halted.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.state.read().as_ref().map(|s| s.reason.clone())
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> HaltStatus {
        let state = self.state.read();
        HaltStatus {
            halted: state.is_some(),
            reason: state.as_ref().map(|s| s.reason.clone()),
            since: state.as_ref().map(|s| s.since),
        }
    }
}
