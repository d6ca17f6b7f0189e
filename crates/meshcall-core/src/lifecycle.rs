use serde::{Deserialize, Serialize};

use crate::errors::LifecycleError;

/// Where a registered identity is in its register → call → deregister sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Stage {
    Unregistered,
    Registered,
    Resolved,
    Called,
    Deregistered,
}

impl Stage {
    /// Forward-only; `Deregistered` is reachable from every registered stage.
    pub fn can_advance_to(self, next: Stage) -> bool {
        use Stage::*;
        matches!(
            (self, next),
            (Unregistered, Registered)
                | (Registered, Resolved)
                | (Resolved, Called)
                | (Registered | Resolved | Called, Deregistered)
        )
    }
}

/// Tracks the stage of one identity and refuses backward moves.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    stage: Stage,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self { stage: Stage::Unregistered }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn advance(&mut self, next: Stage) -> Result<(), LifecycleError> {
        if !self.stage.can_advance_to(next) {
            return Err(LifecycleError { from: self.stage, to: next });
        }
        tracing::debug!(from = ?self.stage, to = ?next, "lifecycle transition");
        self.stage = next;
        Ok(())
    }
}
