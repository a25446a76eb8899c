//! Debounced idle shutdown.
//!
//! Every detachment arms a check that runs after the debounce delay. Checks
//! are never cancelled: re-checking a non-empty registry is a no-op, so only
//! the last one armed can matter.

use std::time::Duration;

use task_reactor::ReactorHandle;

use crate::registry::SessionRegistry;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdleVerdict {
    /// No session is attached; the run may end
    Idle,
    Busy { sessions: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdlePolicy {
    debounce: Duration,
}

impl Default for IdlePolicy {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE)
    }
}

impl IdlePolicy {
    pub fn new(debounce: Duration) -> Self {
        Self { debounce }
    }

    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    /// Schedule `check` to run once the debounce delay has passed.
    pub fn arm<T>(&self, reactor: &ReactorHandle<T>, check: T) {
        reactor.schedule_in(check, self.debounce);
    }

    pub fn evaluate(&self, registry: &SessionRegistry) -> IdleVerdict {
        if registry.is_empty() {
            IdleVerdict::Idle
        } else {
            IdleVerdict::Busy {
                sessions: registry.len(),
            }
        }
    }
}
