//! Per-(case, stage) serialisation of cache-or-compute calls.
//!
//! The second caller for the same key waits for the first to finish, then
//! re-reads the cache instead of issuing its own external call. Entries are
//! held weakly so idle keys cost nothing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::OwnedMutexGuard;

/// Cached computation stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    ExtractDenial,
    Analyze,
    DraftEmail,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExtractDenial => "extract-denial",
            Self::Analyze => "analyze",
            Self::DraftEmail => "draft-email",
        }
    }
}

type Key = (String, Stage);

#[derive(Debug, Default)]
pub struct SingleFlight {
    slots: Mutex<HashMap<Key, Weak<tokio::sync::Mutex<()>>>>,
}

/// Held while a stage computes; dropping it lets the next caller in.
pub struct FlightGuard {
    _guard: OwnedMutexGuard<()>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, case_id: &str, stage: Stage) -> Arc<tokio::sync::Mutex<()>> {
        let mut slots = match self.slots.lock() {
            Ok(slots) => slots,
            Err(poisoned) => poisoned.into_inner(),
        };
        slots.retain(|_, weak| weak.strong_count() > 0);
        let key = (case_id.to_string(), stage);
        if let Some(existing) = slots.get(&key).and_then(Weak::upgrade) {
            return existing;
        }
        let fresh = Arc::new(tokio::sync::Mutex::new(()));
        slots.insert(key, Arc::downgrade(&fresh));
        fresh
    }

    pub async fn enter(&self, case_id: &str, stage: Stage) -> FlightGuard {
        let slot = self.slot(case_id, stage);
        FlightGuard {
            _guard: slot.lock_owned().await,
        }
    }

    #[cfg(test)]
    fn live_slots(&self) -> usize {
        self.slots
            .lock()
            .map(|s| s.values().filter(|w| w.strong_count() > 0).count())
            .unwrap_or_default()
    }
}
