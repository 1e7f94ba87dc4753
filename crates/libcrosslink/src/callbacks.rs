//! Continuation callback registry, keyed by caller mission id.
//!
//! Owned by the dispatcher worker; all mutation happens on dispatcher
//! tasks. Delivery is exactly-once by construction: a result (legitimate
//! or timeout) pops the entry, and whichever path runs second finds
//! nothing to deliver.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crosslink_protocol::ResultCode;

use crate::error::CrosslinkError;

/// Caller-supplied handle for reporting a continuation's final result.
pub trait ContinuationCallback: Send + Sync {
    fn on_result(&self, mission_id: u64, code: ResultCode);
}

pub struct CallbackEntry {
    pub callback: Arc<dyn ContinuationCallback>,
    pub target_device_id: String,
    pub free_install: bool,
    pub clean_mission: bool,
}

#[derive(Default)]
pub struct CallbackRegistry {
    entries: HashMap<u64, CallbackEntry>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending continuation. Fails closed when an entry already
    /// exists for the mission id; a live continuation is never overwritten.
    pub fn push(&mut self, mission_id: u64, entry: CallbackEntry) -> Result<(), CrosslinkError> {
        if self.entries.contains_key(&mission_id) {
            warn!(mission_id, "continuation already in progress");
            return Err(CrosslinkError::AlreadyInProgress(mission_id));
        }
        self.entries.insert(mission_id, entry);
        Ok(())
    }

    pub fn pop(&mut self, mission_id: u64) -> Option<CallbackEntry> {
        self.entries.remove(&mission_id)
    }

    pub fn contains(&self, mission_id: u64) -> bool {
        self.entries.contains_key(&mission_id)
    }

    /// False when no entry exists for the id.
    pub fn is_free_install(&self, mission_id: u64) -> bool {
        self.entries
            .get(&mission_id)
            .is_some_and(|e| e.free_install)
    }

    /// False when no entry exists for the id.
    pub fn is_clean_mission(&self, mission_id: u64) -> bool {
        self.entries
            .get(&mission_id)
            .is_some_and(|e| e.clean_mission)
    }

    /// Pop the entry and deliver the result. Returns the popped entry, or
    /// `None` when the id is unknown (result already delivered).
    pub fn notify_result(&mut self, mission_id: u64, code: ResultCode) -> Option<CallbackEntry> {
        let entry = self.entries.remove(&mission_id)?;
        info!(mission_id, code = code.as_i32(), "continuation result");
        entry.callback.on_result(mission_id, code);
        Some(entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
