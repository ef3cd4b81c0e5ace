//! Counters and recent failures recorded by the engine
//!
//! Steady-state failures never reach the caller; this is where they end up.

use crate::error::LoadError;
use serde::Serialize;
use std::collections::VecDeque;

/// Oldest records are dropped beyond this many
pub const MAX_FAILURE_RECORDS: usize = 64;

/// One absorbed failure
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureRecord {
    /// Engine time of the failure
    pub at: f64,
    pub slot: Option<usize>,
    pub asset_index: Option<usize>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Diagnostics {
    pub cycles_started: u64,
    pub crossfades_completed: u64,
    pub failures_absorbed: u64,
    pub self_heals: u64,
    /// Pool exhaustion or a start on a busy unit
    pub unit_busy: u64,
    pub load_failures: Vec<LoadError>,
    pub recent_failures: VecDeque<FailureRecord>,
}

impl Diagnostics {
    pub fn record_failure(
        &mut self,
        at: f64,
        slot: Option<usize>,
        asset_index: Option<usize>,
        reason: impl Into<String>,
    ) {
        self.failures_absorbed += 1;
        if self.recent_failures.len() == MAX_FAILURE_RECORDS {
            self.recent_failures.pop_front();
        }
        self.recent_failures.push_back(FailureRecord {
            at,
            slot,
            asset_index,
            reason: reason.into(),
        });
    }
}
