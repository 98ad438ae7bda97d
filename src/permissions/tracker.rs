//! Denial tracking for one task execution
//!
//! Counts consecutive denials per tool and in total, and decides when the
//! calling runtime must be interrupted. `Interrupted` is terminal until
//! [`DenialTracker::clear`] starts a new run.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Default per-tool denial threshold
pub const DEFAULT_DENIAL_THRESHOLD: u32 = 3;

/// One denied tool call
#[derive(Debug, Clone, Serialize)]
pub struct DenialRecord {
    pub tool_name: String,
    pub tool_call_string: String,
    pub message: String,
    pub is_security_violation: bool,
    pub timestamp: DateTime<Utc>,
}

/// Receives every recorded denial (e.g. a console tracer)
pub trait DenialObserver: Send + Sync {
    fn on_denial(&self, record: &DenialRecord);
}

/// Observer that ignores every denial
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDenialObserver;

impl DenialObserver for NoopDenialObserver {
    fn on_denial(&self, _record: &DenialRecord) {}
}

/// Escalation state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackerState {
    Clean,
    /// The next denial may interrupt the run
    Warned,
    Interrupted,
}

/// Per-run denial tracker
pub struct DenialTracker {
    threshold: u32,
    per_tool: HashMap<String, u32>,
    total: u32,
    records: Vec<DenialRecord>,
    interrupted: bool,
    observer: Arc<dyn DenialObserver>,
}

impl DenialTracker {
    /// Create a tracker; a threshold of zero is raised to one
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            per_tool: HashMap::new(),
            total: 0,
            records: Vec::new(),
            interrupted: false,
            observer: Arc::new(NoopDenialObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn DenialObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Record a denial and return whether the run must be interrupted
    pub fn record_denial(
        &mut self,
        tool_name: &str,
        tool_call_string: &str,
        message: &str,
        is_security_violation: bool,
    ) -> bool {
        let count = self.per_tool.entry(tool_name.to_string()).or_insert(0);
        *count += 1;
        let count = *count;
        self.total += 1;

        let record = DenialRecord {
            tool_name: tool_name.to_string(),
            tool_call_string: tool_call_string.to_string(),
            message: message.to_string(),
            is_security_violation,
            timestamp: Utc::now(),
        };
        self.observer.on_denial(&record);
        self.records.push(record);

        let interrupt = is_security_violation
            || count >= self.threshold
            || self.total >= self.threshold * 2;

        if interrupt && !self.interrupted {
            tracing::warn!(
                "Interrupting run after denial of {} ({} for this tool, {} total)",
                tool_name,
                count,
                self.total
            );
        }
        self.interrupted |= interrupt;
        interrupt
    }

    /// Reset the consecutive-denial counter of a tool after an allowed call
    pub fn record_allow(&mut self, tool_name: &str) {
        self.per_tool.remove(tool_name);
    }

    pub fn was_interrupted(&self) -> bool {
        self.interrupted
    }

    pub fn state(&self) -> TrackerState {
        if self.interrupted {
            return TrackerState::Interrupted;
        }
        if self.total == 0 {
            return TrackerState::Clean;
        }
        let max_per_tool = self.per_tool.values().copied().max().unwrap_or(0);
        if max_per_tool + 1 >= self.threshold || self.total + 1 >= self.threshold * 2 {
            TrackerState::Warned
        } else {
            TrackerState::Clean
        }
    }

    /// Consecutive denials of one tool
    pub fn denial_count(&self, tool_name: &str) -> u32 {
        self.per_tool.get(tool_name).copied().unwrap_or(0)
    }

    pub fn total_denials(&self) -> u32 {
        self.total
    }

    pub fn records(&self) -> &[DenialRecord] {
        &self.records
    }

    /// Start a new run
    pub fn clear(&mut self) {
        self.per_tool.clear();
        self.total = 0;
        self.records.clear();
        self.interrupted = false;
    }
}

impl Default for DenialTracker {
    fn default() -> Self {
        Self::new(DEFAULT_DENIAL_THRESHOLD)
    }
}

impl std::fmt::Debug for DenialTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DenialTracker")
            .field("threshold", &self.threshold)
            .field("per_tool", &self.per_tool)
            .field("total", &self.total)
            .field("interrupted", &self.interrupted)
            .finish()
    }
}
