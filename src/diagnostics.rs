//! Runtime counters.
//!
//! [`CycleStats`] tallies what the state machine did; the router keeps its
//! own [`RouterStats`] for the I/O side.  Both are folded into a
//! [`StatsSnapshot`] for the periodic `STATS |` report.

use serde::{Deserialize, Serialize};

use crate::fsm::CycleState;
use crate::fsm::context::{Disposition, FaultCode, IgnoreReason, LogRecord, Outcome};
use crate::router::RouterStats;

/// Counters derived from step outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleStats {
    pub cycles_started: u64,
    pub cycles_completed: u64,
    /// Indexed by [`FaultCode::index`].
    pub faults: [u64; 4],
    pub events_applied: u64,
    pub events_ignored: u64,
    /// Indexed by [`IgnoreReason::index`].
    pub ignored: [u64; IgnoreReason::COUNT],
    pub commands_emitted: u64,
}

impl CycleStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one step outcome into the counters.
    pub fn observe(&mut self, outcome: &Outcome) {
        if let Disposition::Ignored(reason) = outcome.disposition {
            self.events_ignored += 1;
            self.ignored[reason.index()] += 1;
            return;
        }
        self.events_applied += 1;

        if outcome.command.is_some() {
            self.commands_emitted += 1;
        }
        match &outcome.record {
            Some(LogRecord::CanDetected { .. }) => self.cycles_started += 1,
            Some(LogRecord::FillComplete(_)) => self.cycles_completed += 1,
            Some(LogRecord::FillStart { .. }) | None => {}
        }
        if let Some(fault) = &outcome.fault {
            self.faults[fault.code.index()] += 1;
        }
    }

    pub fn faults_for(&self, code: FaultCode) -> u64 {
        self.faults[code.index()]
    }

    pub fn ignored_for(&self, reason: IgnoreReason) -> u64 {
        self.ignored[reason.index()]
    }

    pub fn total_faults(&self) -> u64 {
        self.faults.iter().sum()
    }

    /// Completed cycles over finished cycles; `None` before the first one ends.
    pub fn yield_ratio(&self) -> Option<f32> {
        let finished = self.cycles_completed + self.total_faults();
        (finished > 0).then(|| self.cycles_completed as f32 / finished as f32)
    }
}

/// Point-in-time view for the periodic report.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub state: CycleState,
    pub cycle: CycleStats,
    pub router: RouterStats,
    pub deadlines_fired: u64,
    /// State entries since start, transient hops included.
    pub transitions: u64,
}
