use std::collections::{BTreeSet, HashSet};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Scanning,
    Exploiting,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Scanning => f.write_str("scanning"),
            Phase::Exploiting => f.write_str("exploiting"),
        }
    }
}

/// Mutable bookkeeping of a running campaign, owned by the scheduler and
/// lent to the pruner and the coverage ingester between rounds.
#[derive(Debug, Clone)]
pub struct CampaignState {
    /// Starts at 1.
    pub round: u32,
    pub phase: Phase,
    /// Functions pruned from the graph and not rediscovered since.
    pub spare_functions: BTreeSet<String>,
    /// Seed file names already run through the profiling binaries.
    pub profiled_seeds: HashSet<String>,
}

impl Default for CampaignState {
    fn default() -> Self {
        Self::new()
    }
}

impl CampaignState {
    pub fn new() -> Self {
        Self {
            round: 1,
            phase: Phase::Scanning,
            spare_functions: BTreeSet::new(),
            profiled_seeds: HashSet::new(),
        }
    }

    /// Moves to the next round; the campaign only ever scans once.
    pub fn advance(&mut self) {
        self.round += 1;
        self.phase = Phase::Exploiting;
    }
}
