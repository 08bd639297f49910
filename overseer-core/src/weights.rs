//! Learned success rates per (blocker type, strategy)

use crate::blocker::BlockerType;
use crate::strategy::ResolutionStrategy;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Key of the pattern weight table
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WeightKey {
    pub blocker_type: BlockerType,
    pub strategy: ResolutionStrategy,
}

impl WeightKey {
    pub fn new(blocker_type: BlockerType, strategy: ResolutionStrategy) -> Self {
        Self {
            blocker_type,
            strategy,
        }
    }
}

impl fmt::Display for WeightKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.blocker_type, self.strategy)
    }
}

/// Success counters for one table entry
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StrategyStats {
    pub successes: u64,
    pub attempts: u64,
}

impl StrategyStats {
    /// Laplace-smoothed success rate, always strictly inside (0, 1)
    pub fn rate(&self) -> f64 {
        (self.successes as f64 + 1.0) / (self.attempts as f64 + 2.0)
    }

    pub fn record(&mut self, success: bool) {
        self.attempts += 1;
        if success {
            self.successes += 1;
        }
    }
}
