//! Resolution strategies and their ranking
//!
//! Each blocker type has a fixed set of strategies allowed to work on it.
//! Candidates are ranked by learned weight, cheapest first on ties, and a
//! strategy that was already tried on a blocker is never offered again.

use crate::blocker::BlockerType;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ways the orchestrator can try to clear a blocker
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionStrategy {
    ApplySass,
    Automate,
    Delegate,
    Threaten,
    Escalate,
    Replace,
}

impl ResolutionStrategy {
    pub const ALL: [ResolutionStrategy; 6] = [
        ResolutionStrategy::ApplySass,
        ResolutionStrategy::Automate,
        ResolutionStrategy::Delegate,
        ResolutionStrategy::Threaten,
        ResolutionStrategy::Escalate,
        ResolutionStrategy::Replace,
    ];

    /// Position in the fixed cost order, cheapest first
    pub fn cost(&self) -> u8 {
        match self {
            ResolutionStrategy::ApplySass => 0,
            ResolutionStrategy::Automate => 1,
            ResolutionStrategy::Delegate => 2,
            ResolutionStrategy::Threaten => 3,
            ResolutionStrategy::Escalate => 4,
            ResolutionStrategy::Replace => 5,
        }
    }

    /// Strategies permitted for a blocker type
    pub fn allowed_for(blocker_type: BlockerType) -> &'static [ResolutionStrategy] {
        use ResolutionStrategy::*;
        match blocker_type {
            BlockerType::Dependency => &[Delegate, Automate, Escalate],
            BlockerType::Resource => &[Automate, Escalate],
            BlockerType::Communication => &[ApplySass, Threaten, Escalate],
            BlockerType::Technical => &[Automate, Delegate, Escalate],
            BlockerType::Process => &[Delegate, Threaten, Escalate],
            BlockerType::Human => &[ApplySass, Delegate, Escalate, Replace],
            BlockerType::Existential => &[ApplySass, Threaten, Replace],
            BlockerType::Unknown => &[Escalate],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStrategy::ApplySass => "apply_sass",
            ResolutionStrategy::Automate => "automate",
            ResolutionStrategy::Delegate => "delegate",
            ResolutionStrategy::Threaten => "threaten",
            ResolutionStrategy::Escalate => "escalate",
            ResolutionStrategy::Replace => "replace",
        }
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order the untried strategies allowed for `blocker_type`.
///
/// `weight` supplies the current success estimate for a strategy. Higher
/// weights come first; equal weights fall back to the cost order.
pub fn rank_strategies<W, E>(
    blocker_type: BlockerType,
    weight: W,
    excluded: E,
) -> Vec<ResolutionStrategy>
where
    W: Fn(ResolutionStrategy) -> f64,
    E: Fn(ResolutionStrategy) -> bool,
{
    let mut ranked: Vec<(ResolutionStrategy, f64)> = ResolutionStrategy::allowed_for(blocker_type)
        .iter()
        .copied()
        .filter(|strategy| !excluded(*strategy))
        .map(|strategy| (strategy, weight(strategy)))
        .collect();

    ranked.sort_by(|(a, wa), (b, wb)| {
        wb.partial_cmp(wa)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.cost().cmp(&b.cost()))
    });
    ranked.into_iter().map(|(strategy, _)| strategy).collect()
}
