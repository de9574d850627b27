//! Advisory admission gate for parallel strategies.

use serde::{Deserialize, Serialize};
use sysinfo::System;

use crate::services::jobs::Strategy;

/// Default floor: below 25% free memory, parallel fan-out is downgraded.
pub const DEFAULT_MIN_FREE_RATIO: f64 = 0.25;

/// Record of a downgrade decision, kept in job metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyDowngrade {
    pub from: Strategy,
    pub to: Strategy,
    pub free_ratio: f64,
}

type SampleFn = dyn Fn() -> f64 + Send + Sync;

/// Samples live memory headroom before admitting a `parallel_*` run.
///
/// Purely advisory: the gate downgrades the strategy one step at a time
/// (`parallel_all` → `parallel_local` → `fallback`) and never fails a job.
pub struct ResourceGate {
    min_free_ratio: f64,
    sampler: Box<SampleFn>,
}

impl ResourceGate {
    pub fn new(min_free_ratio: f64) -> Self {
        Self {
            min_free_ratio,
            sampler: Box::new(sample_free_memory_ratio),
        }
    }

    /// Replace the memory sampler; tests drive the gate with fixed ratios.
    pub fn with_sampler<F>(min_free_ratio: f64, sampler: F) -> Self
    where
        F: Fn() -> f64 + Send + Sync + 'static,
    {
        Self {
            min_free_ratio,
            sampler: Box::new(sampler),
        }
    }

    /// Admit a strategy, possibly downgraded for the current headroom.
    pub fn admit(&self, strategy: Strategy) -> (Strategy, Option<StrategyDowngrade>) {
        let free_ratio = (self.sampler)();
        let admitted = match strategy {
            Strategy::Fallback => Strategy::Fallback,
            _ if free_ratio >= self.min_free_ratio => strategy,
            // Severe pressure collapses straight to sequential.
            _ if free_ratio < self.min_free_ratio / 2.0 => Strategy::Fallback,
            Strategy::ParallelAll => Strategy::ParallelLocal,
            Strategy::ParallelLocal | Strategy::Hybrid => Strategy::Fallback,
        };

        if admitted == strategy {
            (admitted, None)
        } else {
            tracing::warn!(
                from = strategy.as_ref(),
                to = admitted.as_ref(),
                free_ratio,
                "memory headroom low, downgrading strategy"
            );
            (
                admitted,
                Some(StrategyDowngrade {
                    from: strategy,
                    to: admitted,
                    free_ratio,
                }),
            )
        }
    }
}

fn sample_free_memory_ratio() -> f64 {
    let mut system = System::new();
    system.refresh_memory();
    let total = system.total_memory();
    if total == 0 {
        return 1.0;
    }
    system.available_memory() as f64 / total as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate_with(ratio: f64) -> ResourceGate {
        ResourceGate::with_sampler(DEFAULT_MIN_FREE_RATIO, move || ratio)
    }

    #[test]
    fn plenty_of_memory_admits_unchanged() {
        let gate = gate_with(0.8);
        for strategy in [
            Strategy::Fallback,
            Strategy::ParallelLocal,
            Strategy::ParallelAll,
            Strategy::Hybrid,
        ] {
            let (admitted, downgrade) = gate.admit(strategy);
            assert_eq!(admitted, strategy);
            assert!(downgrade.is_none());
        }
    }

    #[test]
    fn low_memory_steps_parallel_all_down() {
        let gate = gate_with(0.2);
        let (admitted, downgrade) = gate.admit(Strategy::ParallelAll);
        assert_eq!(admitted, Strategy::ParallelLocal);
        let downgrade = downgrade.expect("downgrade recorded");
        assert_eq!(downgrade.from, Strategy::ParallelAll);
        assert_eq!(downgrade.to, Strategy::ParallelLocal);
    }

    #[test]
    fn severe_pressure_collapses_to_fallback() {
        let gate = gate_with(0.05);
        assert_eq!(gate.admit(Strategy::ParallelAll).0, Strategy::Fallback);
        assert_eq!(gate.admit(Strategy::ParallelLocal).0, Strategy::Fallback);
        assert_eq!(gate.admit(Strategy::Hybrid).0, Strategy::Fallback);
    }

    #[test]
    fn fallback_is_never_touched() {
        let gate = gate_with(0.0);
        let (admitted, downgrade) = gate.admit(Strategy::Fallback);
        assert_eq!(admitted, Strategy::Fallback);
        assert!(downgrade.is_none());
    }
}
