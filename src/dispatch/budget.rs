use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// What the run budget counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetUnit {
    /// Cost units reported by the executor per attempt
    #[default]
    Cost,
    /// Wall-clock seconds of attempts, rounded up per attempt
    Seconds,
}

impl fmt::Display for BudgetUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BudgetUnit::Cost => f.write_str("cost"),
            BudgetUnit::Seconds => f.write_str("seconds"),
        }
    }
}

/// Monotonic budget counter with an optional ceiling.
#[derive(Debug, Clone, PartialEq)]
pub struct BudgetMeter {
    unit: BudgetUnit,
    ceiling: Option<u64>,
    consumed: u64,
}

impl BudgetMeter {
    pub fn new(unit: BudgetUnit, ceiling: Option<u64>, consumed: u64) -> Self {
        Self {
            unit,
            ceiling,
            consumed,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(BudgetUnit::Cost, None, 0)
    }

    /// Charge one attempt. Returns the units added.
    pub fn record(&mut self, cost: Option<u64>, elapsed: Duration) -> u64 {
        let added = match self.unit {
            BudgetUnit::Cost => cost.unwrap_or(0),
            BudgetUnit::Seconds => elapsed.as_millis().div_ceil(1000) as u64,
        };
        self.consumed = self.consumed.saturating_add(added);
        added
    }

    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    pub fn ceiling(&self) -> Option<u64> {
        self.ceiling
    }

    pub fn unit(&self) -> BudgetUnit {
        self.unit
    }

    pub fn exhausted(&self) -> bool {
        self.ceiling.is_some_and(|c| self.consumed >= c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cost_budget() {
        let mut meter = BudgetMeter::new(BudgetUnit::Cost, Some(100), 0);
        meter.record(Some(40), Duration::from_secs(9));
        meter.record(Some(40), Duration::ZERO);
        assert_eq!(meter.consumed(), 80);
        assert!(!meter.exhausted());
        meter.record(Some(40), Duration::ZERO);
        assert!(meter.exhausted());
    }

    #[test]
    fn test_seconds_budget_rounds_up() {
        let mut meter = BudgetMeter::new(BudgetUnit::Seconds, Some(3), 0);
        assert_eq!(meter.record(Some(500), Duration::from_millis(1)), 1);
        assert_eq!(meter.record(None, Duration::from_millis(2000)), 2);
        assert_eq!(meter.record(None, Duration::ZERO), 0);
        assert!(meter.exhausted());
    }

    #[test]
    fn test_unlimited_never_exhausts() {
        let mut meter = BudgetMeter::unlimited();
        meter.record(Some(u64::MAX), Duration::ZERO);
        meter.record(Some(1), Duration::ZERO);
        assert_eq!(meter.consumed(), u64::MAX);
        assert!(!meter.exhausted());
    }

    #[test]
    fn test_resumed_meter_keeps_consumption() {
        let meter = BudgetMeter::new(BudgetUnit::Cost, Some(100), 120);
        assert!(meter.exhausted());
        assert_eq!(meter.ceiling(), Some(100));
    }
}
