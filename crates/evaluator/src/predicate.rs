//! Per-condition predicate evaluation with explicit carried state.
//!
//! The evaluator owns one [`ConditionState`] per condition and passes it in
//! each cycle; nothing here keeps ambient state.

use common::{ConditionDef, ConditionValues, Operator};

/// What a condition remembers between cycles.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConditionState {
    /// Value seen on the previous cycle.
    pub last_value: Option<f64>,
    /// Last value that was strictly on one side of the level. Touching the
    /// level exactly does not reset the side a crossing starts from.
    pub last_decisive: Option<f64>,
    /// Whether the predicate held on the previous cycle.
    pub holding: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub fired: bool,
    pub next: ConditionState,
}

/// Advance one condition by one observation.
///
/// Firing policy:
/// - threshold: fires on the transition into holding, not while held
/// - crossing: fires when the value moves from strictly one side of the level
///   to strictly the other; the first observation only establishes a baseline
/// - range: fires every cycle the value is within `[lower, upper]`
pub fn step(def: &ConditionDef, value: f64, prev: &ConditionState) -> Step {
    let (holds, fired, level) = match (def.operator, def.values) {
        (Operator::LessThan, ConditionValues::Single(t)) => {
            let holds = value < t;
            (holds, holds && !prev.holding, Some(t))
        }
        (Operator::GreaterThan, ConditionValues::Single(t)) => {
            let holds = value > t;
            (holds, holds && !prev.holding, Some(t))
        }
        (Operator::CrossesAbove, ConditionValues::Single(t)) => {
            let from_below = prev.last_decisive.is_some_and(|l| l < t);
            let holds = value > t;
            (holds, holds && from_below, Some(t))
        }
        (Operator::CrossesBelow, ConditionValues::Single(t)) => {
            let from_above = prev.last_decisive.is_some_and(|l| l > t);
            let holds = value < t;
            (holds, holds && from_above, Some(t))
        }
        (Operator::Between, ConditionValues::Range { lower, upper }) => {
            let holds = (lower..=upper).contains(&value);
            (holds, holds, None)
        }
        // Normalization never produces these combinations.
        _ => (false, false, None),
    };

    let last_decisive = match level {
        Some(t) if value == t => prev.last_decisive,
        _ => Some(value),
    };

    Step {
        fired,
        next: ConditionState {
            last_value: Some(value),
            last_decisive,
            holding: holds,
        },
    }
}
