pub mod binance;
pub mod indicators;
pub mod predicate;
pub mod scheduler;
pub mod snapshot;

pub use binance::BinanceMarketData;
pub use predicate::{ConditionState, Step};
pub use scheduler::{CycleReport, Evaluator, EvaluatorConfig, EvaluatorHandle, EvaluatorStatus, PairState};
pub use snapshot::Snapshot;
