pub mod outcome;
pub mod round_lock;
pub mod settlement;
pub mod types;
pub mod vrf_engine;

pub use outcome::{FixedOutcomeSource, OutcomeSource, SeededOutcomeSource};
pub use settlement::SettlementEngine;
pub use types::*;
pub use vrf_engine::VrfOutcomeSource;
