//! Stream dispatch: grouping rules and the per-session engine

pub mod engine;
pub mod grouping;

pub use engine::{DispatchCounters, DispatchEngine};
pub use grouping::{GroupingKey, GroupingMask, IndexField};
