//! The three workflow stages.

pub mod finalizer;
pub mod initializer;
pub mod monitor;

pub use finalizer::Finalizer;
pub use initializer::Initializer;
pub use monitor::{Monitor, PollOutcome};
