pub mod persist;
pub mod phase;
pub mod syncer;
pub mod tags;

pub use phase::{Action, Outcome, RunPhase};
pub use syncer::{PassReport, Reconciler};
