//! Mocks and fixtures shared by the pipesync test suites.

pub mod engine;
pub mod fixtures;
pub mod store;

pub use engine::ScriptedEngine;
pub use store::MemoryStore;
