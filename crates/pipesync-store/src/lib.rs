pub mod sqlite;

pub use sqlite::{Seed, SqliteStore};
