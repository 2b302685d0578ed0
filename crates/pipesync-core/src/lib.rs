pub mod config;
pub mod error;
pub mod reference;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{PipesyncError, Result};
pub use reference::ObjectRef;
pub use types::*;
