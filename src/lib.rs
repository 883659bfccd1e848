// Expose modules for the console binary and tests
pub mod config;
pub mod error;
pub mod sync;

pub use config::AdminConfig;
pub use error::{AdminError, Result};
