pub mod config;
pub mod error;
pub mod types;
pub mod utils;

pub use error::{Error, Result};
pub use types::*;
