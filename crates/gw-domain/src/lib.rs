pub mod config;
pub mod error;
pub mod wire;

pub use config::Config;
pub use error::{Error, Result};
