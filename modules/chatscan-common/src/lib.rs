pub mod config;
pub mod error;
pub mod types;

pub use config::{Config, DiscoveryConfig};
pub use error::{ChatScanError, Result};
pub use types::*;
