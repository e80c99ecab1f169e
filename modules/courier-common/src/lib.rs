pub mod config;
pub mod error;

pub use config::{OutboxConfig, RelayConfig, DEFAULT_TENANT};
pub use error::CourierError;
