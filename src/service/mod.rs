pub use app_error::{AppError, AppResult};
pub use config::{HubConfig, NetworkConfig, TlsConfig};
pub use tracing_config::setup_local_tracing;

mod app_error;
mod config;
mod tracing_config;
