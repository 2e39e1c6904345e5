pub mod cache;
pub mod config;
pub mod error;
pub mod http;
mod redact;
pub mod refresh;
pub mod resources;
pub mod state;
pub mod telemetry;
pub mod types;

pub use error::ApiError;
pub use state::EpdeClient;
