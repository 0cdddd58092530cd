pub mod api;
pub mod config;
pub mod server;

pub use api::{handle, ApiRequest, ApiResponse, Method};
pub use config::ServerConfig;
pub use server::serve;
