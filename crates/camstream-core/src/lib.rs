pub mod config;
pub mod errors;
pub mod types;

pub use config::CameraStreamConfig;
pub use errors::*;
pub use types::*;
