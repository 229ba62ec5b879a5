//! Docrag Core Library
//!
//! Foundational utilities shared by every docrag crate:
//! - Error handling (`AppError`, `AppResult`)
//! - Logging infrastructure
//! - Configuration management
//! - Retry and token estimation helpers

pub mod config;
pub mod error;
pub mod logging;
pub mod retry;
pub mod tokens;

// Re-export commonly used types
pub use config::AppConfig;
pub use error::{AppError, AppResult};
pub use retry::RetryPolicy;
pub use tokens::estimate_tokens;
