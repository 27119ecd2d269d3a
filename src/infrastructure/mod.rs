//! Infrastructure layer - persistence, driver adapter and process plumbing
//!
//! Concrete implementations of the domain's collaborator traits (sqlite task
//! store, Chrome DevTools driver) plus configuration and logging setup.

pub mod config;
pub mod database_connection;
pub mod driver;
pub mod logging;
pub mod task_store;

// Re-export commonly used items
pub use config::{AppConfig, ConfigManager, DatabaseConfig, LoggingConfig};
pub use database_connection::DatabaseConnection;
pub use driver::{CdpDriver, DriverConfig};
pub use logging::init_logging;
pub use task_store::SqliteTaskStore;
