//! Domain module - Core business logic and entities
//!
//! This module contains the entities, value objects and state machines the
//! scheduling engine is built from, plus the traits for the external
//! collaborators (browser driver, site crawlers, task store).
//!
//! Modern Rust module organization (Rust 2018+ style):
//! - Each module is its own file in the domain/ directory
//! - Public exports are defined here for convenience

pub mod clock;
pub mod collaborators;
pub mod constants;
pub mod events;
pub mod repositories;
pub mod session;
pub mod site_state;
pub mod task;

// Re-export commonly used items for convenience
pub use clock::{Clock, SystemClock};
pub use collaborators::{
    BrowserDriver, CrawlError, CrawlerRegistry, DriverError, DriverSession, SiteCrawler,
};
pub use events::PoolEvent;
pub use repositories::{StoreError, TaskStore};
pub use session::{SessionId, SessionRecord, SessionSnapshot};
pub use site_state::{SiteState, SiteStateView, SiteStatus};
pub use task::{NewTask, Task, TaskId, TaskKind, TaskStatus};
