//! bookdelta - Book-resale marketplace crawling engine
//!
//! Owns a bounded pool of authenticated browser sessions and schedules
//! prioritized crawl tasks onto them: per-site availability tracking with
//! lazy penalty expiry, a per-session token bucket plus escalating penalty
//! windows, a priority/FIFO scheduler loop with a timeout watchdog, and
//! guaranteed session release on every exit path.
//!
//! Page-content extraction, the analytics schema and the HTTP control
//! surface are external collaborators; see the traits in [`domain`].

// Module declarations
pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod test_support;

// Re-export the surface the embedding application wires together
pub use application::{
    CrawlService, PoolConfig, PoolStatus, RateConfig, SchedulerConfig, SessionPool, StatsSnapshot,
};
pub use domain::{
    BrowserDriver, Clock, CrawlError, CrawlerRegistry, NewTask, PoolEvent, SiteCrawler,
    SystemClock, Task, TaskKind, TaskStatus, TaskStore,
};
pub use infrastructure::{AppConfig, CdpDriver, ConfigManager, DatabaseConnection, SqliteTaskStore};
