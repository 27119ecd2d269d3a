//! Application layer - session pool, scheduling and the service facade
//!
//! Composition of the domain types into the running engine: the session
//! pool with its availability tracking, the rate governor, the execution
//! wrapper and the scheduler loop, fronted by [`service::CrawlService`].

pub mod executor;
pub mod pool;
pub mod rate_governor;
pub mod scheduler;
pub mod service;

// Re-export commonly used items for convenience
pub use executor::ExecutionWrapper;
pub use pool::{PoolConfig, PoolError, PoolStatus, SessionLease, SessionPool, SiteAvailability};
pub use rate_governor::{PenaltyState, RateConfig, SessionGovernor};
pub use scheduler::{EngineStats, Scheduler, SchedulerConfig, SchedulerHandle, StatsSnapshot};
pub use service::{CrawlService, QueueStatus};
