//! Dispatch core: scheduling, admission control, retries and the engine
//! that ties them together.

pub mod engine;
pub mod rate_limiter;
pub mod retry;
pub mod scheduler;

pub use engine::{
    DispatchEngine, DispatchStats, DispatchTotals, EngineBuilder, EngineConfig, LoopState,
    ShutdownReport, StatusCounts, TickOutcome,
};
pub use rate_limiter::{ChannelUsage, RateLimiter, RateLimiterConfig};
pub use retry::RetryPolicy;
pub use scheduler::{DeferKind, Deferred, PriorityScheduler, QueueCapacities, QueueDepths};
