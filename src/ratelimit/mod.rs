//! Rate limiting logic and state management.

mod bucket;
mod clock;
mod limit;
mod limiter;
mod metrics;
mod pool;

pub use bucket::{Bucket, Reservation};
pub use clock::{Clock, ManualClock, SystemClock};
pub use limit::{inline_pool_name, InlineSpec, LimitKind, LimitRef, PoolConfig, INLINE_POOL_PREFIX};
pub use limiter::{retry_after_for, Decision, Limiter, LimiterBuilder};
pub use metrics::{Metrics, PoolStats, Snapshot};
pub use pool::{Pool, PoolSettings, DEFAULT_CLEAN_EVERY, DEFAULT_IDLE_TIMEOUT};
