//! Rate limiting logic and state management.

mod adapter;
mod clock;
mod limiter;
mod policy;
mod window;

pub use adapter::{
    TooManyRequests, LIMIT_HEADER, REMAINING_HEADER, RETRY_AFTER_HEADER, TOO_MANY_REQUESTS,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use limiter::{Decision, KeyScope, RateLimiter};
pub use policy::{default_policies, Policy, PolicyConfig, PolicyRegistry};
pub use window::{
    InMemoryWindowStore, WindowEntry, WindowKey, WindowKeyParts, WindowKeyRef, WindowStore,
    DEFAULT_SWEEP_INTERVAL,
};
