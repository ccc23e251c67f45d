//! Rate limiting logic and state management.

mod backend;
mod clock;
mod identity;
mod limiter;
mod policy;
mod rules;
mod store;
mod sweeper;

pub use backend::{AdmissionControl, InboundRequest};
pub use clock::{Clock, ManualClock, SystemClock};
pub use identity::IdentityKey;
pub use limiter::{Decision, RateLimiter};
pub use policy::{Policy, PolicySet, Tier};
pub use rules::{Matcher, PolicySelector, RouteRule};
pub use store::{Admission, ResetMode, StoreError, WindowEntry, WindowStore};
pub use sweeper::Sweeper;
