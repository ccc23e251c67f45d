//! HTTP admission gate.
//!
//! The gate sits in front of every handler: it extracts the caller's
//! identity and path, asks the limiter for a decision, and either answers
//! with a 429 or forwards the request with rate limit headers attached.

mod extract;
mod layer;
mod response;

pub use extract::{PeerAddr, RequestExtractor, TierOverride};
pub use layer::{gate, GateLayer, GateService};
pub use response::{
    apply_rate_limit_headers, rejection, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING,
    X_RATELIMIT_RESET,
};
