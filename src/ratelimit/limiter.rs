//! Core rate limiter implementation.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::backend::{AdmissionControl, InboundRequest};
use super::clock::{Clock, SystemClock};
use super::identity::IdentityKey;
use super::policy::{Policy, PolicySet, Tier};
use super::rules::PolicySelector;
use super::store::{Admission, WindowStore};
use super::sweeper::Sweeper;
use crate::config::LimitingConfig;
use crate::error::{Result, TurnstileError};

/// The verdict for one request, with everything a client needs to back off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Tier whose policy was applied
    pub tier: Tier,
    /// Requests allowed per window
    pub limit: u64,
    /// Requests left in the current window
    pub remaining: u64,
    /// Monotonic reset deadline
    pub reset_at: Instant,
    /// Reset deadline as unix seconds
    pub reset_at_unix: i64,
    /// How long a denied caller should wait
    pub retry_after: Option<Duration>,
    /// Message shown to denied callers
    pub denial_message: Arc<str>,
}

impl Decision {
    fn from_admission(
        tier: Tier,
        policy: &Policy,
        admission: Admission,
        now: Instant,
        clock: &dyn Clock,
    ) -> Self {
        let allowed = admission.count <= policy.max_requests;
        let reset_in = admission.reset_at.saturating_duration_since(now);

        Self {
            allowed,
            tier,
            limit: policy.max_requests,
            remaining: policy.max_requests.saturating_sub(admission.count),
            reset_at: admission.reset_at,
            reset_at_unix: unix_deadline(clock, reset_in),
            retry_after: (!allowed).then_some(reset_in),
            denial_message: policy.denial_message.clone(),
        }
    }

    /// An allow verdict used when the store could not record the request.
    fn fail_open(tier: Tier, policy: &Policy, now: Instant, clock: &dyn Clock) -> Self {
        Self {
            allowed: true,
            tier,
            limit: policy.max_requests,
            remaining: policy.max_requests,
            reset_at: now.checked_add(policy.window).unwrap_or(now),
            reset_at_unix: unix_deadline(clock, policy.window),
            retry_after: None,
            denial_message: policy.denial_message.clone(),
        }
    }

    /// Retry delay in whole seconds, rounded up so clients never retry early.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after.map(ceil_secs)
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    duration
        .as_secs()
        .saturating_add(u64::from(duration.subsec_nanos() > 0))
}

fn unix_deadline(clock: &dyn Clock, reset_in: Duration) -> i64 {
    let reset_in = i64::try_from(ceil_secs(reset_in)).unwrap_or(i64::MAX);
    clock.wall_now().timestamp().saturating_add(reset_in)
}

/// The admission controller: resolves identity and policy, records, judges.
///
/// This struct is thread-safe and can be shared across multiple tasks.
#[derive(Debug)]
pub struct RateLimiter {
    store: Arc<WindowStore>,
    policies: PolicySet,
    selector: PolicySelector,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a rate limiter with the built-in policies and rules.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create a rate limiter with the built-in policies and rules on a given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self::with_parts(
            PolicySet::builtin(),
            PolicySelector::default(),
            Arc::new(WindowStore::new(clock)),
        )
    }

    /// Assemble a rate limiter from its parts. The store's clock is used throughout.
    pub fn with_parts(policies: PolicySet, selector: PolicySelector, store: Arc<WindowStore>) -> Self {
        let clock = store.clock().clone();
        Self {
            store,
            policies,
            selector,
            clock,
        }
    }

    /// Build a rate limiter from configuration.
    pub fn from_config(config: &LimitingConfig) -> Result<Self> {
        Self::from_config_with_clock(config, Arc::new(SystemClock::new()))
    }

    /// Build a rate limiter from configuration on a given clock.
    pub fn from_config_with_clock(config: &LimitingConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        if config.sweep_interval_secs == 0 {
            return Err(TurnstileError::Config(
                "sweep_interval_secs must be greater than zero".to_string(),
            ));
        }
        let policies = PolicySet::from_overrides(&config.policies)?;
        let selector = PolicySelector::from_config(&config.namespace, config.rules.as_deref())?;
        let store = Arc::new(WindowStore::with_options(
            clock,
            config.max_tracked_keys,
            config.reset_mode,
        ));

        info!(
            max_tracked_keys = config.max_tracked_keys,
            reset_mode = ?config.reset_mode,
            namespace = %config.namespace,
            rules = selector.rules().len(),
            "Rate limiter configured"
        );

        Ok(Self::with_parts(policies, selector, store))
    }

    /// Evaluate a request.
    ///
    /// The request is recorded before it is judged, so denied requests still
    /// count toward the window.
    ///
    /// Window state is kept per identity, not per identity and tier. Every
    /// request from a caller lands in the same entry whatever its tier, and
    /// each decision compares that shared count against the limit of the
    /// request's own tier. A caller who has made 100 default-tier requests
    /// starts its next `read` request at 101 of 200. The entry's reset
    /// deadline comes from the window of the request that created it.
    pub fn evaluate(&self, request: &InboundRequest) -> Decision {
        let key = IdentityKey::derive(request.client_addr, request.credential.as_deref());
        let tier = request
            .tier
            .unwrap_or_else(|| self.selector.select(&request.path));
        let policy = self.policies.get(tier);
        let now = self.clock.now();

        let decision = match self.store.record_and_count_at(key.as_str(), policy.window, now) {
            Ok(admission) => {
                Decision::from_admission(tier, policy, admission, now, self.clock.as_ref())
            }
            Err(e) => {
                warn!(
                    key = %key,
                    path = %request.path,
                    tier = %tier,
                    error = %e,
                    "Rate limit store unavailable, allowing request"
                );
                return Decision::fail_open(tier, policy, now, self.clock.as_ref());
            }
        };

        if decision.allowed {
            debug!(
                key = %key,
                path = %request.path,
                tier = %tier,
                remaining = decision.remaining,
                "Request admitted"
            );
        } else {
            info!(
                key = %key,
                path = %request.path,
                tier = %tier,
                limit = decision.limit,
                retry_after_secs = decision.retry_after_secs(),
                "Rate limit exceeded"
            );
        }

        decision
    }

    /// Start the periodic eviction sweep for this limiter's store.
    pub fn spawn_sweeper(&self, interval: Duration) -> Sweeper {
        Sweeper::spawn(self.store.clone(), interval)
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<WindowStore> {
        &self.store
    }

    /// The policy applied to a tier.
    pub fn policy(&self, tier: Tier) -> &Arc<Policy> {
        self.policies.get(tier)
    }

    /// The path selector.
    pub fn selector(&self) -> &PolicySelector {
        &self.selector
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl AdmissionControl for RateLimiter {
    fn evaluate(&self, request: &InboundRequest) -> Decision {
        RateLimiter::evaluate(self, request)
    }
}
