//! Policy tiers and their limits.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{PolicyOverride, PolicyOverrides};
use crate::error::{Result, TurnstileError};

/// Fifteen minutes, the window shared by every built-in tier.
const DEFAULT_WINDOW: Duration = Duration::from_secs(15 * 60);

/// Longest window a configured policy may use.
const MAX_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// A named class of routes sharing one limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Anything no other rule claims
    Default,
    /// Login, token refresh, password reset
    Auth,
    /// Revenue, invoices, payments
    Financial,
    /// Patient records, cases, operations
    Medical,
    /// Bulk read endpoints
    Read,
    /// Administration endpoints
    Admin,
}

impl Tier {
    /// Every tier, in declaration order.
    pub const ALL: [Tier; 6] = [
        Tier::Default,
        Tier::Auth,
        Tier::Financial,
        Tier::Medical,
        Tier::Read,
        Tier::Admin,
    ];

    /// The lowercase name used in configuration and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Default => "default",
            Tier::Auth => "auth",
            Tier::Financial => "financial",
            Tier::Medical => "medical",
            Tier::Read => "read",
            Tier::Admin => "admin",
        }
    }

    fn index(&self) -> usize {
        match self {
            Tier::Default => 0,
            Tier::Auth => 1,
            Tier::Financial => 2,
            Tier::Medical => 3,
            Tier::Read => 4,
            Tier::Admin => 5,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable limit: at most `max_requests` per `window`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    /// Length of the sliding window
    pub window: Duration,
    /// Requests allowed inside one window
    pub max_requests: u64,
    /// Message returned to callers that exceed the limit
    pub denial_message: Arc<str>,
}

impl Policy {
    /// Create a policy.
    pub fn new(window: Duration, max_requests: u64, denial_message: impl Into<Arc<str>>) -> Self {
        Self {
            window,
            max_requests,
            denial_message: denial_message.into(),
        }
    }

    /// The built-in policy for a tier.
    pub fn builtin(tier: Tier) -> Self {
        match tier {
            Tier::Default => Self::new(
                DEFAULT_WINDOW,
                100,
                "Too many requests from this client, please try again later.",
            ),
            Tier::Auth => Self::new(
                DEFAULT_WINDOW,
                5,
                "Too many authentication attempts, please try again later.",
            ),
            Tier::Financial => Self::new(
                DEFAULT_WINDOW,
                20,
                "Too many financial requests, please try again later.",
            ),
            Tier::Medical => Self::new(
                DEFAULT_WINDOW,
                50,
                "Too many medical record requests, please try again later.",
            ),
            Tier::Read => Self::new(
                DEFAULT_WINDOW,
                200,
                "Too many read requests, please try again later.",
            ),
            Tier::Admin => Self::new(
                DEFAULT_WINDOW,
                30,
                "Too many administrative requests, please try again later.",
            ),
        }
    }

    fn apply(&self, tier: Tier, update: &PolicyOverride) -> Result<Self> {
        let window = match update.window_secs {
            Some(0) => {
                return Err(TurnstileError::Config(format!(
                    "policy '{}' has a zero-length window",
                    tier
                )))
            }
            Some(secs) if secs > MAX_WINDOW.as_secs() => {
                return Err(TurnstileError::Config(format!(
                    "policy '{}' window of {}s exceeds the maximum of {}s",
                    tier,
                    secs,
                    MAX_WINDOW.as_secs()
                )))
            }
            Some(secs) => Duration::from_secs(secs),
            None => self.window,
        };

        let max_requests = match update.max_requests {
            Some(0) => {
                return Err(TurnstileError::Config(format!(
                    "policy '{}' allows zero requests",
                    tier
                )))
            }
            Some(max) => max,
            None => self.max_requests,
        };

        let denial_message = update
            .message
            .as_deref()
            .map(Arc::from)
            .unwrap_or_else(|| self.denial_message.clone());

        Ok(Self {
            window,
            max_requests,
            denial_message,
        })
    }
}

/// One policy per tier.
#[derive(Debug, Clone)]
pub struct PolicySet {
    policies: [Arc<Policy>; 6],
}

impl PolicySet {
    /// The built-in limits.
    pub fn builtin() -> Self {
        Self {
            policies: Tier::ALL.map(|tier| Arc::new(Policy::builtin(tier))),
        }
    }

    /// The built-in limits with configured overrides applied.
    pub fn from_overrides(overrides: &PolicyOverrides) -> Result<Self> {
        let mut set = Self::builtin();
        for tier in Tier::ALL {
            if let Some(update) = overrides.get(tier) {
                let policy = set.get(tier).apply(tier, update)?;
                set = set.with_policy(tier, policy);
            }
        }
        Ok(set)
    }

    /// Replace the policy for a single tier.
    pub fn with_policy(mut self, tier: Tier, policy: Policy) -> Self {
        self.policies[tier.index()] = Arc::new(policy);
        self
    }

    /// The policy for a tier.
    pub fn get(&self, tier: Tier) -> &Arc<Policy> {
        &self.policies[tier.index()]
    }
}

impl Default for PolicySet {
    fn default() -> Self {
        Self::builtin()
    }
}
