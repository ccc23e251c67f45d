//! Admission control trait for abstracting the limiter behind the gate.

use std::net::IpAddr;

use super::limiter::Decision;
use super::policy::Tier;

/// What the limiter needs to know about an inbound request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundRequest {
    /// Request path, without query string
    pub path: String,
    /// Resolved client address, if known
    pub client_addr: Option<IpAddr>,
    /// Caller credential with any auth scheme stripped
    pub credential: Option<String>,
    /// Tier pinned by the routing layer, bypassing path selection
    pub tier: Option<Tier>,
}

impl InboundRequest {
    /// Create a request for a path with no client information.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Set the client address.
    pub fn with_client_addr(mut self, addr: IpAddr) -> Self {
        self.client_addr = Some(addr);
        self
    }

    /// Set the caller credential.
    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    /// Pin the request to a tier.
    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = Some(tier);
        self
    }
}

/// Trait for admission control implementations.
///
/// Evaluation is synchronous and bounded: it never performs I/O and never fails.
pub trait AdmissionControl: Send + Sync {
    /// Record the request and decide whether it may proceed.
    fn evaluate(&self, request: &InboundRequest) -> Decision;
}

impl<T: AdmissionControl + ?Sized> AdmissionControl for std::sync::Arc<T> {
    fn evaluate(&self, request: &InboundRequest) -> Decision {
        (**self).evaluate(request)
    }
}
