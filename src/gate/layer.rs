//! Tower middleware that gates every request through the limiter.

use futures::future::{self, BoxFuture};
use futures::FutureExt;
use http::{Request, Response};
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};

use super::extract::RequestExtractor;
use super::response::{apply_rate_limit_headers, rejection};
use crate::ratelimit::{AdmissionControl, RateLimiter};

/// A layer that places a [`GateService`] in front of a handler.
pub struct GateLayer<L = RateLimiter> {
    limiter: Arc<L>,
    extractor: RequestExtractor,
}

impl<L> GateLayer<L> {
    /// Create a gate layer that trusts only the connection peer address.
    pub fn new(limiter: Arc<L>) -> Self {
        Self {
            limiter,
            extractor: RequestExtractor::default(),
        }
    }

    /// Use a specific request extractor.
    pub fn with_extractor(mut self, extractor: RequestExtractor) -> Self {
        self.extractor = extractor;
        self
    }
}

impl<L> Clone for GateLayer<L> {
    fn clone(&self) -> Self {
        Self {
            limiter: self.limiter.clone(),
            extractor: self.extractor.clone(),
        }
    }
}

impl<S, L> Layer<S> for GateLayer<L> {
    type Service = GateService<S, L>;

    fn layer(&self, inner: S) -> Self::Service {
        GateService {
            inner,
            limiter: self.limiter.clone(),
            extractor: self.extractor.clone(),
        }
    }
}

/// Wrap a handler so every request is evaluated before it runs.
pub fn gate<S, L>(inner: S, limiter: Arc<L>) -> GateService<S, L> {
    GateLayer::new(limiter).layer(inner)
}

/// Middleware service that enforces rate limits.
///
/// Denied requests are answered with a 429 and never reach the inner
/// service. Allowed requests are forwarded untouched; only the rate limit
/// headers are added to whatever the inner service returns.
pub struct GateService<S, L = RateLimiter> {
    inner: S,
    limiter: Arc<L>,
    extractor: RequestExtractor,
}

impl<S: Clone, L> Clone for GateService<S, L> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: self.limiter.clone(),
            extractor: self.extractor.clone(),
        }
    }
}

impl<S, L, ReqBody, ResBody> Service<Request<ReqBody>> for GateService<S, L>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    L: AdmissionControl + 'static,
    ResBody: From<String> + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        let inbound = self.extractor.extract(&request);
        let decision = self.limiter.evaluate(&inbound);

        if !decision.allowed {
            return future::ready(Ok(rejection(&decision))).boxed();
        }

        let response = self.inner.call(request);
        async move {
            let mut response = response.await?;
            apply_rate_limit_headers(response.headers_mut(), &decision);
            Ok(response)
        }
        .boxed()
    }
}
