//! Pulling limiter inputs out of HTTP requests.

use http::header::{HeaderName, AUTHORIZATION};
use http::{HeaderMap, Request};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{InboundRequest, Tier};

/// Auth schemes stripped from the `Authorization` header.
const CREDENTIAL_SCHEMES: [&str; 3] = ["bearer", "basic", "token"];

/// The connection peer address, stamped on each request by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddr(pub SocketAddr);

/// A tier pinned by the routing layer, e.g. for bulk read or admin endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierOverride(pub Tier);

/// Builds an [`InboundRequest`] from an HTTP request.
///
/// By default only the connection peer address is trusted. Proxy headers are
/// consulted only when configured, since any client can send them.
#[derive(Debug, Clone)]
pub struct RequestExtractor {
    trusted_proxy_headers: Arc<[HeaderName]>,
}

impl RequestExtractor {
    /// Create an extractor trusting the given proxy headers, consulted in order.
    pub fn new<I, S>(trusted_proxy_headers: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let headers = trusted_proxy_headers
            .into_iter()
            .map(|name| {
                HeaderName::from_bytes(name.as_ref().to_ascii_lowercase().as_bytes()).map_err(
                    |e| {
                        TurnstileError::Config(format!(
                            "invalid trusted proxy header '{}': {}",
                            name.as_ref(),
                            e
                        ))
                    },
                )
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            trusted_proxy_headers: headers.into(),
        })
    }

    /// An extractor that ignores proxy headers and trusts only the peer address.
    pub fn peer_only() -> Self {
        Self {
            trusted_proxy_headers: Arc::from(Vec::new()),
        }
    }

    /// Extract the limiter inputs from a request.
    pub fn extract<B>(&self, request: &Request<B>) -> InboundRequest {
        let extensions = request.extensions();
        let peer = extensions.get::<PeerAddr>().map(|p| p.0.ip());

        InboundRequest {
            path: request.uri().path().to_string(),
            client_addr: self.forwarded_addr(request.headers()).or(peer),
            credential: credential(request.headers()),
            tier: extensions.get::<TierOverride>().map(|t| t.0),
        }
    }

    fn forwarded_addr(&self, headers: &HeaderMap) -> Option<IpAddr> {
        self.trusted_proxy_headers.iter().find_map(|name| {
            let value = headers.get(name)?.to_str().ok()?;
            // The nearest proxy appends the address it saw; earlier entries are client-supplied.
            parse_addr(value.rsplit(',').next()?.trim())
        })
    }
}

impl Default for RequestExtractor {
    fn default() -> Self {
        Self::peer_only()
    }
}

fn parse_addr(value: &str) -> Option<IpAddr> {
    value
        .parse::<IpAddr>()
        .ok()
        .or_else(|| value.parse::<SocketAddr>().ok().map(|addr| addr.ip()))
}

fn credential(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();

    let (scheme, rest) = value.split_once(' ').unwrap_or((value, ""));
    let token = if CREDENTIAL_SCHEMES
        .iter()
        .any(|known| scheme.eq_ignore_ascii_case(known))
    {
        rest.trim()
    } else {
        value
    };

    (!token.is_empty()).then(|| token.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> http::request::Builder {
        Request::builder().uri("https://clinic.example/api/patients/12?full=true")
    }

    #[test]
    fn test_path_excludes_query() {
        let req = request().body(()).unwrap();
        let inbound = RequestExtractor::default().extract(&req);

        assert_eq!(inbound.path, "/api/patients/12");
        assert_eq!(inbound.client_addr, None);
        assert_eq!(inbound.credential, None);
        assert_eq!(inbound.tier, None);
    }

    #[test]
    fn test_forwarded_for_takes_nearest_hop() {
        let mut req = request()
            .header("X-Forwarded-For", "1.2.3.4, 203.0.113.9")
            .body(())
            .unwrap();
        req.extensions_mut()
            .insert(PeerAddr("10.0.0.1:4000".parse().unwrap()));

        let extractor = RequestExtractor::new(["x-forwarded-for"]).unwrap();
        let inbound = extractor.extract(&req);
        assert_eq!(inbound.client_addr, Some("203.0.113.9".parse().unwrap()));
    }

    #[test]
    fn test_falls_back_to_peer() {
        let mut req = request()
            .header("X-Forwarded-For", "garbage")
            .body(())
            .unwrap();
        req.extensions_mut()
            .insert(PeerAddr("192.0.2.4:5555".parse().unwrap()));

        let extractor = RequestExtractor::new(["x-forwarded-for"]).unwrap();
        let inbound = extractor.extract(&req);
        assert_eq!(inbound.client_addr, Some("192.0.2.4".parse().unwrap()));
    }

    #[test]
    fn test_default_ignores_proxy_headers() {
        let mut req = request()
            .header("X-Real-IP", "198.51.100.1")
            .header("X-Forwarded-For", "198.51.100.2")
            .body(())
            .unwrap();
        req.extensions_mut()
            .insert(PeerAddr("192.0.2.4:5555".parse().unwrap()));

        let inbound = RequestExtractor::default().extract(&req);
        assert_eq!(inbound.client_addr, Some("192.0.2.4".parse().unwrap()));

        let inbound = RequestExtractor::peer_only().extract(&req);
        assert_eq!(inbound.client_addr, Some("192.0.2.4".parse().unwrap()));

        let extractor = RequestExtractor::new(["x-real-ip"]).unwrap();
        let inbound = extractor.extract(&req);
        assert_eq!(inbound.client_addr, Some("198.51.100.1".parse().unwrap()));
    }

    #[test]
    fn test_custom_header_order() {
        let req = request()
            .header("X-Forwarded-For", "203.0.113.9")
            .header("CF-Connecting-IP", "[2001:db8::1]:443")
            .body(())
            .unwrap();

        let extractor = RequestExtractor::new(["CF-Connecting-IP", "x-forwarded-for"]).unwrap();
        let inbound = extractor.extract(&req);
        assert_eq!(inbound.client_addr, Some("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn test_invalid_header_name() {
        assert!(matches!(
            RequestExtractor::new(["bad header"]),
            Err(TurnstileError::Config(_))
        ));
    }

    #[test]
    fn test_credential_scheme_is_stripped() {
        let req = request()
            .header("Authorization", "Bearer abc.def.ghi")
            .body(())
            .unwrap();
        assert_eq!(
            RequestExtractor::default().extract(&req).credential.as_deref(),
            Some("abc.def.ghi")
        );

        let req = request().header("Authorization", "raw-key").body(()).unwrap();
        assert_eq!(
            RequestExtractor::default().extract(&req).credential.as_deref(),
            Some("raw-key")
        );

        let req = request().header("Authorization", "Bearer ").body(()).unwrap();
        assert_eq!(RequestExtractor::default().extract(&req).credential, None);
    }

    #[test]
    fn test_tier_override() {
        let mut req = request().body(()).unwrap();
        req.extensions_mut().insert(TierOverride(Tier::Read));

        assert_eq!(
            RequestExtractor::default().extract(&req).tier,
            Some(Tier::Read)
        );
    }
}
