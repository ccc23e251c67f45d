//! Identity key derivation.

use sha2::{Digest, Sha256};
use std::net::IpAddr;

/// Hex characters of the credential digest kept in the key.
const CREDENTIAL_TAG_LEN: usize = 16;

/// Address used when neither a proxy header nor a peer address is known.
const UNKNOWN_ADDR: &str = "unknown";

/// A key that partitions rate limit state per caller.
///
/// Anonymous callers are keyed by address alone. Authenticated callers get
/// a short digest of their credential appended, so two users behind the same
/// NAT are limited independently without the raw secret ever being stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey(String);

impl IdentityKey {
    /// Derive the key for a caller.
    pub fn derive(client_addr: Option<IpAddr>, credential: Option<&str>) -> Self {
        let addr = client_addr
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| UNKNOWN_ADDR.to_string());

        match credential.filter(|c| !c.is_empty()) {
            Some(credential) => Self(format!("{}:{}", addr, credential_tag(credential))),
            None => Self(addr),
        }
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume the key, returning the owned string.
    pub fn into_string(self) -> String {
        self.0
    }
}

impl std::fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn credential_tag(credential: &str) -> String {
    let digest = Sha256::digest(credential.as_bytes());
    let mut tag = hex::encode(digest);
    tag.truncate(CREDENTIAL_TAG_LEN);
    tag
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> Option<IpAddr> {
        Some(s.parse().unwrap())
    }

    #[test]
    fn test_anonymous_key_is_address() {
        let key = IdentityKey::derive(ip("10.0.0.7"), None);
        assert_eq!(key.as_str(), "10.0.0.7");
    }

    #[test]
    fn test_unknown_address() {
        let key = IdentityKey::derive(None, None);
        assert_eq!(key.as_str(), "unknown");
    }

    #[test]
    fn test_credential_does_not_leak() {
        let key = IdentityKey::derive(ip("10.0.0.7"), Some("super-secret-token"));

        assert!(key.as_str().starts_with("10.0.0.7:"));
        assert!(!key.as_str().contains("super-secret-token"));
        assert_eq!(key.as_str().len(), "10.0.0.7:".len() + CREDENTIAL_TAG_LEN);
    }

    #[test]
    fn test_distinct_callers_behind_one_address() {
        let alice = IdentityKey::derive(ip("192.168.1.1"), Some("alice"));
        let bob = IdentityKey::derive(ip("192.168.1.1"), Some("bob"));
        let anon = IdentityKey::derive(ip("192.168.1.1"), None);

        assert_ne!(alice, bob);
        assert_ne!(alice, anon);
        assert_eq!(alice, IdentityKey::derive(ip("192.168.1.1"), Some("alice")));
    }

    #[test]
    fn test_empty_credential_is_anonymous() {
        let key = IdentityKey::derive(ip("::1"), Some(""));
        assert_eq!(key.as_str(), "::1");
    }
}
