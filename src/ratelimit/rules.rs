//! Route rules and policy selection.
//!
//! A request path is matched against an ordered rule table; the first rule
//! that matches decides the tier, and paths no rule claims fall back to
//! [`Tier::Default`]. Selection is a pure function of the path.

use tracing::info;

use super::policy::Tier;
use crate::config::RouteRuleConfig;
use crate::error::{Result, TurnstileError};

/// How a rule inspects a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Matcher {
    /// Segment-aware prefix: `/auth` matches `/auth` and `/auth/login`, not `/authors`
    Prefix(String),
    /// Some path segment equals the word, ignoring ASCII case
    Segment(String),
    /// The path contains the text anywhere, ignoring ASCII case
    Contains(String),
}

impl Matcher {
    /// Check a namespace-relative path.
    pub fn matches(&self, path: &str) -> bool {
        match self {
            Matcher::Prefix(prefix) => {
                let prefix = prefix.trim_end_matches('/');
                if prefix.is_empty() {
                    return true;
                }
                match path.strip_prefix(prefix) {
                    Some(rest) => rest.is_empty() || rest.starts_with('/'),
                    None => false,
                }
            }
            Matcher::Segment(word) => path
                .split('/')
                .any(|segment| segment.eq_ignore_ascii_case(word)),
            Matcher::Contains(needle) => path
                .to_ascii_lowercase()
                .contains(&needle.to_ascii_lowercase()),
        }
    }
}

/// A single entry in the rule table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRule {
    /// Tier selected on a match
    pub tier: Tier,
    /// How the path is inspected
    pub matcher: Matcher,
}

impl RouteRule {
    /// Create a rule.
    pub fn new(tier: Tier, matcher: Matcher) -> Self {
        Self { tier, matcher }
    }
}

impl TryFrom<&RouteRuleConfig> for RouteRule {
    type Error = TurnstileError;

    fn try_from(config: &RouteRuleConfig) -> Result<Self> {
        let matcher = match (&config.prefix, &config.segment, &config.contains) {
            (Some(p), None, None) => Matcher::Prefix(p.clone()),
            (None, Some(s), None) => Matcher::Segment(s.clone()),
            (None, None, Some(c)) => Matcher::Contains(c.clone()),
            _ => {
                return Err(TurnstileError::Config(format!(
                    "rule for tier '{}' must set exactly one of prefix, segment or contains",
                    config.tier
                )))
            }
        };
        Ok(Self::new(config.tier, matcher))
    }
}

/// Maps request paths to policy tiers.
#[derive(Debug, Clone)]
pub struct PolicySelector {
    /// Stripped from the front of a path before matching
    namespace: String,
    /// Evaluated in order; first match wins
    rules: Vec<RouteRule>,
}

impl PolicySelector {
    /// Create a selector over an explicit rule table.
    pub fn new(namespace: impl Into<String>, rules: Vec<RouteRule>) -> Self {
        let namespace = namespace.into().trim_end_matches('/').to_string();
        Self { namespace, rules }
    }

    /// The built-in rule table under the given namespace.
    pub fn builtin(namespace: impl Into<String>) -> Self {
        Self::new(namespace, default_rules())
    }

    /// Build a selector from configuration, using the built-in table unless one is supplied.
    pub fn from_config(namespace: &str, rules: Option<&[RouteRuleConfig]>) -> Result<Self> {
        match rules {
            Some(configs) => {
                let rules = configs
                    .iter()
                    .map(RouteRule::try_from)
                    .collect::<Result<Vec<_>>>()?;
                info!(rules = rules.len(), "Using configured route rules");
                Ok(Self::new(namespace, rules))
            }
            None => Ok(Self::builtin(namespace)),
        }
    }

    /// Select the tier for a request path.
    pub fn select(&self, path: &str) -> Tier {
        let relative = self.strip_namespace(path);
        self.rules
            .iter()
            .find(|rule| rule.matcher.matches(relative))
            .map(|rule| rule.tier)
            .unwrap_or(Tier::Default)
    }

    /// The rule table in evaluation order.
    pub fn rules(&self) -> &[RouteRule] {
        &self.rules
    }

    fn strip_namespace<'a>(&self, path: &'a str) -> &'a str {
        if self.namespace.is_empty() {
            return path;
        }
        match path.strip_prefix(self.namespace.as_str()) {
            Some("") => "/",
            Some(rest) if rest.starts_with('/') => rest,
            _ => path,
        }
    }
}

impl Default for PolicySelector {
    fn default() -> Self {
        Self::builtin("/api")
    }
}

fn default_rules() -> Vec<RouteRule> {
    vec![
        RouteRule::new(Tier::Auth, Matcher::Prefix("/auth".to_string())),
        RouteRule::new(Tier::Financial, Matcher::Contains("revenue".to_string())),
        RouteRule::new(Tier::Financial, Matcher::Contains("invoice".to_string())),
        RouteRule::new(Tier::Medical, Matcher::Segment("patients".to_string())),
        RouteRule::new(Tier::Medical, Matcher::Segment("cases".to_string())),
        RouteRule::new(Tier::Medical, Matcher::Segment("operations".to_string())),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_selection() {
        let selector = PolicySelector::default();

        assert_eq!(selector.select("/auth/login"), Tier::Auth);
        assert_eq!(selector.select("/auth/login/extra"), Tier::Auth);
        assert_eq!(selector.select("/patients/123"), Tier::Medical);
        assert_eq!(selector.select("/widgets"), Tier::Default);
    }

    #[test]
    fn test_namespace_is_stripped() {
        let selector = PolicySelector::default();

        assert_eq!(selector.select("/api/auth/refresh"), Tier::Auth);
        assert_eq!(selector.select("/api/cases/9/notes"), Tier::Medical);
        assert_eq!(selector.select("/api"), Tier::Default);
        assert_eq!(selector.select("/apiary/auth"), Tier::Default);
    }

    #[test]
    fn test_financial_paths() {
        let selector = PolicySelector::default();

        assert_eq!(selector.select("/api/revenue/monthly"), Tier::Financial);
        assert_eq!(selector.select("/api/invoices/42"), Tier::Financial);
        // Financial rules come before medical ones.
        assert_eq!(selector.select("/api/patients/7/invoices"), Tier::Financial);
    }

    #[test]
    fn test_prefix_respects_segment_boundaries() {
        let selector = PolicySelector::default();

        assert_eq!(selector.select("/authors"), Tier::Default);
        assert_eq!(selector.select("/auth"), Tier::Auth);
        assert_eq!(selector.select("/showcases"), Tier::Default);
    }

    #[test]
    fn test_matching_ignores_case() {
        let selector = PolicySelector::default();

        assert_eq!(selector.select("/api/Patients/1"), Tier::Medical);
        assert_eq!(selector.select("/api/billing/INVOICE-9"), Tier::Financial);
    }

    #[test]
    fn test_configured_rules_replace_builtin() {
        let configs = vec![
            RouteRuleConfig {
                tier: Tier::Admin,
                prefix: Some("/admin/".to_string()),
                segment: None,
                contains: None,
            },
            RouteRuleConfig {
                tier: Tier::Read,
                prefix: None,
                segment: Some("reports".to_string()),
                contains: None,
            },
        ];
        let selector = PolicySelector::from_config("/api", Some(configs.as_slice())).unwrap();

        assert_eq!(selector.rules().len(), 2);
        assert_eq!(selector.select("/api/admin/users"), Tier::Admin);
        assert_eq!(selector.select("/api/reports/daily"), Tier::Read);
        assert_eq!(selector.select("/api/auth/login"), Tier::Default);
    }

    #[test]
    fn test_rule_needs_exactly_one_matcher() {
        let neither = RouteRuleConfig {
            tier: Tier::Auth,
            prefix: None,
            segment: None,
            contains: None,
        };
        assert!(RouteRule::try_from(&neither).is_err());

        let both = RouteRuleConfig {
            tier: Tier::Auth,
            prefix: Some("/auth".to_string()),
            segment: None,
            contains: Some("login".to_string()),
        };
        assert!(matches!(
            PolicySelector::from_config("/api", Some(std::slice::from_ref(&both))),
            Err(TurnstileError::Config(_))
        ));
    }

    #[test]
    fn test_empty_namespace() {
        let selector = PolicySelector::builtin("");
        assert_eq!(selector.select("/api/auth/login"), Tier::Default);
        assert_eq!(selector.select("/auth/login"), Tier::Auth);
    }
}
