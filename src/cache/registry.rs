//! Policy registration and per-endpoint resolution.
//!
//! Startup code registers named policies and maps path patterns to them,
//! either as a *group* base policy (applies to every endpoint under the
//! pattern) or as an *endpoint* policy. Three pattern styles are supported:
//!
//! | Pattern         | Matches                    |
//! |-----------------|----------------------------|
//! | `/about`        | `/about`                   |
//! | `/posts/:slug`  | `/posts/hello`             |
//! | `/blog/*`       | `/blog`, `/blog/2024/post` |
//!
//! The effective policy for a path is
//! `default ⊕ global base ⊕ first matching group ⊕ first matching endpoint`,
//! computed once per (group, endpoint) pair and then reused.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::debug;

use super::error::CacheError;
use super::lock::{rw_read, rw_write};
use super::policy::{Policy, PolicyLayer};

const SOURCE: &str = "cache::registry";

/// A single path segment, either a literal string or a named capture (`:name`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Static(String),
    Parameter,
}

/// A compiled endpoint or group path pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointPattern {
    Exact(String),
    Parameterized(Vec<Segment>),
    Prefix(String),
}

impl EndpointPattern {
    /// Compiles `pattern`. A trailing slash (other than on `/`) is ignored.
    pub fn parse(pattern: &str) -> Self {
        let pattern = trim_trailing_slash(pattern);

        if let Some(prefix) = pattern.strip_suffix("/*") {
            return Self::Prefix(prefix.to_owned());
        }

        if pattern.contains(':') {
            let segments = pattern
                .split('/')
                .filter(|s| !s.is_empty())
                .map(|s| {
                    if s.starts_with(':') {
                        Segment::Parameter
                    } else {
                        Segment::Static(s.to_owned())
                    }
                })
                .collect();
            return Self::Parameterized(segments);
        }

        Self::Exact(pattern.to_owned())
    }

    /// Returns `true` if `path` falls under this pattern.
    pub fn matches(&self, path: &str) -> bool {
        let path = trim_trailing_slash(path);
        match self {
            Self::Exact(p) => p == path,
            Self::Parameterized(segments) => {
                let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
                parts.len() == segments.len()
                    && segments.iter().zip(parts).all(|(seg, part)| match seg {
                        Segment::Static(s) => s == part,
                        Segment::Parameter => true,
                    })
            }
            Self::Prefix(prefix) => match path.strip_prefix(prefix.as_str()) {
                Some(rest) => rest.is_empty() || rest.starts_with('/') || prefix.is_empty(),
                None => false,
            },
        }
    }
}

fn trim_trailing_slash(path: &str) -> &str {
    if path != "/" {
        path.strip_suffix('/').unwrap_or(path)
    } else {
        path
    }
}

struct Mapping {
    raw: String,
    pattern: EndpointPattern,
    policy: String,
}

/// Named policies, the group and endpoint tables, and a resolution cache.
pub struct PolicyRegistry {
    default: Policy,
    base: Option<PolicyLayer>,
    named: HashMap<String, PolicyLayer>,
    groups: Vec<Mapping>,
    endpoints: Vec<Mapping>,
    // (group pattern, endpoint pattern) -> effective policy
    resolved: RwLock<HashMap<(Option<usize>, Option<usize>), Arc<Policy>>>,
}

impl fmt::Debug for PolicyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let raw = |table: &[Mapping]| -> Vec<(String, String)> {
            table.iter().map(|m| (m.raw.clone(), m.policy.clone())).collect()
        };
        let mut names: Vec<&str> = self.named.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("PolicyRegistry")
            .field("default", &self.default)
            .field("has_base", &self.base.is_some())
            .field("policies", &names)
            .field("groups", &raw(&self.groups))
            .field("endpoints", &raw(&self.endpoints))
            .finish_non_exhaustive()
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::new(super::policy::DEFAULT_EXPIRATION)
    }
}

impl PolicyRegistry {
    /// Creates an empty registry whose default policy expires after `default_expiration`.
    pub fn new(default_expiration: Duration) -> Self {
        Self {
            default: Policy::with_expiration(default_expiration),
            base: None,
            named: HashMap::new(),
            groups: Vec::new(),
            endpoints: Vec::new(),
            resolved: RwLock::new(HashMap::new()),
        }
    }

    /// Sets the layer applied to every request. With a base policy registered,
    /// paths without any group or endpoint mapping are cached too.
    pub fn add_base_policy(&mut self, layer: PolicyLayer) -> &mut Self {
        self.base = Some(layer);
        self.invalidate();
        self
    }

    /// Registers (or replaces) a named policy.
    pub fn add_policy(&mut self, name: impl Into<String>, layer: PolicyLayer) -> &mut Self {
        self.named.insert(name.into(), layer);
        self.invalidate();
        self
    }

    /// Makes `policy` the base policy of every endpoint under `pattern`.
    ///
    /// # Errors
    ///
    /// [`CacheError::UnknownPolicy`] if `policy` has not been registered.
    pub fn map_group(&mut self, pattern: &str, policy: &str) -> Result<&mut Self, CacheError> {
        let mapping = self.mapping(pattern, policy)?;
        self.groups.push(mapping);
        self.invalidate();
        Ok(self)
    }

    /// Selects `policy` for the endpoint(s) matching `pattern`.
    ///
    /// # Errors
    ///
    /// [`CacheError::UnknownPolicy`] if `policy` has not been registered.
    pub fn map_endpoint(&mut self, pattern: &str, policy: &str) -> Result<&mut Self, CacheError> {
        let mapping = self.mapping(pattern, policy)?;
        self.endpoints.push(mapping);
        self.invalidate();
        Ok(self)
    }

    fn mapping(&self, pattern: &str, policy: &str) -> Result<Mapping, CacheError> {
        if !self.named.contains_key(policy) {
            return Err(CacheError::UnknownPolicy(policy.to_owned()));
        }
        Ok(Mapping {
            raw: pattern.to_owned(),
            pattern: EndpointPattern::parse(pattern),
            policy: policy.to_owned(),
        })
    }

    fn invalidate(&mut self) {
        rw_write(&self.resolved, SOURCE, "invalidate").clear();
    }

    /// Resolves the effective policy for `path`.
    ///
    /// Returns `None` when no base, group or endpoint policy applies; such
    /// requests bypass the cache entirely.
    pub fn resolve(&self, path: &str) -> Option<Arc<Policy>> {
        let group = self.groups.iter().position(|m| m.pattern.matches(path));
        let endpoint = self.endpoints.iter().position(|m| m.pattern.matches(path));

        if self.base.is_none() && group.is_none() && endpoint.is_none() {
            return None;
        }

        if let Some(policy) = rw_read(&self.resolved, SOURCE, "resolve").get(&(group, endpoint)) {
            return Some(Arc::clone(policy));
        }

        let mut policy = self.default.clone();
        if let Some(base) = &self.base {
            policy = policy.merge(base);
        }
        for mapping in [group.map(|i| &self.groups[i]), endpoint.map(|i| &self.endpoints[i])]
            .into_iter()
            .flatten()
        {
            if let Some(layer) = self.named.get(&mapping.policy) {
                policy = policy.merge(layer);
            }
        }

        debug!(
            path,
            group = group.map(|i| self.groups[i].raw.as_str()),
            endpoint = endpoint.map(|i| self.endpoints[i].raw.as_str()),
            "resolved output cache policy"
        );

        let policy = Arc::new(policy);
        rw_write(&self.resolved, SOURCE, "resolve.insert")
            .entry((group, endpoint))
            .or_insert_with(|| Arc::clone(&policy));
        Some(policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── EndpointPattern ───────────────────────────────────────────────────────

    #[test]
    fn exact_pattern() {
        let p = EndpointPattern::parse("/about/");
        assert_eq!(p, EndpointPattern::Exact("/about".into()));
        assert!(p.matches("/about"));
        assert!(p.matches("/about/"));
        assert!(!p.matches("/about/team"));
    }

    #[test]
    fn root_pattern() {
        let p = EndpointPattern::parse("/");
        assert!(p.matches("/"));
        assert!(!p.matches("/other"));
    }

    #[test]
    fn parameterized_pattern() {
        let p = EndpointPattern::parse("/posts/:slug");
        assert!(p.matches("/posts/hello"));
        assert!(!p.matches("/posts"));
        assert!(!p.matches("/posts/hello/comments"));
        assert!(!p.matches("/pages/hello"));
    }

    #[test]
    fn prefix_pattern_respects_segment_boundaries() {
        let p = EndpointPattern::parse("/blog/*");
        assert!(p.matches("/blog"));
        assert!(p.matches("/blog/2024/post"));
        assert!(!p.matches("/blogroll"));
    }

    #[test]
    fn root_wildcard_matches_everything() {
        let p = EndpointPattern::parse("/*");
        assert!(p.matches("/"));
        assert!(p.matches("/anything/at/all"));
    }

    // ── PolicyRegistry ────────────────────────────────────────────────────────

    fn registry() -> PolicyRegistry {
        let mut r = PolicyRegistry::default();
        r.add_policy("blog", PolicyLayer::new().tag("tag-blog").expire(Duration::from_secs(30)));
        r.add_policy("short", PolicyLayer::new().expire(Duration::from_secs(5)));
        r.add_policy("off", PolicyLayer::new().no_cache());
        r.map_group("/blog/*", "blog").unwrap();
        r.map_endpoint("/blog/live", "short").unwrap();
        r.map_endpoint("/admin/*", "off").unwrap();
        r
    }

    #[test]
    fn unmapped_path_bypasses_without_base() {
        assert!(registry().resolve("/elsewhere").is_none());
    }

    #[test]
    fn base_policy_covers_unmapped_paths() {
        let mut r = registry();
        r.add_base_policy(PolicyLayer::new().tag("all"));
        let policy = r.resolve("/elsewhere").unwrap();
        assert!(policy.tags().contains("all"));
        assert_eq!(policy.expiration(), Duration::from_secs(60));
    }

    #[test]
    fn group_policy_applies_to_members() {
        let policy = registry().resolve("/blog/hello").unwrap();
        assert!(policy.tags().contains("tag-blog"));
        assert_eq!(policy.expiration(), Duration::from_secs(30));
    }

    #[test]
    fn endpoint_overrides_group_field_by_field() {
        let policy = registry().resolve("/blog/live").unwrap();
        assert_eq!(policy.expiration(), Duration::from_secs(5));
        // Tags still come from the group.
        assert!(policy.tags().contains("tag-blog"));
    }

    #[test]
    fn no_cache_endpoint_resolves_disabled() {
        let policy = registry().resolve("/admin/users").unwrap();
        assert!(!policy.is_enabled());
    }

    #[test]
    fn resolution_is_cached_and_deterministic() {
        let r = registry();
        let a = r.resolve("/blog/a").unwrap();
        let b = r.resolve("/blog/b").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn registration_invalidates_cached_resolutions() {
        let mut r = registry();
        let before = r.resolve("/blog/a").unwrap();
        r.add_policy("blog", PolicyLayer::new().expire(Duration::from_secs(1)));
        let after = r.resolve("/blog/a").unwrap();
        assert_eq!(before.expiration(), Duration::from_secs(30));
        assert_eq!(after.expiration(), Duration::from_secs(1));
    }

    #[test]
    fn unknown_policy_names_are_rejected() {
        let mut r = PolicyRegistry::default();
        assert!(matches!(
            r.map_endpoint("/", "nope"),
            Err(CacheError::UnknownPolicy(name)) if name == "nope"
        ));
    }

    #[test]
    fn debug_lists_names_and_mappings() {
        let text = format!("{:?}", registry());
        assert!(text.contains("\"blog\""));
        assert!(text.contains("(\"/blog/live\", \"short\")"));
        // Failed mappings surface the registry through `unwrap_err`.
        let mut r = PolicyRegistry::default();
        assert_eq!(
            r.map_group("/x/*", "missing").unwrap_err(),
            CacheError::UnknownPolicy("missing".into())
        );
    }
}
