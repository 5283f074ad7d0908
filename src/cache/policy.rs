//! Output cache policies and the cacheability predicates.
//!
//! A [`Policy`] is always complete. Configuration is expressed as
//! [`PolicyLayer`]s, partial descriptions merged over a base with
//! [`merge`]: scalar fields set in the layer replace the base value, while
//! tags, value providers and custom predicates accumulate.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::http::{Method, Response, StatusCode};

use super::key::{CacheRequest, ValueProvider};

/// Freshness lifetime used when nothing else is configured.
pub const DEFAULT_EXPIRATION: Duration = Duration::from_secs(60);

/// Which query parameters participate in the cache key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum VaryByQuery {
    /// The whole query string (order-independent).
    #[default]
    All,
    /// Only the listed names; `"*"` selects all of them.
    Names(Vec<String>),
}

type RequestPredicate = Arc<dyn Fn(&CacheRequest) -> bool + Send + Sync>;
type ResponsePredicate = Arc<dyn Fn(&CacheRequest, &Response) -> bool + Send + Sync>;

/// An effective, fully resolved output cache policy.
#[derive(Clone)]
pub struct Policy {
    pub(crate) enabled: bool,
    pub(crate) methods: Vec<Method>,
    pub(crate) statuses: Vec<StatusCode>,
    pub(crate) reject_set_cookie: bool,
    pub(crate) reject_authenticated: bool,
    pub(crate) expiration: Duration,
    pub(crate) vary_by_query: VaryByQuery,
    pub(crate) vary_by_headers: Vec<String>,
    pub(crate) vary_by_values: Vec<ValueProvider>,
    pub(crate) locking: bool,
    pub(crate) tags: BTreeSet<String>,
    pub(crate) key_prefix: Option<String>,
    request_predicates: Vec<RequestPredicate>,
    response_predicates: Vec<ResponsePredicate>,
}

impl Default for Policy {
    /// GET/HEAD only, `200` only, no `Set-Cookie`, anonymous only, 60 s,
    /// whole query string, no headers, locking on, no tags.
    fn default() -> Self {
        Self {
            enabled: true,
            methods: vec![Method::Get, Method::Head],
            statuses: vec![StatusCode::Ok],
            reject_set_cookie: true,
            reject_authenticated: true,
            expiration: DEFAULT_EXPIRATION,
            vary_by_query: VaryByQuery::All,
            vary_by_headers: Vec::new(),
            vary_by_values: Vec::new(),
            locking: true,
            tags: BTreeSet::new(),
            key_prefix: None,
            request_predicates: Vec::new(),
            response_predicates: Vec::new(),
        }
    }
}

impl Policy {
    /// The default policy with a different freshness lifetime.
    pub fn with_expiration(expiration: Duration) -> Self {
        Self {
            expiration,
            ..Self::default()
        }
    }

    /// Returns `self` with `layer` applied. See [`merge`].
    #[must_use]
    pub fn merge(&self, layer: &PolicyLayer) -> Policy {
        merge(self, layer)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn expiration(&self) -> Duration {
        self.expiration
    }

    pub fn locking(&self) -> bool {
        self.locking
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }
}

impl fmt::Debug for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Policy")
            .field("enabled", &self.enabled)
            .field("methods", &self.methods)
            .field("statuses", &self.statuses)
            .field("reject_set_cookie", &self.reject_set_cookie)
            .field("reject_authenticated", &self.reject_authenticated)
            .field("expiration", &self.expiration)
            .field("vary_by_query", &self.vary_by_query)
            .field("vary_by_headers", &self.vary_by_headers)
            .field("vary_by_values", &self.vary_by_values)
            .field("locking", &self.locking)
            .field("tags", &self.tags)
            .field("key_prefix", &self.key_prefix)
            .field("request_predicates", &self.request_predicates.len())
            .field("response_predicates", &self.response_predicates.len())
            .finish()
    }
}

/// A partial policy, applied over a base with [`merge`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use rttp_cache::cache::{Policy, PolicyLayer};
///
/// let blog = PolicyLayer::new().tag("tag-blog").vary_by_query(["culture"]);
/// let post = PolicyLayer::new().expire(Duration::from_secs(10));
///
/// let effective = Policy::default().merge(&blog).merge(&post);
/// assert_eq!(effective.expiration(), Duration::from_secs(10));
/// assert!(effective.tags().contains("tag-blog"));
/// ```
#[derive(Clone, Default)]
pub struct PolicyLayer {
    enabled: Option<bool>,
    methods: Option<Vec<Method>>,
    statuses: Option<Vec<StatusCode>>,
    reject_set_cookie: Option<bool>,
    reject_authenticated: Option<bool>,
    expiration: Option<Duration>,
    vary_by_query: Option<VaryByQuery>,
    vary_by_headers: Option<Vec<String>>,
    vary_by_values: Vec<ValueProvider>,
    locking: Option<bool>,
    tags: Vec<String>,
    key_prefix: Option<String>,
    request_predicates: Vec<RequestPredicate>,
    response_predicates: Vec<ResponsePredicate>,
}

impl PolicyLayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the freshness lifetime.
    #[must_use]
    pub fn expire(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }

    /// Adds a tag for group eviction.
    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Varies the key by the listed query parameters only.
    #[must_use]
    pub fn vary_by_query<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.vary_by_query = Some(VaryByQuery::Names(names.into_iter().map(Into::into).collect()));
        self
    }

    /// Varies the key by the whole query string.
    #[must_use]
    pub fn vary_by_all_query(mut self) -> Self {
        self.vary_by_query = Some(VaryByQuery::All);
        self
    }

    /// Adds a request header to vary the key by.
    #[must_use]
    pub fn vary_by_header(mut self, name: impl Into<String>) -> Self {
        self.vary_by_headers
            .get_or_insert_with(Vec::new)
            .push(name.into());
        self
    }

    /// Replaces the header list, dropping anything inherited from the base.
    #[must_use]
    pub fn vary_by_headers<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.vary_by_headers = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Adds a caller-supplied value to the key.
    #[must_use]
    pub fn vary_by_value(mut self, provider: ValueProvider) -> Self {
        self.vary_by_values.push(provider);
        self
    }

    /// Enables or disables single-flight population.
    #[must_use]
    pub fn locking(mut self, enabled: bool) -> Self {
        self.locking = Some(enabled);
        self
    }

    /// Disables output caching for whatever this layer applies to.
    #[must_use]
    pub fn no_cache(mut self) -> Self {
        self.enabled = Some(false);
        self
    }

    /// Re-enables output caching over a `no_cache` base.
    #[must_use]
    pub fn cache(mut self) -> Self {
        self.enabled = Some(true);
        self
    }

    /// Removes the `Set-Cookie` check.
    #[must_use]
    pub fn allow_set_cookie(mut self) -> Self {
        self.reject_set_cookie = Some(false);
        self
    }

    /// Removes the authentication check.
    #[must_use]
    pub fn allow_authenticated(mut self) -> Self {
        self.reject_authenticated = Some(false);
        self
    }

    /// Replaces the set of cacheable methods.
    #[must_use]
    pub fn methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.methods = Some(methods.into_iter().collect());
        self
    }

    /// Replaces the set of storable status codes.
    #[must_use]
    pub fn statuses(mut self, statuses: impl IntoIterator<Item = StatusCode>) -> Self {
        self.statuses = Some(statuses.into_iter().collect());
        self
    }

    /// Namespaces keys produced under this policy.
    #[must_use]
    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    /// Adds a custom request predicate; all must hold to serve or store.
    #[must_use]
    pub fn when_request<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CacheRequest) -> bool + Send + Sync + 'static,
    {
        self.request_predicates.push(Arc::new(predicate));
        self
    }

    /// Adds a custom response predicate; all must hold to store.
    #[must_use]
    pub fn when_response<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CacheRequest, &Response) -> bool + Send + Sync + 'static,
    {
        self.response_predicates.push(Arc::new(predicate));
        self
    }
}

/// Applies `layer` over `base`, field by field.
pub fn merge(base: &Policy, layer: &PolicyLayer) -> Policy {
    let mut tags = base.tags.clone();
    tags.extend(layer.tags.iter().cloned());

    let mut vary_by_values = base.vary_by_values.clone();
    vary_by_values.extend(layer.vary_by_values.iter().cloned());

    let mut request_predicates = base.request_predicates.clone();
    request_predicates.extend(layer.request_predicates.iter().cloned());

    let mut response_predicates = base.response_predicates.clone();
    response_predicates.extend(layer.response_predicates.iter().cloned());

    Policy {
        enabled: layer.enabled.unwrap_or(base.enabled),
        methods: layer.methods.clone().unwrap_or_else(|| base.methods.clone()),
        statuses: layer.statuses.clone().unwrap_or_else(|| base.statuses.clone()),
        reject_set_cookie: layer.reject_set_cookie.unwrap_or(base.reject_set_cookie),
        reject_authenticated: layer.reject_authenticated.unwrap_or(base.reject_authenticated),
        expiration: layer.expiration.unwrap_or(base.expiration),
        vary_by_query: layer
            .vary_by_query
            .clone()
            .unwrap_or_else(|| base.vary_by_query.clone()),
        vary_by_headers: layer
            .vary_by_headers
            .clone()
            .unwrap_or_else(|| base.vary_by_headers.clone()),
        vary_by_values,
        locking: layer.locking.unwrap_or(base.locking),
        tags,
        key_prefix: layer.key_prefix.clone().or_else(|| base.key_prefix.clone()),
        request_predicates,
        response_predicates,
    }
}

/// The first predicate that rejected a request or response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Disabled,
    Method,
    Status,
    SetCookie,
    Authenticated,
    RequestPredicate,
    ResponsePredicate,
}

impl Rejection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Method => "method",
            Self::Status => "status",
            Self::SetCookie => "set_cookie",
            Self::Authenticated => "authenticated",
            Self::RequestPredicate => "request_predicate",
            Self::ResponsePredicate => "response_predicate",
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Checks, in order, whether a request may be answered from the cache:
/// enabled, method, authentication, custom request predicates.
pub fn serve_rejection(request: &CacheRequest, policy: &Policy) -> Option<Rejection> {
    if !policy.enabled {
        return Some(Rejection::Disabled);
    }
    if !policy.methods.contains(request.method()) {
        return Some(Rejection::Method);
    }
    if policy.reject_authenticated && request.is_authenticated() {
        return Some(Rejection::Authenticated);
    }
    if !policy.request_predicates.iter().all(|p| p(request)) {
        return Some(Rejection::RequestPredicate);
    }
    None
}

/// Checks, in order, whether a response may be stored:
/// enabled, method, status, `Set-Cookie`, authentication, custom request
/// predicates, custom response predicates.
pub fn store_rejection(
    request: &CacheRequest,
    response: &Response,
    policy: &Policy,
) -> Option<Rejection> {
    if !policy.enabled {
        return Some(Rejection::Disabled);
    }
    if !policy.methods.contains(request.method()) {
        return Some(Rejection::Method);
    }
    if !policy.statuses.contains(&response.status()) {
        return Some(Rejection::Status);
    }
    if policy.reject_set_cookie && response.headers().contains("set-cookie") {
        return Some(Rejection::SetCookie);
    }
    if policy.reject_authenticated && request.is_authenticated() {
        return Some(Rejection::Authenticated);
    }
    if !policy.request_predicates.iter().all(|p| p(request)) {
        return Some(Rejection::RequestPredicate);
    }
    if !policy.response_predicates.iter().all(|p| p(request, response)) {
        return Some(Rejection::ResponsePredicate);
    }
    None
}

pub fn should_serve_from_cache(request: &CacheRequest, policy: &Policy) -> bool {
    serve_rejection(request, policy).is_none()
}

pub fn should_store_response(request: &CacheRequest, response: &Response, policy: &Policy) -> bool {
    store_rejection(request, response, policy).is_none()
}
