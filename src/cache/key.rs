//! Cache key derivation.
//!
//! A [`CacheKey`] is the full composite (method, scheme, host, port, path and
//! whatever the policy varies by); [`KeyId`] is its fixed-width fingerprint,
//! used to index the store and the tag index.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::context::Context;
use crate::http::{Headers, Method, Request};

use super::error::CacheError;
use super::policy::{Policy, VaryByQuery};
use super::settings::OutputCacheOptions;

/// Snapshot of the request attributes the cache engine looks at.
///
/// Taken once, before the downstream handler consumes the [`Context`].
#[derive(Debug, Clone)]
pub struct CacheRequest {
    method: Method,
    scheme: String,
    host: String,
    port: u16,
    path: String,
    query: Vec<(String, String)>,
    headers: Headers,
    authenticated: bool,
}

impl CacheRequest {
    /// Captures the request held by `ctx`, including its authentication status.
    pub fn from_context(ctx: &Context) -> Self {
        Self::from_request(ctx.request(), ctx.is_authenticated())
    }

    /// Captures `request` with an explicit authentication status.
    pub fn from_request(request: &Request, authenticated: bool) -> Self {
        Self {
            method: request.method().clone(),
            scheme: request.scheme().to_ascii_lowercase(),
            host: request.host().to_ascii_lowercase(),
            port: request.port(),
            path: request.path().to_owned(),
            query: request
                .query_pairs()
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
                .collect(),
            headers: request.headers().clone(),
            authenticated,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// All values of a query parameter in request order, matched by exact name
    /// as [`Request::query_param`] does. `None` when the parameter is absent.
    pub fn query_values(&self, name: &str) -> Option<Vec<String>> {
        let values: Vec<String> = self
            .query
            .iter()
            .filter(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
            .collect();
        (!values.is_empty()).then_some(values)
    }

    fn all_query(&self) -> BTreeMap<String, Option<Vec<String>>> {
        let mut map = BTreeMap::new();
        for (name, _) in &self.query {
            if !map.contains_key(name) {
                let values = self.query_values(name);
                map.insert(name.clone(), values);
            }
        }
        map
    }
}

type ValueFn = dyn Fn(&CacheRequest) -> Result<String, String> + Send + Sync;

/// A named, caller-supplied contribution to the cache key.
///
/// The function must return the same value for the same request at the same
/// instant; it may read ambient state such as the clock.
#[derive(Clone)]
pub struct ValueProvider {
    name: Arc<str>,
    func: Arc<ValueFn>,
}

impl ValueProvider {
    pub fn new<F>(name: impl Into<Arc<str>>, func: F) -> Self
    where
        F: Fn(&CacheRequest) -> Result<String, String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, request: &CacheRequest) -> Result<(String, String), CacheError> {
        (self.func)(request)
            .map(|value| (self.name.to_string(), value))
            .map_err(|reason| CacheError::KeyDerivation {
                provider: self.name.to_string(),
                reason,
            })
    }
}

impl fmt::Debug for ValueProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ValueProvider").field(&self.name).finish()
    }
}

/// The composite identity of a cacheable response.
///
/// Query and header components live in sorted maps, so parameter order never
/// matters. Query names keep their case; header names are lower-cased. Every
/// occurrence of a repeated parameter or header is kept as its own value. A
/// `None` records that the varied-by parameter or header was absent, which
/// keeps it distinct from an empty value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    prefix: Option<String>,
    method: String,
    scheme: String,
    host: String,
    port: u16,
    path: String,
    query: BTreeMap<String, Option<Vec<String>>>,
    headers: BTreeMap<String, Option<Vec<String>>>,
    values: Vec<(String, String)>,
}

impl CacheKey {
    /// Stable 128-bit fingerprint of the composite (truncated SHA-256).
    pub fn id(&self) -> KeyId {
        let mut hasher = Sha256::new();
        put_opt(&mut hasher, self.prefix.as_deref());
        put(&mut hasher, self.method.as_bytes());
        put(&mut hasher, self.scheme.as_bytes());
        put(&mut hasher, self.host.as_bytes());
        hasher.update(self.port.to_be_bytes());
        put(&mut hasher, self.path.as_bytes());
        for map in [&self.query, &self.headers] {
            hasher.update((map.len() as u64).to_be_bytes());
            for (name, value) in map {
                put(&mut hasher, name.as_bytes());
                put_list(&mut hasher, value.as_deref());
            }
        }
        hasher.update((self.values.len() as u64).to_be_bytes());
        for (name, value) in &self.values {
            put(&mut hasher, name.as_bytes());
            put(&mut hasher, value.as_bytes());
        }

        let digest = hasher.finalize();
        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        KeyId(id)
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

// Length-prefixing keeps ("ab", "c") and ("a", "bc") apart.
fn put(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

fn put_list(hasher: &mut Sha256, values: Option<&[String]>) {
    match values {
        Some(values) => {
            hasher.update([1u8]);
            hasher.update((values.len() as u64).to_be_bytes());
            for value in values {
                put(hasher, value.as_bytes());
            }
        }
        None => hasher.update([0u8]),
    }
}

fn put_opt(hasher: &mut Sha256, bytes: Option<&str>) {
    match bytes {
        Some(b) => {
            hasher.update([1u8]);
            put(hasher, b.as_bytes());
        }
        None => hasher.update([0u8]),
    }
}

/// Fixed-width cache key identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId([u8; 16]);

impl KeyId {
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({self})")
    }
}

/// Derives cache keys from requests under a policy.
pub struct KeyBuilder;

impl KeyBuilder {
    /// Builds the key for `request` under `policy`.
    ///
    /// Scheme, host, port and path are always included. Query parameters follow
    /// [`VaryByQuery`]; only the headers the policy lists are included.
    ///
    /// # Errors
    ///
    /// [`CacheError::KeyDerivation`] when a value provider fails. The caller
    /// must then neither serve from nor store into the cache.
    pub fn build(
        request: &CacheRequest,
        policy: &Policy,
        options: &OutputCacheOptions,
    ) -> Result<CacheKey, CacheError> {
        let path = if options.use_case_sensitive_paths {
            request.path.clone()
        } else {
            request.path.to_lowercase()
        };

        let query = match &policy.vary_by_query {
            VaryByQuery::All => request.all_query(),
            VaryByQuery::Names(names) if names.iter().any(|n| n == "*") => request.all_query(),
            VaryByQuery::Names(names) => names
                .iter()
                .map(|name| (name.clone(), request.query_values(name)))
                .collect(),
        };

        let headers = policy
            .vary_by_headers
            .iter()
            .map(|name| {
                let values: Vec<String> =
                    request.headers.get_all(name).map(str::to_owned).collect();
                (name.to_ascii_lowercase(), (!values.is_empty()).then_some(values))
            })
            .collect();

        let values = policy
            .vary_by_values
            .iter()
            .map(|provider| provider.evaluate(request))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(CacheKey {
            prefix: policy.key_prefix.clone(),
            method: request.method.as_str().to_owned(),
            scheme: request.scheme.clone(),
            host: request.host.clone(),
            port: request.port,
            path,
            query,
            headers,
            values,
        })
    }
}
