//! Output cache configuration.
//!
//! [`OutputCacheOptions`] holds the engine-wide knobs. [`OutputCacheSettings`]
//! is the full JSON document: options plus the policy tables that
//! [`OutputCacheSettings::to_registry`] turns into a [`PolicyRegistry`].
//!
//! ```json
//! {
//!   "options": { "default_expiration_secs": 60, "size_limit": 104857600 },
//!   "base": { "vary_by_headers": ["accept-language"] },
//!   "policies": {
//!     "blog": { "expire_secs": 10, "tags": ["tag-blog"], "vary_by_query": ["culture"] },
//!     "nolock": { "locking": false }
//!   },
//!   "groups": [ { "pattern": "/blog/*", "policy": "blog" } ],
//!   "endpoints": [ { "pattern": "/blog/live", "policy": "nolock" } ]
//! }
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

use crate::http::{Method, StatusCode};

use super::error::CacheError;
use super::policy::PolicyLayer;
use super::registry::PolicyRegistry;

// Default values for output cache options
const DEFAULT_SIZE_LIMIT: usize = 100 * 1024 * 1024;
const DEFAULT_MAXIMUM_BODY_SIZE: usize = 64 * 1024 * 1024;
const DEFAULT_EXPIRATION_SECS: u64 = 60;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 30;

/// Engine-wide output cache options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputCacheOptions {
    /// Total bytes (bodies + headers) the memory store keeps before evicting
    /// least-recently-used entries.
    pub size_limit: usize,
    /// Responses with a larger body are never stored.
    pub maximum_body_size: usize,
    /// Freshness lifetime of the default policy, in seconds.
    pub default_expiration_secs: u64,
    /// When false, paths are lower-cased before they enter the key.
    pub use_case_sensitive_paths: bool,
    /// Period of the background expiration sweep, in seconds. `0` disables it.
    pub sweep_interval_secs: u64,
}

impl Default for OutputCacheOptions {
    fn default() -> Self {
        Self {
            size_limit: DEFAULT_SIZE_LIMIT,
            maximum_body_size: DEFAULT_MAXIMUM_BODY_SIZE,
            default_expiration_secs: DEFAULT_EXPIRATION_SECS,
            use_case_sensitive_paths: false,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
        }
    }
}

impl OutputCacheOptions {
    pub fn default_expiration(&self) -> Duration {
        Duration::from_secs(self.default_expiration_secs)
    }

    /// Returns `None` when the sweeper is disabled.
    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }
}

/// Serialized form of a [`PolicyLayer`]. Unset fields inherit from the base.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LayerSettings {
    pub expire_secs: Option<u64>,
    pub tags: Vec<String>,
    pub vary_by_query: Option<Vec<String>>,
    pub vary_by_headers: Option<Vec<String>>,
    pub locking: Option<bool>,
    pub no_cache: bool,
    pub allow_set_cookie: bool,
    pub allow_authenticated: bool,
    pub key_prefix: Option<String>,
    pub methods: Option<Vec<String>>,
    pub statuses: Option<Vec<u16>>,
}

impl LayerSettings {
    /// Converts to a [`PolicyLayer`].
    ///
    /// # Errors
    ///
    /// [`CacheError::InvalidSettings`] for an unsupported status code.
    pub fn to_layer(&self) -> Result<PolicyLayer, CacheError> {
        let mut layer = PolicyLayer::new();

        if let Some(secs) = self.expire_secs {
            layer = layer.expire(Duration::from_secs(secs));
        }
        for tag in &self.tags {
            layer = layer.tag(tag.clone());
        }
        if let Some(names) = &self.vary_by_query {
            layer = layer.vary_by_query(names.iter().cloned());
        }
        if let Some(headers) = &self.vary_by_headers {
            // An explicit empty list clears inherited headers.
            layer = layer.vary_by_headers(headers.iter().cloned());
        }
        if let Some(locking) = self.locking {
            layer = layer.locking(locking);
        }
        if self.no_cache {
            layer = layer.no_cache();
        }
        if self.allow_set_cookie {
            layer = layer.allow_set_cookie();
        }
        if self.allow_authenticated {
            layer = layer.allow_authenticated();
        }
        if let Some(prefix) = &self.key_prefix {
            layer = layer.key_prefix(prefix.clone());
        }
        if let Some(methods) = &self.methods {
            layer = layer.methods(methods.iter().map(|m| {
                m.to_ascii_uppercase()
                    .parse::<Method>()
                    .unwrap_or_else(|never| match never {})
            }));
        }
        if let Some(codes) = &self.statuses {
            let statuses = codes
                .iter()
                .map(|&code| {
                    StatusCode::from_u16(code).ok_or_else(|| {
                        CacheError::InvalidSettings(format!("unsupported status code {code}"))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            layer = layer.statuses(statuses);
        }

        Ok(layer)
    }
}

/// A `pattern → policy name` row of the group or endpoint table.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteSettings {
    pub pattern: String,
    pub policy: String,
}

/// The complete output cache configuration document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutputCacheSettings {
    pub options: OutputCacheOptions,
    /// Applied to every request before any group or endpoint policy.
    pub base: Option<LayerSettings>,
    pub policies: BTreeMap<String, LayerSettings>,
    pub groups: Vec<RouteSettings>,
    pub endpoints: Vec<RouteSettings>,
}

impl OutputCacheSettings {
    /// Parses a JSON settings document.
    ///
    /// # Errors
    ///
    /// [`CacheError::InvalidSettings`] on malformed JSON or unknown fields.
    pub fn from_json(json: &str) -> Result<Self, CacheError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Builds the policy registry these settings describe.
    ///
    /// # Errors
    ///
    /// [`CacheError::UnknownPolicy`] when a group or endpoint names a policy
    /// that is not defined; [`CacheError::InvalidSettings`] for bad policy fields.
    pub fn to_registry(&self) -> Result<PolicyRegistry, CacheError> {
        let mut registry = PolicyRegistry::new(self.options.default_expiration());

        if let Some(base) = &self.base {
            registry.add_base_policy(base.to_layer()?);
        }
        for (name, layer) in &self.policies {
            registry.add_policy(name.clone(), layer.to_layer()?);
        }
        for group in &self.groups {
            registry.map_group(&group.pattern, &group.policy)?;
        }
        for endpoint in &self.endpoints {
            registry.map_endpoint(&endpoint.pattern, &endpoint.policy)?;
        }

        Ok(registry)
    }
}
