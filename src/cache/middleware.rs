//! Output cache middleware.
//!
//! [`OutputCache`] owns the policy registry, the store and the single-flight
//! coordinator. [`OutputCacheMiddleware`] is its request-pipeline face: it
//! resolves the policy for each request, answers hits and conditional
//! requests from the store, and populates the store on misses.
//!
//! Every cache-side failure (a vary-by provider error, an unreachable store, a
//! malformed conditional header) degrades to running the request uncached.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::context::Context;
use crate::http::{Response, StatusCode};
use crate::middleware::{Middleware, Next};

use super::entry::CacheEntry;
use super::error::CacheError;
use super::flight::SingleFlight;
use super::key::{CacheRequest, KeyBuilder, KeyId};
use super::policy::{Policy, serve_rejection, store_rejection};
use super::registry::PolicyRegistry;
use super::revalidation::{Revalidation, evaluate, full_response, not_modified_response};
use super::settings::{OutputCacheOptions, OutputCacheSettings};
use super::store::{EntryStore, MemoryStore, spawn_sweeper};

const HANDLER_PANICKED: &str = "handler panicked";

/// Result shared with requests that waited on a leader: the stored entry, or
/// `None` when the leader's response was not cacheable.
type Flight = Option<Arc<CacheEntry>>;

/// The output cache engine.
///
/// Cheap to clone; clones share the same store and registry.
///
/// # Examples
///
/// ```rust,no_run
/// use std::time::Duration;
/// use rttp_cache::cache::{OutputCache, OutputCacheOptions, PolicyLayer, PolicyRegistry};
/// use rttp_cache::middleware::Pipeline;
/// use rttp_cache::{Response, StatusCode};
///
/// let mut registry = PolicyRegistry::default();
/// registry.add_policy("blog", PolicyLayer::new().tag("tag-blog").expire(Duration::from_secs(30)));
/// registry.map_group("/blog/*", "blog").unwrap();
///
/// let cache = OutputCache::new(registry, OutputCacheOptions::default());
/// let pipeline = Pipeline::new()
///     .layer(cache.middleware())
///     .endpoint(|_ctx| async { Response::new(StatusCode::Ok).body("post") });
/// ```
#[derive(Clone)]
pub struct OutputCache {
    registry: Arc<PolicyRegistry>,
    store: Arc<dyn EntryStore>,
    options: Arc<OutputCacheOptions>,
    flights: Arc<SingleFlight<Flight>>,
}

impl OutputCache {
    /// Creates an engine backed by a [`MemoryStore`] sized by `options`.
    pub fn new(registry: PolicyRegistry, options: OutputCacheOptions) -> Self {
        let store = Arc::new(MemoryStore::new(options.size_limit));
        Self::with_store(registry, options, store)
    }

    /// Creates an engine over a caller-supplied store.
    pub fn with_store(
        registry: PolicyRegistry,
        options: OutputCacheOptions,
        store: Arc<dyn EntryStore>,
    ) -> Self {
        Self {
            registry: Arc::new(registry),
            store,
            options: Arc::new(options),
            flights: Arc::new(SingleFlight::new()),
        }
    }

    /// Builds an engine from a settings document.
    ///
    /// # Errors
    ///
    /// See [`OutputCacheSettings::to_registry`].
    pub fn from_settings(settings: &OutputCacheSettings) -> Result<Self, CacheError> {
        let registry = settings.to_registry()?;
        Ok(Self::new(registry, settings.options.clone()))
    }

    /// Parses `json` and builds an engine from it.
    ///
    /// # Errors
    ///
    /// [`CacheError::InvalidSettings`] or [`CacheError::UnknownPolicy`].
    pub fn from_json(json: &str) -> Result<Self, CacheError> {
        Self::from_settings(&OutputCacheSettings::from_json(json)?)
    }

    pub fn store(&self) -> &Arc<dyn EntryStore> {
        &self.store
    }

    pub fn registry(&self) -> &PolicyRegistry {
        &self.registry
    }

    pub fn options(&self) -> &OutputCacheOptions {
        &self.options
    }

    /// Removes every entry tagged `tag`. Returns the number evicted.
    ///
    /// # Errors
    ///
    /// [`CacheError::StoreUnavailable`] if the store cannot be reached.
    pub async fn evict_by_tag(&self, tag: &str) -> Result<usize, CacheError> {
        let evicted = self.store.evict_by_tag(tag).await?;
        info!(cache = "output", tag, evicted, "evicted tagged entries");
        Ok(evicted)
    }

    /// The middleware to place in a request pipeline.
    pub fn middleware(&self) -> OutputCacheMiddleware {
        OutputCacheMiddleware {
            cache: self.clone(),
        }
    }

    /// Starts the periodic expiration sweep, unless it is disabled in the options.
    pub fn start_sweeper(&self) -> Option<JoinHandle<()>> {
        self.options
            .sweep_interval()
            .map(|period| spawn_sweeper(Arc::clone(&self.store), period))
    }

    async fn store_response(
        &self,
        request: &CacheRequest,
        policy: &Policy,
        key: KeyId,
        response: &Response,
    ) -> Option<Arc<CacheEntry>> {
        if let Some(rejection) = store_rejection(request, response, policy) {
            debug!(cache = "output", outcome = "not_stored", reason = %rejection);
            return None;
        }
        let body_len = response.payload().len();
        if body_len > self.options.maximum_body_size {
            debug!(
                cache = "output",
                outcome = "not_stored",
                reason = "body_size",
                body_len,
                "response body exceeds maximum_body_size"
            );
            return None;
        }

        let entry = Arc::new(CacheEntry::from_response(
            key,
            response,
            policy.expiration(),
            policy.tags().clone(),
        ));
        match self.store.put(Arc::clone(&entry)).await {
            Ok(()) => debug!(cache = "output", outcome = "stored", key = %key),
            Err(e) => warn!(cache = "output", key = %key, error = %e, "failed to store entry"),
        }
        // Waiters can be answered from the entry even if the store rejected it.
        Some(entry)
    }

    // Runs the miss under the single-flight coordinator. The leader keeps its
    // own response; waiters are answered from the shared entry.
    async fn populate(
        &self,
        ctx: Context,
        next: Next,
        request: &CacheRequest,
        policy: &Policy,
        key: KeyId,
    ) -> Response {
        let mut downstream = Some((ctx, next));
        let mut produced: Option<Response> = None;
        let mut panicked: Option<Box<dyn Any + Send>> = None;

        let result = {
            let downstream = &mut downstream;
            let produced = &mut produced;
            let panicked = &mut panicked;
            self.flights
                .execute(key, move || async move {
                    let Some((ctx, next)) = downstream.take() else {
                        return Err(CacheError::Downstream("downstream already consumed".into()));
                    };
                    match AssertUnwindSafe(next.run(ctx)).catch_unwind().await {
                        Ok(response) => {
                            let entry = self.store_response(request, policy, key, &response).await;
                            *produced = Some(response);
                            Ok(entry)
                        }
                        Err(payload) => {
                            *panicked = Some(payload);
                            Err(CacheError::Downstream(HANDLER_PANICKED.into()))
                        }
                    }
                })
                .await
        };

        if let Some(payload) = panicked {
            std::panic::resume_unwind(payload);
        }
        if let Some(response) = produced {
            return response;
        }

        match result {
            Ok(Some(entry)) => {
                debug!(cache = "output", outcome = "coalesced", key = %key);
                match evaluate(Some(Arc::clone(&entry)), request.headers(), Instant::now()) {
                    Revalidation::NotModified(_) => not_modified_response(&entry),
                    _ => full_response(&entry),
                }
            }
            Ok(None) => {
                debug!(cache = "output", outcome = "coalesced_uncacheable", key = %key);
                run_downstream(downstream).await
            }
            Err(CacheError::Downstream(reason)) if reason == HANDLER_PANICKED => {
                warn!(cache = "output", key = %key, "single-flight leader panicked");
                Response::new(StatusCode::InternalServerError)
            }
            Err(e) => {
                warn!(cache = "output", key = %key, error = %e, "single-flight wait failed; running uncached");
                run_downstream(downstream).await
            }
        }
    }
}

async fn run_downstream(downstream: Option<(Context, Next)>) -> Response {
    match downstream {
        Some((ctx, next)) => next.run(ctx).await,
        None => Response::new(StatusCode::InternalServerError),
    }
}

/// Request-pipeline adapter for an [`OutputCache`].
#[derive(Clone)]
pub struct OutputCacheMiddleware {
    cache: OutputCache,
}

impl Middleware for OutputCacheMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        let cache = self.cache.clone();
        Box::pin(output_cache_layer(cache, ctx, next))
    }
}

#[instrument(
    skip_all,
    fields(method = %ctx.request().method(), path = %ctx.request().path())
)]
async fn output_cache_layer(cache: OutputCache, ctx: Context, next: Next) -> Response {
    let request = CacheRequest::from_context(&ctx);

    let Some(policy) = cache.registry.resolve(request.path()) else {
        return next.run(ctx).await;
    };
    if let Some(rejection) = serve_rejection(&request, &policy) {
        debug!(cache = "output", outcome = "bypass", reason = %rejection);
        return next.run(ctx).await;
    }

    let key = match KeyBuilder::build(&request, &policy, &cache.options) {
        Ok(key) => key.id(),
        Err(e) => {
            warn!(cache = "output", outcome = "bypass", error = %e, "cache key derivation failed");
            return next.run(ctx).await;
        }
    };

    let stored = match cache.store.get(key).await {
        Ok(stored) => stored,
        Err(e) => {
            warn!(cache = "output", key = %key, error = %e, "store lookup failed; treating as miss");
            None
        }
    };

    match evaluate(stored, request.headers(), Instant::now()) {
        Revalidation::FreshHit(entry) => {
            debug!(cache = "output", outcome = "hit", key = %key);
            return full_response(&entry);
        }
        Revalidation::NotModified(entry) => {
            debug!(cache = "output", outcome = "not_modified", key = %key);
            return not_modified_response(&entry);
        }
        miss => debug!(cache = "output", outcome = miss.as_str(), key = %key),
    }

    if !policy.locking() {
        let response = next.run(ctx).await;
        cache.store_response(&request, &policy, key, &response).await;
        return response;
    }

    cache.populate(ctx, next, &request, &policy, key).await
}
