//! Output caching: policy-driven response caching with tag eviction,
//! conditional revalidation and single-flight population.
//!
//! ## Request flow
//!
//! 1. [`PolicyRegistry::resolve`] picks the effective [`Policy`] for the path.
//! 2. [`should_serve_from_cache`] checks method, authentication and custom
//!    request predicates.
//! 3. [`KeyBuilder::build`] derives the [`CacheKey`]; its [`KeyId`] indexes the store.
//! 4. The [`EntryStore`] lookup is classified by [`revalidation::evaluate`]:
//!    fresh hit, `304 Not Modified`, or miss.
//! 5. On a miss the downstream handler runs (once per key when locking is
//!    enabled, via [`SingleFlight`]) and [`should_store_response`] decides
//!    whether the result becomes a [`CacheEntry`].
//!
//! ## Modules
//!
//! - [`key`]: request snapshot, key composition and fingerprinting.
//! - [`policy`]: policies, layers, merge and the cacheability predicates.
//! - [`registry`]: named policies and path-pattern resolution.
//! - [`settings`]: engine options and the JSON settings document.
//! - [`entry`] / [`store`]: stored responses, the store trait and the memory store.
//! - [`revalidation`]: freshness and conditional requests.
//! - [`flight`]: per-key single-flight coordination.
//! - [`middleware`]: the engine facade and pipeline middleware.

pub mod entry;
pub mod error;
pub mod flight;
pub mod key;
mod lock;
pub mod middleware;
pub mod policy;
pub mod registry;
pub mod revalidation;
pub mod settings;
pub mod store;

pub use entry::CacheEntry;
pub use error::CacheError;
pub use flight::SingleFlight;
pub use key::{CacheKey, CacheRequest, KeyBuilder, KeyId, ValueProvider};
pub use middleware::{OutputCache, OutputCacheMiddleware};
pub use policy::{
    Policy, PolicyLayer, Rejection, VaryByQuery, merge, should_serve_from_cache,
    should_store_response,
};
pub use registry::{EndpointPattern, PolicyRegistry};
pub use revalidation::Revalidation;
pub use settings::{OutputCacheOptions, OutputCacheSettings};
pub use store::{EntryStore, MemoryStore, spawn_sweeper};
