//! # rttp-cache
//!
//! Output caching for the rttp async HTTP/1.1 framework: named policies with
//! field-level merge, configurable cache keys, tag eviction, conditional
//! revalidation (`ETag` / `Last-Modified`) and single-flight population.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use rttp_cache::cache::{OutputCache, OutputCacheOptions, PolicyLayer, PolicyRegistry};
//! use rttp_cache::middleware::{LoggerMiddleware, Pipeline};
//! use rttp_cache::{Response, Server, StatusCode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut registry = PolicyRegistry::default();
//!     registry.add_base_policy(PolicyLayer::new().expire(Duration::from_secs(10)));
//!     let cache = OutputCache::new(registry, OutputCacheOptions::default());
//!     let _sweeper = cache.start_sweeper();
//!
//!     let pipeline = Pipeline::new()
//!         .layer(LoggerMiddleware)
//!         .layer(cache.middleware())
//!         .endpoint(|_ctx| async { Response::new(StatusCode::Ok).body("Hello, World!") });
//!
//!     let server = Server::bind("127.0.0.1:8080").await?;
//!     server
//!         .run(move |req| {
//!             let pipeline = pipeline.clone();
//!             async move { pipeline.handle(req).await }
//!         })
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod context;
pub mod http;
pub mod middleware;
pub mod server;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use cache::{CacheError, OutputCache, OutputCacheOptions, PolicyLayer, PolicyRegistry};
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use server::{Server, ServerError};
