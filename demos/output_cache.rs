//! Output cache demo server.
//!
//! ```text
//! cargo run --example output_cache
//! curl -i localhost:8080/blog/hello            # miss, then hit
//! curl -i -H 'If-None-Match: "v1"' localhost:8080/blog/hello   # 304
//! curl -i -X POST localhost:8080/purge/tag-blog                 # evict
//! ```
//!
//! Set `OUTPUT_CACHE_SETTINGS` to a JSON settings file to override the
//! built-in policies.

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, SystemTime};

use rttp_cache::cache::{OutputCache, OutputCacheSettings};
use rttp_cache::context::Context;
use rttp_cache::middleware::{LoggerMiddleware, Middleware, Next, Pipeline};
use rttp_cache::{Method, Response, Server, StatusCode};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_SETTINGS: &str = r#"{
    "options": { "default_expiration_secs": 60, "sweep_interval_secs": 15 },
    "policies": {
        "blog": { "expire_secs": 30, "tags": ["tag-blog"], "vary_by_query": ["culture"] },
        "home": { "tags": ["tag-home"] },
        "live": { "expire_secs": 2, "locking": false }
    },
    "groups": [ { "pattern": "/blog/*", "policy": "blog" } ],
    "endpoints": [
        { "pattern": "/", "policy": "home" },
        { "pattern": "/blog/live", "policy": "live" }
    ]
}"#;

/// Answers `POST /purge/<tag>` by evicting the tag; passes everything else on.
struct Purge(OutputCache);

impl Middleware for Purge {
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        let cache = self.0.clone();
        Box::pin(async move {
            let request = ctx.request();
            let tag = match (request.method(), request.path().strip_prefix("/purge/")) {
                (Method::Post, Some(tag)) if !tag.is_empty() => Some(tag.to_owned()),
                _ => None,
            };
            let Some(tag) = tag else {
                return next.run(ctx).await;
            };
            match cache.evict_by_tag(&tag).await {
                Ok(evicted) => Response::new(StatusCode::Ok)
                    .header("Content-Type", "application/json")
                    .body(serde_json::json!({ "tag": tag, "evicted": evicted }).to_string()),
                Err(e) => Response::new(StatusCode::ServiceUnavailable).body(e.to_string()),
            }
        })
    }
}

async fn render(ctx: Context) -> Response {
    // Simulate a slow page so single-flight is observable.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let now = httpdate::fmt_http_date(SystemTime::now());
    Response::new(StatusCode::Ok)
        .header("ETag", "\"v1\"")
        .header("Last-Modified", now.clone())
        .header("Cache-Control", "public, max-age=30")
        .body(format!("{} rendered at {now}\n", ctx.request().path()))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,rttp_cache=debug")))
        .with(fmt::layer().compact().with_target(true))
        .try_init()?;

    let settings = match std::env::var("OUTPUT_CACHE_SETTINGS") {
        Ok(path) => OutputCacheSettings::from_json(&std::fs::read_to_string(path)?)?,
        Err(_) => OutputCacheSettings::from_json(DEFAULT_SETTINGS)?,
    };
    let cache = OutputCache::from_settings(&settings)?;
    let sweeper = cache.start_sweeper();

    let pipeline = Pipeline::new()
        .layer(LoggerMiddleware)
        .layer(Purge(cache.clone()))
        .layer(cache.middleware())
        .endpoint(render);

    let server = Server::bind("127.0.0.1:8080").await?;
    info!(address = %server.local_addr(), "output cache demo listening");
    server
        .serve(
            move |req| {
                let pipeline = pipeline.clone();
                async move { pipeline.handle(req).await }
            },
            async {
                let _ = tokio::signal::ctrl_c().await;
            },
        )
        .await?;

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }
    Ok(())
}
