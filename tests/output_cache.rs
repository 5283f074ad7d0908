//! End-to-end behaviour of the output cache behind a request pipeline.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rttp_cache::cache::{OutputCache, OutputCacheOptions, PolicyLayer, PolicyRegistry};
use rttp_cache::context::Context;
use rttp_cache::middleware::Pipeline;
use rttp_cache::{Request, Response, StatusCode};

fn get(target: &str, extra: &str) -> Request {
    let raw = format!("GET {target} HTTP/1.1\r\nHost: example.com\r\n{extra}\r\n");
    Request::parse(raw.as_bytes()).unwrap().0
}

fn blog_registry() -> PolicyRegistry {
    let mut registry = PolicyRegistry::default();
    registry
        .add_policy(
            "blog",
            PolicyLayer::new()
                .tag("tag-blog")
                .vary_by_query(["culture"])
                .expire(Duration::from_secs(30)),
        )
        .add_policy("home", PolicyLayer::new().tag("tag-home"))
        .add_policy("nolock", PolicyLayer::new().locking(false))
        .add_policy("cookies", PolicyLayer::new().allow_set_cookie());
    registry.map_group("/blog/*", "blog").unwrap();
    registry.map_endpoint("/", "home").unwrap();
    registry.map_endpoint("/blog/live", "nolock").unwrap();
    registry.map_endpoint("/cookie/relaxed", "cookies").unwrap();
    registry
}

/// A pipeline whose endpoint counts invocations, sleeps `delay`, and tags
/// its responses with an ETag and the call number.
fn app(cache: &OutputCache, calls: &Arc<AtomicUsize>, delay: Duration) -> Pipeline {
    let calls = Arc::clone(calls);
    Pipeline::new()
        .layer(cache.middleware())
        .endpoint(move |ctx: Context| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            let path = ctx.request().path().to_owned();
            async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let mut response = Response::new(StatusCode::Ok)
                    .header("ETag", "\"v1\"")
                    .header("Cache-Control", "public, max-age=30")
                    .body(format!("{path} #{n}"));
                if path.starts_with("/cookie") {
                    response.add_header("Set-Cookie", "session=1");
                }
                response
            }
        })
}

#[tokio::test]
async fn fresh_hit_replays_the_stored_response() {
    let cache = OutputCache::new(blog_registry(), OutputCacheOptions::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let pipeline = app(&cache, &calls, Duration::ZERO);

    let first = pipeline.handle(get("/blog/hello", "")).await;
    let second = pipeline.handle(get("/blog/hello", "")).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(second.status(), first.status());
    assert_eq!(second.headers(), first.headers());
    assert_eq!(second.payload(), first.payload());
}

#[tokio::test]
async fn undeclared_query_parameters_share_an_entry() {
    let cache = OutputCache::new(blog_registry(), OutputCacheOptions::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let pipeline = app(&cache, &calls, Duration::ZERO);

    pipeline.handle(get("/blog/post?utm=a", "")).await;
    pipeline.handle(get("/blog/post?utm=b", "")).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // A declared parameter splits the entry, and so does its absence.
    pipeline.handle(get("/blog/post?culture=fr", "")).await;
    pipeline.handle(get("/blog/post?culture=", "")).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn matching_etag_gets_304() {
    let cache = OutputCache::new(blog_registry(), OutputCacheOptions::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let pipeline = app(&cache, &calls, Duration::ZERO);

    pipeline.handle(get("/blog/hello", "")).await;

    let not_modified = pipeline
        .handle(get("/blog/hello", "If-None-Match: \"v1\"\r\n"))
        .await;
    assert_eq!(not_modified.status(), StatusCode::NotModified);
    assert!(not_modified.payload().is_empty());
    assert_eq!(not_modified.headers().get("etag"), Some("\"v1\""));
    assert_eq!(
        not_modified.headers().get("cache-control"),
        Some("public, max-age=30")
    );

    let full = pipeline
        .handle(get("/blog/hello", "If-None-Match: \"xyz\"\r\n"))
        .await;
    assert_eq!(full.status(), StatusCode::Ok);
    assert_eq!(full.payload().as_ref(), b"/blog/hello #1");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn expired_entries_are_recomputed() {
    let cache = OutputCache::new(blog_registry(), OutputCacheOptions::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let pipeline = app(&cache, &calls, Duration::ZERO);

    pipeline.handle(get("/blog/hello", "")).await;
    tokio::time::advance(Duration::from_secs(29)).await;
    pipeline.handle(get("/blog/hello", "")).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tokio::time::advance(Duration::from_secs(2)).await;
    let refreshed = pipeline.handle(get("/blog/hello", "")).await;
    assert_eq!(refreshed.payload().as_ref(), b"/blog/hello #2");
}

#[tokio::test(start_paused = true)]
async fn concurrent_misses_run_the_handler_once() {
    let cache = OutputCache::new(blog_registry(), OutputCacheOptions::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let pipeline = app(&cache, &calls, Duration::from_millis(100));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.handle(get("/blog/hello", "")).await })
        })
        .collect();

    for handle in handles {
        let response = handle.await.unwrap();
        assert_eq!(response.payload().as_ref(), b"/blog/hello #1");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn disabled_locking_runs_every_miss() {
    let cache = OutputCache::new(blog_registry(), OutputCacheOptions::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let pipeline = app(&cache, &calls, Duration::from_millis(100));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.handle(get("/blog/live", "")).await })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.await.unwrap().status(), StatusCode::Ok);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 4);

    // The last writer's entry now serves hits.
    pipeline.handle(get("/blog/live", "")).await;
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn tag_eviction_is_scoped_to_the_tag() {
    let cache = OutputCache::new(blog_registry(), OutputCacheOptions::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let pipeline = app(&cache, &calls, Duration::ZERO);

    pipeline.handle(get("/blog/a", "")).await;
    pipeline.handle(get("/blog/b", "")).await;
    pipeline.handle(get("/", "")).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    assert_eq!(cache.evict_by_tag("tag-blog").await.unwrap(), 2);

    pipeline.handle(get("/", "")).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    pipeline.handle(get("/blog/a", "")).await;
    pipeline.handle(get("/blog/b", "")).await;
    assert_eq!(calls.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn set_cookie_responses_are_not_stored_by_default() {
    let mut registry = blog_registry();
    registry.add_base_policy(PolicyLayer::new());
    let cache = OutputCache::new(registry, OutputCacheOptions::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let pipeline = app(&cache, &calls, Duration::ZERO);

    pipeline.handle(get("/cookie/strict", "")).await;
    pipeline.handle(get("/cookie/strict", "")).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    pipeline.handle(get("/cookie/relaxed", "")).await;
    let replay = pipeline.handle(get("/cookie/relaxed", "")).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(replay.headers().get("set-cookie"), Some("session=1"));
}

#[tokio::test]
async fn settings_document_drives_the_engine() {
    let cache = OutputCache::from_json(
        r#"{
            "options": { "sweep_interval_secs": 0 },
            "policies": { "blog": { "expire_secs": 5, "tags": ["tag-blog"] } },
            "groups": [ { "pattern": "/blog/*", "policy": "blog" } ]
        }"#,
    )
    .unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let pipeline = app(&cache, &calls, Duration::ZERO);

    pipeline.handle(get("/blog/x", "")).await;
    pipeline.handle(get("/blog/x", "")).await;
    pipeline.handle(get("/about", "")).await;
    pipeline.handle(get("/about", "")).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(cache.evict_by_tag("tag-blog").await.unwrap(), 1);
}

#[tokio::test]
async fn query_case_and_repetition_split_entries() {
    let mut registry = PolicyRegistry::default();
    registry.add_base_policy(PolicyLayer::new());
    let cache = OutputCache::new(registry, OutputCacheOptions::default());
    let pipeline = Pipeline::new()
        .layer(cache.middleware())
        .endpoint(|ctx: Context| async move {
            let page = ctx.request().query_param("page").map(str::to_owned);
            Response::new(StatusCode::Ok).body(format!("page={page:?}"))
        });

    let body = |r: Response| String::from_utf8(r.payload().to_vec()).unwrap();

    assert_eq!(body(pipeline.handle(get("/list?Page=2", "")).await), "page=None");
    assert_eq!(body(pipeline.handle(get("/list?page=2", "")).await), "page=Some(\"2\")");

    assert_eq!(body(pipeline.handle(get("/list?page=1,2", "")).await), "page=Some(\"1,2\")");
    assert_eq!(body(pipeline.handle(get("/list?page=1&page=2", "")).await), "page=Some(\"1\")");
}
