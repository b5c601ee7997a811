//! Session behavior: warm-up, disconnects, expiry reseeds, reopen after
//! fork, and teardown.

use coordcache::{
    CacheError, CacheOptions, CoordCache, CoordClient, Deserialized, DeserializeError,
    MemoryClient, MemoryStore, Stat, UpdateBroadcaster, UpdateEvent,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const WARM_TIMEOUT: Duration = Duration::from_secs(5);
const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

fn utf8(raw: &[u8], _stat: &Stat) -> Result<Deserialized<String>, DeserializeError> {
    Ok(Deserialized::Value(String::from_utf8(raw.to_vec())?))
}

struct Harness {
    store: MemoryStore,
    cache: CoordCache<String>,
    client: Arc<MemoryClient>,
    updates: broadcast::Receiver<UpdateEvent<String>>,
}

async fn warm_harness<R>(store: MemoryStore, register: R) -> Harness
where
    R: FnOnce(&CoordCache<String>),
{
    let broadcaster: Arc<UpdateBroadcaster<String>> = Arc::new(UpdateBroadcaster::new(64));
    let mut updates = broadcaster.subscribe();
    let cache = CoordCache::with_notifier(broadcaster);
    register(&cache);

    let client = Arc::new(store.client());
    cache.start(client.clone()).await.expect("start failed");
    client.reopen().await.expect("connect failed");
    assert!(cache.wait_for_warm_cache(WARM_TIMEOUT).await, "cache never warmed");

    while updates.try_recv().is_ok() {}
    Harness {
        store,
        cache,
        client,
        updates,
    }
}

/// Wait until `fetch(path)` observes `expected`, or panic after the deadline.
async fn wait_for_value(cache: &CoordCache<String>, path: &str, expected: &str) {
    let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
    loop {
        if cache.fetch(path).unwrap() == expected {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("{path} never reached {expected:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_warm_latch_waits_for_first_seed() {
    let store = MemoryStore::new();
    let cache: CoordCache<String> = CoordCache::new();
    cache
        .register_static("/x/boom", "goat".to_string(), utf8)
        .unwrap();

    let client = Arc::new(store.client());
    cache.start(client.clone()).await.unwrap();

    // not connected yet: the latch stays down
    assert!(!cache.wait_for_warm_cache(Duration::from_millis(100)).await);

    client.reopen().await.unwrap();
    assert!(cache.wait_for_warm_cache(WARM_TIMEOUT).await);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_within_session_catches_up() {
    let store = MemoryStore::new();
    store.set("/x/boom", "cat");
    let h = warm_harness(store, |cache| {
        cache
            .register_static("/x/boom", "goat".to_string(), utf8)
            .unwrap();
    })
    .await;
    assert_eq!(h.cache.fetch("/x/boom").unwrap(), "cat");
    let session = h.client.current_session().unwrap();

    // outage short enough for the session to survive
    h.store.set_offline(true);
    h.store.set("/x/boom", "dog");

    // the mirror still serves the last value it saw
    assert_eq!(h.cache.fetch("/x/boom").unwrap(), "cat");

    h.store.set_offline(false);
    wait_for_value(&h.cache, "/x/boom", "dog").await;
    assert_eq!(h.client.current_session(), Some(session));
}

#[tokio::test(start_paused = true)]
async fn test_session_expiry_reseeds_every_path() {
    let store = MemoryStore::new();
    store.set("/x/boom", "cat");
    store.set("/x/group", "");

    let h = warm_harness(store, |cache| {
        cache
            .register_static("/x/boom", "goat".to_string(), utf8)
            .unwrap();
        cache
            .register_directory(
                "/x/group",
                |child: &str| format!("/x/{child}"),
                |raw: &[u8]| Ok(Deserialized::Value(String::from_utf8(raw.to_vec())?)),
            )
            .unwrap();
    })
    .await;
    let first = h.client.current_session().unwrap();

    // partition outlives the session timeout: the server expires it and
    // every watch from that session is gone
    h.store.set_offline(true);
    h.store.set("/x/boom", "dog");
    h.store.set("/x/group/member", "");
    h.store.set("/x/member", "pearl");
    h.store.expire_session(first);
    h.store.set_offline(false);

    wait_for_value(&h.cache, "/x/boom", "dog").await;
    assert_ne!(h.client.current_session(), Some(first));

    // the directory membership written during the outage was seeded too
    let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
    loop {
        let values = h.cache.fetch_directory_values("/x/group").unwrap();
        if values.get("/x/member").map(String::as_str) == Some("pearl") {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("directory never caught up after expiry: {values:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(h.cache.is_runtime_watched("/x/member"));
}

#[tokio::test(start_paused = true)]
async fn test_open_owns_client_and_warms() {
    let store = MemoryStore::new();
    store.set("/x/boom", "cat");
    let connector = store.connector();

    let cache: CoordCache<String> = CoordCache::open(
        &connector,
        CacheOptions {
            hosts: "mem://local".to_string(),
            warm_timeout: WARM_TIMEOUT,
        },
        |cache| cache.register_static("/x/boom", "goat".to_string(), utf8),
    )
    .await
    .unwrap();

    assert_eq!(cache.fetch("/x/boom").unwrap(), "cat");
    cache.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_open_times_out_when_store_unreachable() {
    let store = MemoryStore::new();
    store.set_offline(true);
    let connector = store.connector();

    let result: Result<CoordCache<String>, _> = CoordCache::open(
        &connector,
        CacheOptions {
            hosts: "mem://local".to_string(),
            warm_timeout: Duration::from_secs(1),
        },
        |cache| cache.register_static("/x/boom", "goat".to_string(), utf8),
    )
    .await;

    assert!(matches!(result, Err(CacheError::WarmTimeout(_))));
}

#[tokio::test(start_paused = true)]
async fn test_open_rejects_empty_hosts() {
    let store = MemoryStore::new();
    let connector = store.connector();

    let result: Result<CoordCache<String>, _> = CoordCache::open(
        &connector,
        CacheOptions {
            hosts: "  ".to_string(),
            warm_timeout: WARM_TIMEOUT,
        },
        |_cache| Ok(()),
    )
    .await;

    assert!(matches!(result, Err(CacheError::Argument(_))));
}

#[tokio::test(start_paused = true)]
async fn test_reopen_rewarns_after_fork() {
    let store = MemoryStore::new();
    store.set("/x/boom", "cat");
    let connector = store.connector();

    let cache: CoordCache<String> = CoordCache::open(
        &connector,
        CacheOptions {
            hosts: "mem://local".to_string(),
            warm_timeout: WARM_TIMEOUT,
        },
        |cache| cache.register_static("/x/boom", "goat".to_string(), utf8),
    )
    .await
    .unwrap();
    assert_eq!(cache.fetch("/x/boom").unwrap(), "cat");

    // the child's store connection is not there yet
    store.set_offline(true);
    store.set("/x/boom", "dog");
    cache.reopen().await.unwrap();

    // immediately after reopen the cache is cold again
    assert!(!cache.wait_for_warm_cache(Duration::from_millis(200)).await);

    store.set_offline(false);
    assert!(cache.wait_for_warm_cache(WARM_TIMEOUT).await);
    wait_for_value(&cache, "/x/boom", "dog").await;
    cache.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_reopen_without_start_fails() {
    let cache: CoordCache<String> = CoordCache::new();
    assert!(matches!(
        cache.reopen().await,
        Err(CacheError::Lifecycle(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_close_releases_watches_and_keeps_readers() {
    let store = MemoryStore::new();
    store.set("/x/boom", "cat");
    store.set("/x/group", "");
    store.set("/x/group/runtime", "");
    store.set("/x/runtime", "flower");

    let h = warm_harness(store, |cache| {
        cache
            .register_static("/x/boom", "goat".to_string(), utf8)
            .unwrap();
        cache
            .register_directory(
                "/x/group",
                |child: &str| format!("/x/{child}"),
                |raw: &[u8]| Ok(Deserialized::Value(String::from_utf8(raw.to_vec())?)),
            )
            .unwrap();
    })
    .await;
    assert!(h.cache.is_runtime_watched("/x/runtime"));

    h.cache.close().await.unwrap();

    // runtime watches are dropped, mirrors keep serving the last state
    assert!(!h.cache.is_runtime_watched("/x/runtime"));
    assert_eq!(h.cache.fetch("/x/boom").unwrap(), "cat");

    // writes after close never reach the mirror
    h.store.set("/x/boom", "dog");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.cache.fetch("/x/boom").unwrap(), "cat");

    // closing twice is fine; restarting is not
    h.cache.close().await.unwrap();
    assert!(matches!(
        h.cache.reopen().await,
        Err(CacheError::Lifecycle(_))
    ));
    drop(h.updates);
}

#[tokio::test(start_paused = true)]
async fn test_warm_survives_expiry_reseed() {
    let store = MemoryStore::new();
    let h = warm_harness(store, |cache| {
        cache
            .register_static("/x/boom", "goat".to_string(), utf8)
            .unwrap();
    })
    .await;
    let first = h.client.current_session().unwrap();

    h.store.expire_session(first);

    // expiry does not reset the latch; the reseed re-releases it
    assert!(h.cache.wait_for_warm_cache(Duration::from_millis(100)).await);
    assert_ne!(h.client.current_session(), Some(first));
}
