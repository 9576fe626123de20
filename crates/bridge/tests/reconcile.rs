#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use intent_bridge::{Bridge, BridgeConfig, BridgeError, IntentHandle, IntentRequest, IntentStatus, RetryPolicy};
use intent_core::{OrgScope, ResourceIdentity, ResourceObject, ResourceVersion, Spec};
use intent_persist::{MemoryStore, RecordStore, SqliteStore, StoreError};
use intent_schema::{SchemaRegistry, DATASOURCE_GROUP, DATASOURCE_KIND, DATASOURCE_VERSION};

const WAIT: Duration = Duration::from_secs(3);

fn config() -> BridgeConfig {
    BridgeConfig {
        sweep_interval: Duration::from_millis(50),
        retry: RetryPolicy { max_attempts: 3, base_backoff: Duration::from_millis(10), max_backoff: Duration::from_millis(40) },
        status_history: 64,
        slot_retention: Duration::from_secs(60),
    }
}

/// Sweeps only when asked, after the one at start.
fn quiet_config() -> BridgeConfig {
    BridgeConfig { sweep_interval: Duration::from_secs(60), ..config() }
}

fn id_in(ns: &str, name: &str) -> ResourceIdentity {
    ResourceIdentity::new(DATASOURCE_GROUP, DATASOURCE_VERSION, DATASOURCE_KIND, ns, name).unwrap()
}

fn id(name: &str) -> ResourceIdentity { id_in("default", name) }

fn spec(url: &str) -> Spec {
    serde_json::from_value(serde_json::json!({
        "type": "prometheus",
        "access": "proxy",
        "url": url,
        "jsonData": { "httpMethod": "POST" }
    }))
    .unwrap()
}

fn ds(name: &str, url: &str) -> ResourceObject { ResourceObject::new(id(name), spec(url)) }

fn start(store: Arc<dyn RecordStore>) -> Arc<Bridge> { Bridge::start(store, SchemaRegistry::with_builtins(), config()) }

async fn eventually<F: FnMut() -> bool>(mut f: F) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if f() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    f()
}

async fn create(b: &Arc<Bridge>, obj: ResourceObject) -> IntentStatus {
    let h = b.submit(IntentRequest::Create(obj)).await.unwrap();
    b.wait(&h, WAIT).await.unwrap()
}

async fn lifecycle(store: Arc<dyn RecordStore>) {
    let b = start(Arc::clone(&store));
    assert_eq!(create(&b, ds("prom", "http://prom:9090")).await, IntentStatus::Applied);

    let rec = store.get(&id("prom")).await.unwrap().expect("record written");
    assert_eq!(rec.org_scope, OrgScope(1));
    assert_eq!(rec.fields.get("url"), Some(&serde_json::json!("http://prom:9090")));
    assert_eq!(rec.fields.get("jsonData.httpMethod"), Some(&serde_json::json!("POST")));

    let v1 = b.read(&id("prom")).await.unwrap().unwrap();
    assert!(!v1.resource_version.is_unset());
    assert_eq!(v1.spec, spec("http://prom:9090"));

    let h = b
        .submit(IntentRequest::Update { object: ds("prom", "http://prom:9091"), expected: v1.resource_version })
        .await
        .unwrap();
    assert_eq!(b.wait(&h, WAIT).await.unwrap(), IntentStatus::Applied);
    let v2 = b.read(&id("prom")).await.unwrap().unwrap();
    assert!(v2.resource_version > v1.resource_version);
    assert_eq!(v2.created_at, v1.created_at);
    assert_eq!(v2.spec.get("url"), Some(&serde_json::json!("http://prom:9091")));

    let h = b.submit(IntentRequest::Delete(id("prom"))).await.unwrap();
    assert_eq!(b.wait(&h, WAIT).await.unwrap(), IntentStatus::Deleted);
    assert!(b.read(&id("prom")).await.unwrap().is_none());

    // deleting what is already gone still concludes as deleted
    let h = b.submit(IntentRequest::Delete(id("prom"))).await.unwrap();
    assert_eq!(b.wait(&h, WAIT).await.unwrap(), IntentStatus::Deleted);

    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn datasource_lifecycle_memory() {
    lifecycle(Arc::new(MemoryStore::new())).await;
}

#[tokio::test]
async fn datasource_lifecycle_sqlite() {
    lifecycle(Arc::new(SqliteStore::open_in_memory().unwrap())).await;
}

#[tokio::test]
async fn org_scope_follows_namespace() {
    let store = Arc::new(MemoryStore::new());
    let b = start(store.clone());
    let obj = ResourceObject::new(id_in("org-7", "loki"), spec("http://loki:3100"));
    assert_eq!(create(&b, obj).await, IntentStatus::Applied);
    assert_eq!(store.records()[0].org_scope, OrgScope(7));

    let bad = ResourceObject::new(id_in("team-a", "loki"), spec("http://loki:3100"));
    assert!(matches!(b.submit(IntentRequest::Create(bad.clone())).await, Err(BridgeError::Validation(_))));
    let upd = IntentRequest::Update { object: bad, expected: ResourceVersion(1) };
    assert!(matches!(b.submit(upd).await, Err(BridgeError::Validation(_))));
    assert!(matches!(b.submit(IntentRequest::Delete(id_in("team-a", "loki"))).await, Err(BridgeError::Validation(_))));
    assert_eq!(b.ledger_snapshot().queued, 0);
    assert_eq!(store.records().len(), 1);
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn duplicate_create_is_rejected() {
    let store = Arc::new(MemoryStore::new());
    let b = start(store.clone());
    let h = b.submit(IntentRequest::Create(ds("a", "http://a"))).await.unwrap();
    // rejected against the accepted intent, before it reaches the store
    assert!(matches!(b.submit(IntentRequest::Create(ds("a", "http://b"))).await, Err(BridgeError::AlreadyExists(_))));
    assert_eq!(b.wait(&h, WAIT).await.unwrap(), IntentStatus::Applied);
    assert!(matches!(b.submit(IntentRequest::Create(ds("a", "http://b"))).await, Err(BridgeError::AlreadyExists(_))));
    assert_eq!(store.records().len(), 1);
    assert_eq!(store.records()[0].fields.get("url"), Some(&serde_json::json!("http://a")));
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn stale_update_conflicts_without_touching_store() {
    let store = Arc::new(MemoryStore::new());
    let b = start(store.clone());
    create(&b, ds("a", "http://a")).await;
    let v1 = b.read(&id("a")).await.unwrap().unwrap().resource_version;
    let h = b.submit(IntentRequest::Update { object: ds("a", "http://b"), expected: v1 }).await.unwrap();
    assert_eq!(b.wait(&h, WAIT).await.unwrap(), IntentStatus::Applied);

    let before = store.records();
    let res = b.submit(IntentRequest::Update { object: ds("a", "http://c"), expected: v1 }).await;
    match res {
        Err(BridgeError::Conflict { expected, actual, .. }) => {
            assert_eq!(expected, v1);
            assert!(actual > v1);
        }
        other => panic!("expected conflict, got {:?}", other.map(|h| h.to_string())),
    }
    assert_eq!(store.records(), before);

    let missing = b.submit(IntentRequest::Update { object: ds("nope", "http://c"), expected: ResourceVersion(1) }).await;
    assert!(matches!(missing, Err(BridgeError::NotFound(_))));
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn versions_keep_rising_across_recreate() {
    let b = start(Arc::new(MemoryStore::new()));
    create(&b, ds("a", "http://a")).await;
    let v1 = b.read(&id("a")).await.unwrap().unwrap().resource_version;
    let h = b.submit(IntentRequest::Delete(id("a"))).await.unwrap();
    assert_eq!(b.wait(&h, WAIT).await.unwrap(), IntentStatus::Deleted);
    create(&b, ds("a", "http://a")).await;
    let v2 = b.read(&id("a")).await.unwrap().unwrap().resource_version;
    assert!(v2 > v1);
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn invalid_intents_are_rejected_up_front() {
    let store = Arc::new(MemoryStore::new());
    let b = start(store.clone());

    let mut unknown = ds("a", "http://a");
    unknown.spec.insert("colour".into(), serde_json::json!("blue"));
    assert!(matches!(b.submit(IntentRequest::Create(unknown)).await, Err(BridgeError::Validation(_))));

    let mut untyped = ds("a", "http://a");
    untyped.spec.remove("type");
    assert!(matches!(b.submit(IntentRequest::Create(untyped)).await, Err(BridgeError::Validation(_))));

    let other = ResourceIdentity::new("example.dev", "v1", "Widget", "default", "w").unwrap();
    assert!(matches!(b.submit(IntentRequest::Delete(other)).await, Err(BridgeError::Validation(_))));

    assert!(store.records().is_empty());
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let store = Arc::new(MemoryStore::new());
    let b = start(store.clone());
    store.fail_next(2);
    assert_eq!(create(&b, ds("a", "http://a")).await, IntentStatus::Applied);
    assert_eq!(store.records().len(), 1);
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn exhausted_intent_converges_once_store_recovers() {
    let store = Arc::new(MemoryStore::new());
    let b = start(store.clone());
    store.set_available(false);
    let h = b.submit(IntentRequest::Create(ds("a", "http://a"))).await.unwrap();
    match b.wait(&h, WAIT).await.unwrap() {
        IntentStatus::Failed(reason) => assert!(reason.contains("retry exhausted"), "{}", reason),
        other => panic!("expected failure, got {}", other),
    }
    assert!(store.records().is_empty());

    store.set_available(true);
    assert!(eventually(|| store.records().len() == 1).await, "sweep did not re-drive the intent");
    assert!(eventually(|| b.status(&h).map(|s| s == IntentStatus::Applied).unwrap_or(false)).await);
    assert!(b.last_sweep().epoch > 0);
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn exhausted_delete_converges_once_store_recovers() {
    let store = Arc::new(MemoryStore::new());
    let b = start(store.clone());
    create(&b, ds("a", "http://a")).await;
    store.set_available(false);
    let h = b.submit(IntentRequest::Delete(id("a"))).await.unwrap();
    assert!(matches!(b.wait(&h, WAIT).await.unwrap(), IntentStatus::Failed(_)));

    store.set_available(true);
    assert!(eventually(|| store.records().is_empty()).await, "sweep did not re-drive the delete");
    assert!(eventually(|| b.status(&h).map(|s| s == IntentStatus::Deleted).unwrap_or(false)).await);
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn recreate_replaces_record_a_failed_delete_left_behind() {
    let store = Arc::new(MemoryStore::new());
    let b = Bridge::start(store.clone(), SchemaRegistry::with_builtins(), quiet_config());
    create(&b, ds("a", "http://old")).await;
    store.set_available(false);
    let del = b.submit(IntentRequest::Delete(id("a"))).await.unwrap();
    assert!(matches!(b.wait(&del, WAIT).await.unwrap(), IntentStatus::Failed(_)));
    store.set_available(true);

    // no sweep has run since the store came back; the old row is still live
    assert_eq!(create(&b, ds("a", "http://new")).await, IntentStatus::Applied);
    let recs = store.records();
    assert_eq!(recs.len(), 1);
    assert_eq!(recs[0].fields.get("url"), Some(&serde_json::json!("http://new")));
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn create_over_unknown_live_record_is_already_exists() {
    let store = Arc::new(MemoryStore::new());
    let b = Bridge::start(store.clone(), SchemaRegistry::with_builtins(), quiet_config());
    assert!(eventually(|| b.last_sweep().epoch >= 1).await);
    let mut theirs = ds("a", "http://theirs");
    theirs.resource_version = ResourceVersion(42);
    store.put(&theirs).await.unwrap();

    // the store is down at first contact, so the check happens when applied
    store.set_available(false);
    let h = b.submit(IntentRequest::Create(ds("a", "http://mine"))).await.unwrap();
    store.set_available(true);
    assert_eq!(b.wait(&h, WAIT).await.unwrap(), IntentStatus::AlreadyExists);
    assert_eq!(store.records()[0].fields.get("url"), Some(&serde_json::json!("http://theirs")));
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn update_is_accepted_while_store_is_unreachable() {
    let store = Arc::new(MemoryStore::new());
    let cfg = BridgeConfig {
        retry: RetryPolicy { max_attempts: 50, base_backoff: Duration::from_millis(10), max_backoff: Duration::from_millis(20) },
        ..quiet_config()
    };
    let b = Bridge::start(store.clone(), SchemaRegistry::with_builtins(), cfg);
    assert!(eventually(|| b.last_sweep().epoch >= 1).await);
    for name in ["a", "b"] {
        let mut rec = ds(name, "http://old");
        rec.resource_version = ResourceVersion(42);
        store.put(&rec).await.unwrap();
    }

    store.set_available(false);
    let ok = b.submit(IntentRequest::Update { object: ds("a", "http://new"), expected: ResourceVersion(42) }).await.unwrap();
    let stale = b.submit(IntentRequest::Update { object: ds("b", "http://new"), expected: ResourceVersion(7) }).await.unwrap();
    let missing = b.submit(IntentRequest::Update { object: ds("c", "http://new"), expected: ResourceVersion(1) }).await.unwrap();
    store.set_available(true);

    assert_eq!(b.wait(&ok, WAIT).await.unwrap(), IntentStatus::Applied);
    assert_eq!(b.wait(&stale, WAIT).await.unwrap(), IntentStatus::Conflict);
    assert_eq!(b.wait(&missing, WAIT).await.unwrap(), IntentStatus::NotFound);

    let a = b.read(&id("a")).await.unwrap().unwrap();
    assert!(a.resource_version > ResourceVersion(42));
    assert_eq!(a.spec.get("url"), Some(&serde_json::json!("http://new")));
    let old = b.read(&id("b")).await.unwrap().unwrap();
    assert_eq!(old.resource_version, ResourceVersion(42));
    assert!(b.read(&id("c")).await.unwrap().is_none());

    // the conflict taught the ledger the live version
    let h = b.submit(IntentRequest::Update { object: ds("b", "http://newer"), expected: ResourceVersion(42) }).await.unwrap();
    assert_eq!(b.wait(&h, WAIT).await.unwrap(), IntentStatus::Applied);
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn deleted_identities_leave_the_ledger_after_retention() {
    let store = Arc::new(MemoryStore::new());
    let cfg = BridgeConfig { slot_retention: Duration::ZERO, ..quiet_config() };
    let b = Bridge::start(store.clone(), SchemaRegistry::with_builtins(), cfg);
    create(&b, ds("a", "http://a")).await;
    let v1 = b.read(&id("a")).await.unwrap().unwrap().resource_version;
    let h = b.submit(IntentRequest::Delete(id("a"))).await.unwrap();
    assert_eq!(b.wait(&h, WAIT).await.unwrap(), IntentStatus::Deleted);

    let deadline = tokio::time::Instant::now() + WAIT;
    while b.ledger_snapshot().identities > 0 && tokio::time::Instant::now() < deadline {
        b.sweep_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(b.ledger_snapshot().identities, 0);
    assert!(matches!(b.status(&h), Err(BridgeError::UnknownIntent(_))));

    create(&b, ds("a", "http://a")).await;
    assert!(b.read(&id("a")).await.unwrap().unwrap().resource_version > v1);
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn backing_off_intent_can_be_cancelled() {
    let store = Arc::new(MemoryStore::new());
    let cfg = BridgeConfig {
        retry: RetryPolicy { max_attempts: 5, base_backoff: Duration::from_secs(2), max_backoff: Duration::from_secs(2) },
        ..config()
    };
    let b = Bridge::start(store.clone(), SchemaRegistry::with_builtins(), cfg);
    store.set_available(false);
    let h = b.submit(IntentRequest::Create(ds("a", "http://a"))).await.unwrap();
    // first attempt fails at once; the retry is two seconds out
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(b.status(&h).unwrap(), IntentStatus::Pending);
    b.cancel(&h).unwrap();
    assert_eq!(b.status(&h).unwrap(), IntentStatus::Cancelled);
    assert!(matches!(b.cancel(&h), Err(BridgeError::NotCancellable(_, IntentStatus::Cancelled))));
    assert!(matches!(b.cancel(&IntentHandle::new()), Err(BridgeError::UnknownIntent(_))));

    store.set_available(true);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(store.records().is_empty());
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn one_identity_applies_in_arrival_order() {
    let store = Arc::new(MemoryStore::new());
    let b = start(store.clone());
    let h1 = b.submit(IntentRequest::Create(ds("a", "http://first"))).await.unwrap();
    let h2 = b.submit(IntentRequest::Delete(id("a"))).await.unwrap();
    let h3 = b.submit(IntentRequest::Create(ds("a", "http://second"))).await.unwrap();
    assert_eq!(b.wait(&h1, WAIT).await.unwrap(), IntentStatus::Applied);
    assert_eq!(b.wait(&h2, WAIT).await.unwrap(), IntentStatus::Deleted);
    assert_eq!(b.wait(&h3, WAIT).await.unwrap(), IntentStatus::Applied);
    let recs = store.records();
    assert_eq!(recs.len(), 1);
    assert_eq!(recs[0].fields.get("url"), Some(&serde_json::json!("http://second")));
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn identities_progress_independently() {
    let store = Arc::new(MemoryStore::new());
    let b = start(store.clone());
    let mut handles = Vec::new();
    for i in 0..20 {
        handles.push(b.submit(IntentRequest::Create(ds(&format!("ds-{}", i), "http://x"))).await.unwrap());
    }
    for h in &handles {
        assert_eq!(b.wait(h, WAIT).await.unwrap(), IntentStatus::Applied);
    }
    assert_eq!(store.records().len(), 20);
    assert_eq!(b.list(DATASOURCE_GROUP, DATASOURCE_VERSION, Some("default")).await.unwrap().len(), 20);
    assert!(eventually(|| b.ledger_snapshot().drivers == 0).await);
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn sweep_restores_lost_records() {
    let store = Arc::new(MemoryStore::new());
    let b = start(store.clone());
    create(&b, ds("a", "http://a")).await;
    store.delete(&id("a")).await.unwrap();
    b.sweep_now().await;
    assert!(eventually(|| store.records().len() == 1).await);
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn sweep_deletes_a_record_that_reappears() {
    let store = Arc::new(MemoryStore::new());
    let b = Bridge::start(store.clone(), SchemaRegistry::with_builtins(), quiet_config());
    create(&b, ds("a", "http://a")).await;
    let old = b.read(&id("a")).await.unwrap().unwrap();
    let h = b.submit(IntentRequest::Delete(id("a"))).await.unwrap();
    assert_eq!(b.wait(&h, WAIT).await.unwrap(), IntentStatus::Deleted);

    store.put(&old).await.unwrap();
    let report = b.sweep_now().await;
    assert_eq!(report.resynced, 1);
    assert_eq!(report.adopted, 0);
    assert!(eventually(|| store.records().is_empty()).await);
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn sweep_adopts_newer_out_of_band_writes() {
    let store = Arc::new(MemoryStore::new());
    let b = start(store.clone());
    create(&b, ds("a", "http://a")).await;
    let v1 = b.read(&id("a")).await.unwrap().unwrap().resource_version;

    let mut theirs = ds("a", "http://elsewhere");
    theirs.resource_version = ResourceVersion(v1.0 + 1_000);
    store.put(&theirs).await.unwrap();
    b.sweep_now().await;

    let res = b.submit(IntentRequest::Update { object: ds("a", "http://mine"), expected: v1 }).await;
    assert!(matches!(res, Err(BridgeError::Conflict { actual, .. }) if actual == theirs.resource_version));
    let live = b.read(&id("a")).await.unwrap().unwrap();
    assert_eq!(live.spec.get("url"), Some(&serde_json::json!("http://elsewhere")));

    // a record nobody here ever wrote is learned too
    let mut foreign = ds("b", "http://b");
    foreign.resource_version = ResourceVersion(42);
    store.put(&foreign).await.unwrap();
    b.sweep_now().await;
    let h = b
        .submit(IntentRequest::Update { object: ds("b", "http://b2"), expected: ResourceVersion(42) })
        .await
        .unwrap();
    assert_eq!(b.wait(&h, WAIT).await.unwrap(), IntentStatus::Applied);
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_closes_the_store() {
    let store = Arc::new(MemoryStore::new());
    let b = start(store.clone());
    create(&b, ds("a", "http://a")).await;
    b.shutdown().await.unwrap();
    assert!(matches!(store.get(&id("a")).await, Err(StoreError::Unavailable(_))));
    assert!(matches!(b.submit(IntentRequest::Delete(id("a"))).await, Err(BridgeError::ShuttingDown)));
}
