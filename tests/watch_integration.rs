/// End-to-end tests of the watch layer over the in-memory transport
///
/// Each test builds a Manager from one `FakeTransport` per cluster and drives
/// Manager -> Watcher -> ClusterWatcher -> DataStore through the public API.
use async_trait::async_trait;
use fleetwatch::Error;
use fleetwatch::k8s::identity::{Actor, GroupResolver, RequestContext, StaticGroupResolver};
use fleetwatch::k8s::transport::{ClusterTransport, FakeTransport};
use fleetwatch::k8s::watch::{
    self, ClientOptions, LabelSelector, Manager, ManagerOptions, WatchOptions, Watcher, in_cluster,
    objects, with_labels, without_deleted,
};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::serde_json::json;
use kube::ResourceExt;
use kube::api::{ApiResource, DynamicObject};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

fn config_map(namespace: &str, name: &str, labels: &[(&str, &str)]) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                    .collect(),
            ),
            ..ObjectMeta::default()
        },
        ..ConfigMap::default()
    }
}

fn config_maps() -> ApiResource {
    ApiResource::erase::<ConfigMap>(&())
}

fn alice() -> RequestContext {
    RequestContext::with_actor(Actor::new("u1", "alice@example.com"))
}

fn manager_with(clusters: &[(&str, &FakeTransport)], options: ManagerOptions) -> Manager {
    let transports: BTreeMap<String, Arc<dyn ClusterTransport>> = clusters
        .iter()
        .map(|(name, transport)| {
            let transport: Arc<dyn ClusterTransport> = Arc::new((*transport).clone());
            ((*name).to_string(), transport)
        })
        .collect();
    Manager::with_transports(transports, options)
}

fn manager(clusters: &[(&str, &FakeTransport)]) -> Manager {
    let resolver = StaticGroupResolver::new().with_member("u1", &["team-a", "admins"]);
    manager_with(
        clusters,
        ManagerOptions::default().with_group_resolver(Arc::new(resolver)),
    )
}

struct Running {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Running {
    async fn stop(self, manager: &Manager) {
        self.cancel.cancel();
        manager.stop();
        for handle in self.handles {
            handle.await.unwrap();
        }
    }
}

async fn start<K>(manager: &Manager, watcher: &Watcher<K>) -> Running
where
    K: watch::Watchable,
{
    let cancel = CancellationToken::new();
    let handles = watcher.start(&cancel);
    let ready = tokio::time::timeout(Duration::from_secs(5), manager.wait_for_ready(&cancel))
        .await
        .unwrap();
    assert!(ready, "informers did not sync");
    Running { cancel, handles }
}

async fn eventually(check: impl Fn() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

#[tokio::test]
async fn test_added_then_deleted_is_not_found() {
    let dev = FakeTransport::new();
    dev.seed(&config_map("foo", "bar", &[])).unwrap();
    let manager = manager(&[("dev", &dev)]);

    let watcher = watch::watch::<ConfigMap>(&manager, WatchOptions::new()).await;
    let running = start(&manager, &watcher).await;
    assert_eq!(watcher.get("dev", "foo", "bar").unwrap().name_any(), "bar");

    dev.remove(&config_maps(), "foo", "bar");
    eventually(|| watcher.get("dev", "foo", "bar").is_err()).await;

    let err = watcher.get("dev", "foo", "bar").unwrap_err();
    assert!(err.is_not_found());
    assert!(matches!(err, Error::NotFound { ref cluster, ref namespace, ref name }
        if cluster == "dev" && namespace == "foo" && name == "bar"));
    running.stop(&manager).await;
}

#[tokio::test]
async fn test_same_key_in_two_clusters_is_two_entries() {
    let dev = FakeTransport::new();
    let prod = FakeTransport::new();
    dev.seed(&config_map("foo", "bar", &[("env", "dev")])).unwrap();
    prod.seed(&config_map("foo", "bar", &[("env", "prod")])).unwrap();
    let manager = manager(&[("dev", &dev), ("prod", &prod)]);

    let watcher = watch::watch::<ConfigMap>(&manager, WatchOptions::new()).await;
    let running = start(&manager, &watcher).await;

    let all = watcher.all();
    assert_eq!(all.len(), 2);
    assert_eq!(
        all.iter().map(|w| w.cluster.as_str()).collect::<Vec<_>>(),
        vec!["dev", "prod"]
    );
    assert_eq!(watcher.get("prod", "foo", "bar").unwrap().labels()["env"], "prod");
    assert_eq!(objects(&all).len(), 2);
    assert_eq!(watcher.clusters(), vec!["dev", "prod"]);
    running.stop(&manager).await;
}

#[tokio::test]
async fn test_unserved_kind_yields_empty_watcher() {
    let dev = FakeTransport::new().serving(&ApiResource::erase::<Secret>(&()));
    dev.seed(&config_map("foo", "bar", &[])).unwrap();
    let manager = manager(&[("dev", &dev)]);

    let watcher = watch::watch::<ConfigMap>(&manager, WatchOptions::new()).await;
    assert!(!watcher.enabled());
    assert!(watcher.clusters().is_empty());
    assert!(watcher.start(&CancellationToken::new()).is_empty());
    assert!(manager.wait_for_ready(&CancellationToken::new()).await);

    assert!(watcher.all().is_empty());
    assert!(watcher.get("dev", "foo", "bar").unwrap_err().is_not_found());
    let err = watcher.delete(&alice(), "dev", "foo", "bar").await.unwrap_err();
    assert!(matches!(err, Error::NoWatcher { ref cluster } if cluster == "dev"));
    assert!(dev.calls().is_empty());
}

#[tokio::test]
async fn test_reserved_namespace_is_never_surfaced() {
    let dev = FakeTransport::new();
    dev.seed(&config_map("nais-system", "platform", &[])).unwrap();
    dev.seed(&config_map("foo", "bar", &[])).unwrap();
    let manager = manager(&[("dev", &dev)]);

    let watcher = watch::watch::<ConfigMap>(&manager, WatchOptions::new()).await;
    let running = start(&manager, &watcher).await;

    assert_eq!(watcher.all().len(), 1);
    assert!(watcher.get_by_namespace("nais-system", &[]).is_empty());
    assert!(watcher.get("dev", "nais-system", "platform").is_err());

    dev.seed(&config_map("nais-system", "late", &[])).unwrap();
    dev.seed(&config_map("foo", "late", &[])).unwrap();
    eventually(|| watcher.get("dev", "foo", "late").is_ok()).await;
    assert!(watcher.get("dev", "nais-system", "late").is_err());
    running.stop(&manager).await;
}

#[tokio::test]
async fn test_custom_reserved_namespace() {
    let dev = FakeTransport::new();
    dev.seed(&config_map("platform", "hidden", &[])).unwrap();
    dev.seed(&config_map("nais-system", "visible", &[])).unwrap();
    let manager = manager_with(
        &[("dev", &dev)],
        ManagerOptions::default().with_reserved_namespace("platform"),
    );

    let watcher = watch::watch::<ConfigMap>(&manager, WatchOptions::new()).await;
    let running = start(&manager, &watcher).await;
    assert!(watcher.get("dev", "nais-system", "visible").is_ok());
    assert!(watcher.get("dev", "platform", "hidden").is_err());
    running.stop(&manager).await;
}

#[tokio::test]
async fn test_delete_without_watcher_makes_no_remote_call() {
    let dev = FakeTransport::new();
    dev.seed(&config_map("foo", "bar", &[])).unwrap();
    let manager = manager(&[("dev", &dev)]);

    let watcher = watch::watch::<ConfigMap>(&manager, WatchOptions::new()).await;
    let err = watcher.delete(&alice(), "prod", "foo", "bar").await.unwrap_err();

    assert_eq!(err.to_string(), "no watcher for cluster prod");
    assert!(dev.calls().is_empty());
    assert!(dev.contains(&config_maps(), "foo", "bar"));
}

#[tokio::test]
async fn test_quick_delete_purges_immediately() {
    // Delete events are never echoed, so only the quick path can clear the cache
    let dev = FakeTransport::new();
    dev.seed(&config_map("foo", "bar", &[])).unwrap();
    let manager = manager(&[("dev", &dev)]);

    let watcher = watch::watch::<ConfigMap>(&manager, WatchOptions::new().with_quick_delete(true)).await;
    let other = watch::watch::<ConfigMap>(&manager, WatchOptions::new()).await;
    let running = start(&manager, &watcher).await;
    assert!(other.get("dev", "foo", "bar").is_ok());

    watcher.delete(&alice(), "dev", "foo", "bar").await.unwrap();

    assert!(watcher.get("dev", "foo", "bar").unwrap_err().is_not_found());
    assert!(other.get("dev", "foo", "bar").unwrap_err().is_not_found());
    assert!(!dev.contains(&config_maps(), "foo", "bar"));
    assert_eq!(watcher.stats().removed, 1);
    running.stop(&manager).await;
}

#[tokio::test]
async fn test_delete_without_delete_events_is_synthesized() {
    let dev = FakeTransport::new();
    dev.seed(&config_map("foo", "bar", &[])).unwrap();
    let manager = manager(&[("dev", &dev)]);

    let watcher = watch::watch::<ConfigMap>(&manager, WatchOptions::new()).await;
    let running = start(&manager, &watcher).await;

    watcher.delete(&alice(), "dev", "foo", "bar").await.unwrap();
    assert!(watcher.get("dev", "foo", "bar").is_err());
    running.stop(&manager).await;
}

#[tokio::test]
async fn test_delete_with_delete_events_follows_the_stream() {
    let dev = FakeTransport::new().with_delete_events(true);
    dev.seed(&config_map("foo", "bar", &[])).unwrap();
    let manager = manager(&[("dev", &dev)]);

    let watcher = watch::watch::<ConfigMap>(&manager, WatchOptions::new()).await;
    let running = start(&manager, &watcher).await;

    watcher.delete(&alice(), "dev", "foo", "bar").await.unwrap();
    eventually(|| watcher.get("dev", "foo", "bar").is_err()).await;
    assert_eq!(dev.calls().len(), 1);
    running.stop(&manager).await;
}

#[tokio::test]
async fn test_remote_delete_failure_is_surfaced() {
    let dev = FakeTransport::new();
    let manager = manager(&[("dev", &dev)]);
    let watcher = watch::watch::<ConfigMap>(&manager, WatchOptions::new()).await;

    let err = watcher.delete(&alice(), "dev", "foo", "missing").await.unwrap_err();
    assert!(err.is_not_found());
    assert!(err.to_string().starts_with("deleting object in cluster dev"));
}

#[tokio::test]
async fn test_mutations_run_as_the_actor() {
    let dev = FakeTransport::new();
    let manager = manager(&[("dev", &dev)]);
    let watcher = watch::watch::<ConfigMap>(&manager, WatchOptions::new()).await;
    let running = start(&manager, &watcher).await;

    let client = watcher
        .impersonated_client_with_namespace(&alice(), "dev", "foo", &ClientOptions::default())
        .await
        .unwrap();
    let obj = DynamicObject::new("created", &config_maps());
    client.create(&obj).await.unwrap();
    eventually(|| watcher.get("dev", "foo", "created").is_ok()).await;

    let calls = dev.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].action, "create");
    assert_eq!(calls[0].user.as_deref(), Some("alice@example.com"));
    assert_eq!(calls[0].groups, vec!["team-a", "admins"]);

    let system = watcher
        .system_authenticated_client("dev", &ClientOptions::default())
        .unwrap();
    system.delete("foo", "created").await.unwrap();
    assert_eq!(dev.calls()[1].user, None);

    assert!(matches!(
        watcher.impersonated_client(&RequestContext::anonymous(), "dev", &ClientOptions::default()).await,
        Err(Error::Unauthenticated)
    ));
    running.stop(&manager).await;
}

#[tokio::test]
async fn test_client_resource_override() {
    let dev = FakeTransport::new();
    dev.seed(&Secret {
        metadata: ObjectMeta {
            name: Some("token".to_string()),
            namespace: Some("foo".to_string()),
            ..ObjectMeta::default()
        },
        ..Secret::default()
    })
    .unwrap();
    let manager = manager(&[("dev", &dev)]);
    let watcher = watch::watch::<ConfigMap>(&manager, WatchOptions::new()).await;

    let secrets = ApiResource::erase::<Secret>(&());
    let client = watcher
        .impersonated_client(&alice(), "dev", &ClientOptions::with_resource(secrets))
        .await
        .unwrap();
    assert_eq!(client.get("foo", "token").await.unwrap().name_any(), "token");
}

struct FailingResolver;

#[async_trait]
impl GroupResolver for FailingResolver {
    async fn groups_for(&self, _actor: &Actor) -> fleetwatch::Result<Vec<String>> {
        Err(Error::Custom("directory unavailable".to_string()))
    }
}

#[tokio::test]
async fn test_group_resolution_failure_blocks_mutation() {
    let dev = FakeTransport::new();
    dev.seed(&config_map("foo", "bar", &[])).unwrap();
    let manager = manager_with(
        &[("dev", &dev)],
        ManagerOptions::default().with_group_resolver(Arc::new(FailingResolver)),
    );
    let watcher = watch::watch::<ConfigMap>(&manager, WatchOptions::new()).await;

    let err = watcher.delete(&alice(), "dev", "foo", "bar").await.unwrap_err();
    assert!(matches!(err, Error::GroupResolution { ref user, ref reason }
        if user == "alice@example.com" && reason == "directory unavailable"));
    assert!(dev.calls().is_empty());
}

#[tokio::test]
async fn test_filters_and_server_side_selector() {
    let dev = FakeTransport::new();
    let prod = FakeTransport::new();
    for transport in [&dev, &prod] {
        transport.seed(&config_map("foo", "web", &[("app", "web")])).unwrap();
        transport.seed(&config_map("foo", "db", &[("app", "db")])).unwrap();
    }
    let manager = manager(&[("dev", &dev), ("prod", &prod)]);

    let watcher = watch::watch::<ConfigMap>(&manager, WatchOptions::new()).await;
    let selected = watch::watch::<ConfigMap>(
        &manager,
        WatchOptions::new().with_label_selector("app=web".parse().unwrap()),
    )
    .await;
    // Two informers, so both must run before the manager can report ready
    let cancel = CancellationToken::new();
    let mut handles = watcher.start(&cancel);
    handles.extend(selected.start(&cancel));
    assert!(manager.wait_for_ready(&cancel).await);
    let running = Running { cancel, handles };

    let web: LabelSelector = "app=web".parse().unwrap();
    assert_eq!(watcher.get_by_namespace("foo", &[]).len(), 4);
    assert_eq!(watcher.get_by_namespace("foo", &[with_labels(web.clone())]).len(), 2);
    assert_eq!(
        watcher
            .get_by_namespace("foo", &[with_labels(web.clone()), in_cluster("prod")])
            .len(),
        1
    );
    assert_eq!(
        watcher
            .get_by_cluster("dev", &[with_labels(LabelSelector::everything()), without_deleted()])
            .iter()
            .map(|w| w.name())
            .collect::<Vec<_>>(),
        vec!["db", "web"]
    );

    assert_eq!(selected.all().len(), 2);
    assert!(selected.all().iter().all(|w| w.name() == "web"));

    running.stop(&manager).await;
}

#[tokio::test]
async fn test_hooks_and_stats() {
    let dev = FakeTransport::new();
    dev.seed(&config_map("foo", "bar", &[])).unwrap();
    let manager = manager(&[("dev", &dev)]);
    let watcher = watch::watch::<ConfigMap>(&manager, WatchOptions::new()).await;

    let updates = Arc::new(AtomicUsize::new(0));
    let removes = Arc::new(AtomicUsize::new(0));
    watcher.on_update({
        let updates = updates.clone();
        move |cluster, obj: &ConfigMap| {
            assert_eq!(cluster, "dev");
            assert_eq!(obj.name_any(), "bar");
            updates.fetch_add(1, Ordering::SeqCst);
        }
    });
    watcher.on_remove({
        let removes = removes.clone();
        move |_, _: &ConfigMap| {
            removes.fetch_add(1, Ordering::SeqCst);
        }
    });
    let running = start(&manager, &watcher).await;

    let mut changed = config_map("foo", "bar", &[("version", "2")]);
    changed.data = Some([("key".to_string(), "value".to_string())].into());
    dev.seed(&changed).unwrap();
    eventually(|| updates.load(Ordering::SeqCst) == 1).await;
    assert_eq!(watcher.get("dev", "foo", "bar").unwrap().labels()["version"], "2");

    dev.remove(&config_maps(), "foo", "bar");
    eventually(|| removes.load(Ordering::SeqCst) == 1).await;

    let stats = watcher.stats();
    assert_eq!((stats.added, stats.updated, stats.removed), (1, 1, 1));
    running.stop(&manager).await;
}

#[tokio::test]
async fn test_converter_and_resource_override() {
    let dev = FakeTransport::new();
    dev.seed(&Secret {
        metadata: ObjectMeta {
            name: Some("token".to_string()),
            namespace: Some("foo".to_string()),
            ..ObjectMeta::default()
        },
        ..Secret::default()
    })
    .unwrap();
    let manager = manager(&[("dev", &dev)]);

    // Secrets surfaced as config maps that only keep the name and cluster
    let options = WatchOptions::new()
        .with_resource(ApiResource::erase::<Secret>(&()))
        .with_converter(|raw: &DynamicObject, cluster: &str| {
            let mut cm = config_map(&raw.namespace().unwrap_or_default(), &raw.name_any(), &[]);
            cm.data = Some([("cluster".to_string(), cluster.to_string())].into());
            Some(cm)
        });
    let watcher = watch::watch::<ConfigMap>(&manager, options).await;
    let running = start(&manager, &watcher).await;

    assert_eq!(watcher.resource().plural, "secrets");
    let converted = watcher.get("dev", "foo", "token").unwrap();
    assert_eq!(converted.data.unwrap()["cluster"], "dev");
    running.stop(&manager).await;
}

#[tokio::test]
async fn test_wait_for_ready_honours_cancel_and_stop_is_idempotent() {
    let dev = FakeTransport::new();
    let manager = manager(&[("dev", &dev)]);
    let watcher = watch::watch::<ConfigMap>(&manager, WatchOptions::new()).await;

    // Not started, so the informer can never sync
    let cancel = CancellationToken::new();
    cancel.cancel();
    assert!(!manager.wait_for_ready(&cancel).await);

    let running = start(&manager, &watcher).await;
    manager.stop();
    manager.stop();
    for handle in running.handles {
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
    assert!(manager.is_stopped());
}

#[tokio::test]
async fn test_update_that_stops_converting_is_dropped() {
    let dev = FakeTransport::new();
    dev.seed(&config_map("foo", "bar", &[("state", "ok")])).unwrap();
    let manager = manager(&[("dev", &dev)]);

    let options = WatchOptions::new().with_converter(|raw: &DynamicObject, _: &str| {
        if raw.labels().contains_key("skip") {
            return None;
        }
        let mut cm = config_map(&raw.namespace().unwrap_or_default(), &raw.name_any(), &[]);
        cm.metadata.labels = Some(raw.labels().clone());
        Some(cm)
    });
    let watcher = watch::watch::<ConfigMap>(&manager, options).await;
    let running = start(&manager, &watcher).await;
    assert_eq!(watcher.get("dev", "foo", "bar").unwrap().labels()["state"], "ok");

    dev.seed(&config_map("foo", "bar", &[("skip", "yes")])).unwrap();
    eventually(|| watcher.get("dev", "foo", "bar").is_err()).await;
    assert!(watcher.get("dev", "foo", "bar").unwrap_err().is_not_found());
    assert!(watcher.all().is_empty());
    running.stop(&manager).await;
}

#[tokio::test]
async fn test_malformed_object_is_dropped_without_halting_the_watch() {
    let dev = FakeTransport::new();
    dev.seed(&config_map("foo", "good", &[])).unwrap();
    let mut broken = DynamicObject::new("broken", &config_maps()).within("foo");
    broken.data = json!({ "data": { "count": 5 } });
    dev.apply(&config_maps(), broken);
    let manager = manager(&[("dev", &dev)]);

    let watcher = watch::watch::<ConfigMap>(&manager, WatchOptions::new()).await;
    let running = start(&manager, &watcher).await;

    assert!(watcher.get("dev", "foo", "good").is_ok());
    assert!(watcher.get("dev", "foo", "broken").unwrap_err().is_not_found());
    assert_eq!(watcher.all().len(), 1);

    dev.seed(&config_map("foo", "after", &[])).unwrap();
    eventually(|| watcher.get("dev", "foo", "after").is_ok()).await;
    assert_eq!(watcher.stats().added, 2);
    running.stop(&manager).await;
}

#[tokio::test]
async fn test_cancelling_one_watcher_keeps_the_other_fresh() {
    let dev = FakeTransport::new();
    let manager = manager(&[("dev", &dev)]);
    let first = watch::watch::<ConfigMap>(&manager, WatchOptions::new()).await;
    let second = watch::watch::<ConfigMap>(&manager, WatchOptions::new()).await;

    let first_cancel = CancellationToken::new();
    let second_cancel = CancellationToken::new();
    let first_handles = first.start(&first_cancel);
    let second_handles = second.start(&second_cancel);
    let ready = tokio::time::timeout(Duration::from_secs(5), manager.wait_for_ready(&second_cancel))
        .await
        .unwrap();
    assert!(ready);

    first_cancel.cancel();
    for handle in first_handles {
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }

    dev.seed(&config_map("foo", "late", &[])).unwrap();
    eventually(|| second.get("dev", "foo", "late").is_ok()).await;

    let running = Running {
        cancel: second_cancel,
        handles: second_handles,
    };
    running.stop(&manager).await;
}

#[tokio::test]
async fn test_hooks_may_query_their_watcher() {
    let dev = FakeTransport::new();
    dev.seed(&config_map("foo", "bar", &[])).unwrap();
    let manager = manager(&[("dev", &dev)]);
    let watcher = Arc::new(watch::watch::<ConfigMap>(&manager, WatchOptions::new()).await);

    let found = Arc::new(AtomicUsize::new(0));
    watcher.on_add({
        let watcher = Arc::downgrade(&watcher);
        let found = found.clone();
        move |cluster, obj: &ConfigMap| {
            let Some(watcher) = watcher.upgrade() else {
                return;
            };
            let namespace = obj.namespace().unwrap_or_default();
            if watcher.get(cluster, &namespace, &obj.name_any()).is_ok() {
                found.fetch_add(1, Ordering::SeqCst);
            }
        }
    });
    let running = start(&manager, &watcher).await;
    eventually(|| found.load(Ordering::SeqCst) == 1).await;

    dev.seed(&config_map("foo", "later", &[])).unwrap();
    eventually(|| found.load(Ordering::SeqCst) == 2).await;
    running.stop(&manager).await;
}
