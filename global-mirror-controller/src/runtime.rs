use global_mirror_k8s_utils::{WatchEvent, store_ready, watch_with_store};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::core::{Expression, Selector};
use kube::runtime::reflector::Store;
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use tokio::select;
use tokio::sync::mpsc::Receiver;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::metrics::ControllerMetrics;
use crate::mirror::{MIRROR_LABEL, SourceKey, owning_service, source_ref};
use crate::settings::MirrorSettings;
use crate::{Error, Result, controller, gc};

/// Starts the watchers, blocks until every cache has absorbed its initial
/// list, then runs the mirror engine until cancellation. An incomplete
/// initial list would read as spurious deletions, so failing the sync gate
/// is fatal rather than degraded.
pub async fn start_mirror_controller(
    client: Client,
    settings: MirrorSettings,
    cancel: CancellationToken,
) -> Result<()> {
    let source_config = watcher::Config::default()
        .labels_from(&settings.selector)
        // the global namespace must never feed itself
        .fields(&format!("metadata.namespace!={}", settings.global_namespace))
        .any_semantic();
    let mirror_selector: Selector = Expression::Equal(MIRROR_LABEL.into(), "true".into()).into();
    let mirror_config = watcher::Config::default()
        .labels_from(&mirror_selector)
        .any_semantic();

    let service_api: Api<Service> = Api::all(client.clone());
    let slice_api: Api<EndpointSlice> = Api::all(client.clone());
    let mirror_service_api: Api<Service> =
        Api::namespaced(client.clone(), &settings.global_namespace);
    let mirror_slice_api: Api<EndpointSlice> =
        Api::namespaced(client.clone(), &settings.global_namespace);

    let (services, service_events) =
        watch_with_store(service_api, source_config.clone(), cancel.child_token());
    let (endpoint_slices, slice_events) =
        watch_with_store(slice_api, source_config, cancel.child_token());
    let (mirror_services, mirror_service_events) =
        watch_with_store(mirror_service_api, mirror_config.clone(), cancel.child_token());
    let (mirror_slices, mirror_slice_events) =
        watch_with_store(mirror_slice_api, mirror_config, cancel.child_token());

    wait_for_cache_sync(
        &services,
        &endpoint_slices,
        &mirror_services,
        &mirror_slices,
        &settings,
        &cancel,
    )
    .await?;
    info!("caches synced, starting mirror engine");

    let ctx = Context {
        client,
        settings,
        metrics: ControllerMetrics::new(),
        services,
        endpoint_slices,
        mirror_services,
        mirror_slices,
    };
    let events = EventStreams {
        services: service_events,
        slices: slice_events,
        mirror_services: mirror_service_events,
        mirror_slices: mirror_slice_events,
    };
    run_engine(ctx, events, cancel).await;
    Ok(())
}

async fn wait_for_cache_sync(
    services: &Store<Service>,
    endpoint_slices: &Store<EndpointSlice>,
    mirror_services: &Store<Service>,
    mirror_slices: &Store<EndpointSlice>,
    settings: &MirrorSettings,
    cancel: &CancellationToken,
) -> Result<()> {
    let wait = async {
        tokio::try_join!(
            store_ready(services),
            store_ready(endpoint_slices),
            store_ready(mirror_services),
            store_ready(mirror_slices),
        )
    };
    select! {
        _ = cancel.cancelled() => Err(Error::SyncCancelled),
        synced = tokio::time::timeout(settings.sync_timeout, wait) => match synced {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(Error::SyncTimeout),
        },
    }
}

struct EventStreams {
    services: Receiver<WatchEvent<Service>>,
    slices: Receiver<WatchEvent<EndpointSlice>>,
    mirror_services: Receiver<WatchEvent<Service>>,
    mirror_slices: Receiver<WatchEvent<EndpointSlice>>,
}

enum Trigger {
    Reconcile(SourceKey),
    Sweep,
    Skip,
    Shutdown,
}

/// Single consumer of all four watch streams and sole writer of the global
/// namespace. Per-kind ordering comes from the channels; no cross-kind
/// ordering is assumed, reconciliation reads only the caches.
async fn run_engine(ctx: Context, mut events: EventStreams, cancel: CancellationToken) {
    let mut sweep_tick = tokio::time::interval(ctx.settings.gc_interval);
    sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let trigger = select! {
            _ = cancel.cancelled() => Trigger::Shutdown,
            _ = sweep_tick.tick() => Trigger::Sweep,
            event = events.services.recv() => service_trigger(event),
            event = events.slices.recv() => slice_trigger(event),
            event = events.mirror_services.recv() => mirror_trigger(event),
            event = events.mirror_slices.recv() => mirror_trigger(event),
        };
        match trigger {
            Trigger::Reconcile(key) => {
                if let Err(e) = controller::reconcile(&ctx, &key, false).await {
                    // isolate the failure, other sources keep flowing
                    ctx.metrics.reconcile_failures.inc();
                    warn!(%e, "failed to reconcile {}", key);
                }
            }
            Trigger::Sweep => gc::sweep(&ctx).await,
            Trigger::Skip => {}
            Trigger::Shutdown => break,
        }
    }
    info!("mirror engine stopped");
}

fn service_trigger(event: Option<WatchEvent<Service>>) -> Trigger {
    match event {
        Some(WatchEvent::Applied(service) | WatchEvent::Deleted(service)) => {
            match service.namespace() {
                Some(namespace) => Trigger::Reconcile(SourceKey::new(namespace, service.name_any())),
                None => Trigger::Skip,
            }
        }
        // a completed (re)list: deletions during a disconnect produce no
        // events, only a full pass restores the invariant
        Some(WatchEvent::Resynced) => Trigger::Sweep,
        None => Trigger::Shutdown,
    }
}

fn slice_trigger(event: Option<WatchEvent<EndpointSlice>>) -> Trigger {
    match event {
        Some(WatchEvent::Applied(slice) | WatchEvent::Deleted(slice)) => {
            match owning_service(&slice) {
                Some(key) => Trigger::Reconcile(key),
                None => {
                    debug!(
                        "EndpointSlice {}/{} has no owning service label, skipping",
                        slice.namespace().unwrap_or_default(),
                        slice.name_any()
                    );
                    Trigger::Skip
                }
            }
        }
        Some(WatchEvent::Resynced) => Trigger::Sweep,
        None => Trigger::Shutdown,
    }
}

/// Out-of-band edits and deletions in the global namespace map back to the
/// source identity for prompt repair.
fn mirror_trigger<K: ResourceExt>(event: Option<WatchEvent<K>>) -> Trigger {
    match event {
        Some(WatchEvent::Applied(mirror) | WatchEvent::Deleted(mirror)) => {
            match source_ref(mirror.labels()) {
                Some(key) => Trigger::Reconcile(key),
                None => {
                    warn!(
                        "mirrored object {} has a malformed back-reference, skipping",
                        mirror.name_any()
                    );
                    Trigger::Skip
                }
            }
        }
        Some(WatchEvent::Resynced) => Trigger::Sweep,
        None => Trigger::Shutdown,
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::runtime::reflector::store;
    use kube::runtime::watcher::Event;

    use super::*;
    use crate::mirror::{SERVICE_OWNER_LABEL, SOURCE_NAME_LABEL, SOURCE_NAMESPACE_LABEL};

    fn settings(sync_timeout: Duration) -> MirrorSettings {
        MirrorSettings::new(
            "default",
            "mirror.homelab.dev/export=true",
            &[],
            sync_timeout,
            Duration::from_secs(60),
            Duration::from_secs(30),
        )
        .expect("settings")
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_gate_times_out_on_stalled_watcher() {
        let (services, _service_writer) = store::<Service>();
        let (slices, mut slice_writer) = store::<EndpointSlice>();
        let (mirror_services, mut mirror_service_writer) = store::<Service>();
        let (mirror_slices, mut mirror_slice_writer) = store::<EndpointSlice>();
        // three of four caches finish their list, one never does
        slice_writer.apply_watcher_event(&Event::Init);
        slice_writer.apply_watcher_event(&Event::InitDone);
        mirror_service_writer.apply_watcher_event(&Event::Init);
        mirror_service_writer.apply_watcher_event(&Event::InitDone);
        mirror_slice_writer.apply_watcher_event(&Event::Init);
        mirror_slice_writer.apply_watcher_event(&Event::InitDone);

        let gate = wait_for_cache_sync(
            &services,
            &slices,
            &mirror_services,
            &mirror_slices,
            &settings(Duration::from_secs(30)),
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(gate, Err(Error::SyncTimeout)));
    }

    #[tokio::test]
    async fn test_sync_gate_cancellation_is_fatal() {
        let (services, _w1) = store::<Service>();
        let (slices, _w2) = store::<EndpointSlice>();
        let (mirror_services, _w3) = store::<Service>();
        let (mirror_slices, _w4) = store::<EndpointSlice>();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let gate = wait_for_cache_sync(
            &services,
            &slices,
            &mirror_services,
            &mirror_slices,
            &settings(Duration::from_secs(30)),
            &cancel,
        )
        .await;
        assert!(matches!(gate, Err(Error::SyncCancelled)));
    }

    #[tokio::test]
    async fn test_sync_gate_passes_when_all_caches_ready() {
        let (services, mut w1) = store::<Service>();
        let (slices, mut w2) = store::<EndpointSlice>();
        let (mirror_services, mut w3) = store::<Service>();
        let (mirror_slices, mut w4) = store::<EndpointSlice>();
        w1.apply_watcher_event(&Event::Init);
        w1.apply_watcher_event(&Event::InitDone);
        w2.apply_watcher_event(&Event::Init);
        w2.apply_watcher_event(&Event::InitDone);
        w3.apply_watcher_event(&Event::Init);
        w3.apply_watcher_event(&Event::InitDone);
        w4.apply_watcher_event(&Event::Init);
        w4.apply_watcher_event(&Event::InitDone);

        let gate = wait_for_cache_sync(
            &services,
            &slices,
            &mirror_services,
            &mirror_slices,
            &settings(Duration::from_secs(1)),
            &CancellationToken::new(),
        )
        .await;
        assert!(gate.is_ok());
    }

    #[test]
    fn test_service_trigger_maps_identity() {
        let service = Service {
            metadata: ObjectMeta {
                name: Some("web".into()),
                namespace: Some("team-a".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        let trigger = service_trigger(Some(WatchEvent::Deleted(service)));
        assert!(
            matches!(trigger, Trigger::Reconcile(key) if key == SourceKey::new("team-a", "web"))
        );
        assert!(matches!(
            service_trigger(Some(WatchEvent::Resynced)),
            Trigger::Sweep
        ));
        assert!(matches!(service_trigger(None), Trigger::Shutdown));
    }

    #[test]
    fn test_slice_trigger_resolves_owner() {
        let slice = EndpointSlice {
            metadata: ObjectMeta {
                name: Some("web-1".into()),
                namespace: Some("team-a".into()),
                labels: Some(BTreeMap::from([(
                    SERVICE_OWNER_LABEL.to_string(),
                    "web".to_string(),
                )])),
                ..Default::default()
            },
            address_type: "IPv4".into(),
            endpoints: vec![],
            ports: None,
        };
        let trigger = slice_trigger(Some(WatchEvent::Applied(slice.clone())));
        assert!(
            matches!(trigger, Trigger::Reconcile(key) if key == SourceKey::new("team-a", "web"))
        );

        let mut unowned = slice;
        unowned.metadata.labels = None;
        assert!(matches!(
            slice_trigger(Some(WatchEvent::Applied(unowned))),
            Trigger::Skip
        ));

        // a slice deleted during a disconnect only surfaces through the
        // re-list, so it must trigger a full sweep
        assert!(matches!(
            slice_trigger(Some(WatchEvent::Resynced)),
            Trigger::Sweep
        ));
    }

    #[test]
    fn test_mirror_trigger_follows_back_reference() {
        let mirror = Service {
            metadata: ObjectMeta {
                name: Some("web-team-a-0000000000".into()),
                namespace: Some("default".into()),
                labels: Some(BTreeMap::from([
                    (SOURCE_NAMESPACE_LABEL.to_string(), "team-a".to_string()),
                    (SOURCE_NAME_LABEL.to_string(), "web".to_string()),
                ])),
                ..Default::default()
            },
            ..Default::default()
        };
        let trigger = mirror_trigger(Some(WatchEvent::Deleted(mirror.clone())));
        assert!(
            matches!(trigger, Trigger::Reconcile(key) if key == SourceKey::new("team-a", "web"))
        );

        let mut unlabeled = mirror;
        unlabeled.metadata.labels = None;
        assert!(matches!(
            mirror_trigger(Some(WatchEvent::Deleted(unlabeled))),
            Trigger::Skip
        ));

        assert!(matches!(
            mirror_trigger::<Service>(Some(WatchEvent::Resynced)),
            Trigger::Sweep
        ));
    }
}
