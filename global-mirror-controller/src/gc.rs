use std::time::Duration;

use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use k8s_openapi::chrono::Utc;
use kube::Api;
use kube::ResourceExt;
use kube::api::ObjectMeta;
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::controller::{delete_ignoring_missing, reconcile};
use crate::mirror::{SOURCE_SERVICE_LABEL, SourceKey, object_ref, source_ref};

/// Full convergence pass over both caches. Reconciles every cached source
/// (repairing missed events, failed writes and out-of-band edits) and then
/// collects mirrored objects whose back-reference no longer resolves.
/// Per-object failures are logged and do not stop the sweep.
pub(crate) async fn sweep(ctx: &Context) {
    debug!("starting mirror sweep");
    for service in ctx.services.state() {
        let Some(namespace) = service.namespace() else {
            continue;
        };
        let key = SourceKey::new(namespace, service.name_any());
        if let Err(e) = reconcile(ctx, &key, true).await {
            ctx.metrics.reconcile_failures.inc();
            warn!(%e, "sweep failed to reconcile {}", key);
        }
    }

    collect_orphaned_services(ctx).await;
    collect_orphaned_slices(ctx).await;
}

async fn collect_orphaned_services(ctx: &Context) {
    let api: Api<Service> = Api::namespaced(ctx.client.clone(), &ctx.settings.global_namespace);
    for mirror in ctx.mirror_services.state() {
        let name = mirror.name_any();
        let Some(key) = source_ref(mirror.labels()) else {
            warn!(
                "mirrored Service {}/{} has a malformed back-reference, skipping",
                ctx.settings.global_namespace, name
            );
            continue;
        };
        if source_live(ctx, &key) || within_grace(&mirror.metadata, ctx.settings.gc_grace) {
            continue;
        }
        match delete_ignoring_missing(&api, &name).await {
            Ok(()) => {
                ctx.metrics.mirrors_deleted.inc();
                info!(
                    "collected orphaned mirrored Service {}/{} for {}",
                    ctx.settings.global_namespace, name, key
                );
            }
            Err(e) => warn!(%e, "failed to collect mirrored Service {}", name),
        }
    }
}

async fn collect_orphaned_slices(ctx: &Context) {
    let api: Api<EndpointSlice> =
        Api::namespaced(ctx.client.clone(), &ctx.settings.global_namespace);
    for mirror in ctx.mirror_slices.state() {
        let name = mirror.name_any();
        let Some(slice_key) = source_ref(mirror.labels()) else {
            warn!(
                "mirrored EndpointSlice {}/{} has a malformed back-reference, skipping",
                ctx.settings.global_namespace, name
            );
            continue;
        };
        let owner = mirror
            .labels()
            .get(SOURCE_SERVICE_LABEL)
            .map(|service| SourceKey::new(slice_key.namespace.clone(), service));

        let slice_live = ctx.settings.namespace_allowed(&slice_key.namespace)
            && ctx.endpoint_slices.get(&object_ref(&slice_key)).is_some();
        let owner_live = owner.as_ref().is_some_and(|key| source_live(ctx, key));
        if (slice_live && owner_live) || within_grace(&mirror.metadata, ctx.settings.gc_grace) {
            continue;
        }
        match delete_ignoring_missing(&api, &name).await {
            Ok(()) => {
                ctx.metrics.mirrors_deleted.inc();
                info!(
                    "collected orphaned mirrored EndpointSlice {}/{} for {}",
                    ctx.settings.global_namespace, name, slice_key
                );
            }
            Err(e) => warn!(%e, "failed to collect mirrored EndpointSlice {}", name),
        }
    }
}

fn source_live(ctx: &Context, key: &SourceKey) -> bool {
    ctx.settings.namespace_allowed(&key.namespace) && ctx.services.get(&object_ref(key)).is_some()
}

/// Recently created mirrors are spared to avoid racing an in-flight
/// creation whose source has not reached the cache yet.
fn within_grace(meta: &ObjectMeta, grace: Duration) -> bool {
    let Some(created) = meta.creation_timestamp.as_ref() else {
        return false;
    };
    let age = Utc::now() - created.0;
    age.num_seconds() < grace.as_secs() as i64
}
