use std::collections::HashSet;
use std::fmt::Debug;

use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use k8s_openapi::serde::de::DeserializeOwned;
use kube::api::{DeleteParams, Patch, PatchParams};
use kube::{Api, ResourceExt};
use tracing::{debug, info, warn};

use crate::Result;
use crate::context::Context;
use crate::mirror::{
    SourceKey, desired_mirrors, mirror_name, mirrored_slices_for_source, object_ref, source_ref,
    up_to_date,
};

const MANAGER: &str = "global-mirror-controller";

/// Brings the global namespace in line with one source identity. Pure
/// function of the caches: the source being present (and from an allowed
/// namespace) means its mirror is applied, anything else means the mirror
/// is removed. `repair` bypasses the revision short-circuit so sweeps also
/// correct out-of-band edits to mirrored objects.
pub(crate) async fn reconcile(ctx: &Context, key: &SourceKey, repair: bool) -> Result<()> {
    if !ctx.settings.namespace_allowed(&key.namespace) {
        return remove_mirror(ctx, key).await;
    }
    let desired = desired_mirrors(
        &ctx.services,
        &ctx.endpoint_slices,
        key,
        &ctx.settings.global_namespace,
    )?;
    match desired {
        Some((service, slices)) => apply_mirror(ctx, key, service, slices, repair).await,
        None => remove_mirror(ctx, key).await,
    }
}

async fn apply_mirror(
    ctx: &Context,
    key: &SourceKey,
    service: Service,
    slices: Vec<EndpointSlice>,
    repair: bool,
) -> Result<()> {
    let global_namespace = &ctx.settings.global_namespace;
    let name = service.name_any();
    let mirror_key = SourceKey::new(global_namespace.clone(), name.clone());

    if let Some(existing) = ctx.mirror_services.get(&object_ref(&mirror_key)) {
        match source_ref(existing.labels()) {
            Some(owner) if owner != *key => {
                // first writer wins, never overwrite the earlier source
                warn!(
                    "mirror name {} for {} already owned by {}, skipping",
                    name, key, owner
                );
                ctx.metrics.name_collisions.inc();
                return Ok(());
            }
            _ => {}
        }
    }

    let services: Api<Service> = Api::namespaced(ctx.client.clone(), global_namespace);
    let slice_api: Api<EndpointSlice> = Api::namespaced(ctx.client.clone(), global_namespace);
    let params = PatchParams::apply(MANAGER).force();

    let source_revision = service
        .annotations()
        .get(crate::mirror::SOURCE_RESOURCE_VERSION_ANNOTATION)
        .cloned();
    let cached = ctx.mirror_services.get(&object_ref(&mirror_key));
    let current =
        !repair && cached.is_some_and(|m| up_to_date(m.as_ref(), source_revision.as_deref()));
    if current {
        debug!("mirrored Service {}/{} for {} is current", global_namespace, name, key);
    } else {
        services.patch(&name, &params, &Patch::Apply(&service)).await?;
        ctx.metrics.services_applied.inc();
        info!("applied mirrored Service {}/{} for {}", global_namespace, name, key);
    }

    let mut desired_names = HashSet::new();
    for slice in slices {
        let slice_name = slice.name_any();
        desired_names.insert(slice_name.clone());

        let slice_revision = slice
            .annotations()
            .get(crate::mirror::SOURCE_RESOURCE_VERSION_ANNOTATION)
            .cloned();
        let slice_key = SourceKey::new(global_namespace.clone(), slice_name.clone());
        let cached = ctx.mirror_slices.get(&object_ref(&slice_key));
        if !repair && cached.is_some_and(|m| up_to_date(m.as_ref(), slice_revision.as_deref())) {
            continue;
        }
        slice_api
            .patch(&slice_name, &params, &Patch::Apply(&slice))
            .await?;
        ctx.metrics.slices_applied.inc();
        info!(
            "applied mirrored EndpointSlice {}/{} for {}",
            global_namespace, slice_name, key
        );
    }

    // a source slice that disappeared shrinks the desired set; the mirrored
    // Service itself is only removed when the source Service goes away
    for stale in mirrored_slices_for_source(&ctx.mirror_slices, key) {
        let stale_name = stale.name_any();
        if desired_names.contains(&stale_name) {
            continue;
        }
        delete_ignoring_missing(&slice_api, &stale_name).await?;
        ctx.metrics.mirrors_deleted.inc();
        info!(
            "deleted mirrored EndpointSlice {}/{} for {}",
            global_namespace, stale_name, key
        );
    }
    Ok(())
}

/// Removes the mirrored Service and every slice derived from this source.
/// Source deletion and selector-match loss both land here; the watcher
/// reports either one as the object vanishing from the cache.
async fn remove_mirror(ctx: &Context, key: &SourceKey) -> Result<()> {
    let global_namespace = &ctx.settings.global_namespace;
    let name = mirror_name(key);
    let mirror_key = SourceKey::new(global_namespace.clone(), name.clone());

    if let Some(existing) = ctx.mirror_services.get(&object_ref(&mirror_key)) {
        match source_ref(existing.labels()) {
            Some(owner) if owner != *key => {
                // the name belongs to a colliding source, leave it alone
                warn!(
                    "not deleting mirror {} for {}: owned by {}",
                    name, key, owner
                );
            }
            _ => {
                let services: Api<Service> = Api::namespaced(ctx.client.clone(), global_namespace);
                delete_ignoring_missing(&services, &name).await?;
                ctx.metrics.mirrors_deleted.inc();
                info!("deleted mirrored Service {}/{} for {}", global_namespace, name, key);
            }
        }
    }

    let slice_api: Api<EndpointSlice> = Api::namespaced(ctx.client.clone(), global_namespace);
    for stale in mirrored_slices_for_source(&ctx.mirror_slices, key) {
        let stale_name = stale.name_any();
        delete_ignoring_missing(&slice_api, &stale_name).await?;
        ctx.metrics.mirrors_deleted.inc();
        info!(
            "deleted mirrored EndpointSlice {}/{} for {}",
            global_namespace, stale_name, key
        );
    }
    Ok(())
}

pub(crate) async fn delete_ignoring_missing<K>(api: &Api<K>, name: &str) -> Result<()>
where
    K: Clone + DeserializeOwned + Debug,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}
