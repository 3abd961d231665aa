use std::sync::{LazyLock, RwLock};

use prometheus_client::metrics::counter::Counter;
use prometheus_client::registry::Registry;

pub static REGISTRY: LazyLock<RwLock<Registry>> =
    LazyLock::new(|| RwLock::new(Registry::with_prefix("global_mirror")));

#[derive(Clone, Default)]
pub(crate) struct ControllerMetrics {
    pub services_applied: Counter,
    pub slices_applied: Counter,
    pub mirrors_deleted: Counter,
    pub reconcile_failures: Counter,
    pub name_collisions: Counter,
}

impl ControllerMetrics {
    pub fn new() -> Self {
        let metrics = Self::default();
        let mut registry = REGISTRY.write().expect("metrics registry lock poisoned");
        registry.register(
            "mirrored_services_applied",
            "Mirrored Services created or updated",
            metrics.services_applied.clone(),
        );
        registry.register(
            "mirrored_endpoint_slices_applied",
            "Mirrored EndpointSlices created or updated",
            metrics.slices_applied.clone(),
        );
        registry.register(
            "mirrors_deleted",
            "Mirrored objects deleted",
            metrics.mirrors_deleted.clone(),
        );
        registry.register(
            "reconcile_failures",
            "Reconcile attempts that failed",
            metrics.reconcile_failures.clone(),
        );
        registry.register(
            "name_collisions_skipped",
            "Sources skipped because their mirror name is taken",
            metrics.name_collisions.clone(),
        );
        metrics
    }
}
