use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::Client;
use kube::runtime::reflector::Store;

use crate::metrics::ControllerMetrics;
use crate::settings::MirrorSettings;

pub(crate) struct Context {
    pub client: Client,
    pub settings: MirrorSettings,
    pub metrics: ControllerMetrics,
    /// Selector-matching source objects, cluster wide.
    pub services: Store<Service>,
    pub endpoint_slices: Store<EndpointSlice>,
    /// Engine-owned objects in the global namespace.
    pub mirror_services: Store<Service>,
    pub mirror_slices: Store<EndpointSlice>,
}
