use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::ResourceExt;
use kube::api::ObjectMeta;
use kube::runtime::reflector::Store;
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Marks an object in the global namespace as engine owned.
pub const MIRROR_LABEL: &str = "mirror.homelab.dev/mirrored";
pub const SOURCE_KIND_LABEL: &str = "mirror.homelab.dev/source-kind";
pub const SOURCE_NAMESPACE_LABEL: &str = "mirror.homelab.dev/source-namespace";
pub const SOURCE_NAME_LABEL: &str = "mirror.homelab.dev/source-name";
/// On mirrored EndpointSlices, the origin Service they belong to.
pub(crate) const SOURCE_SERVICE_LABEL: &str = "mirror.homelab.dev/source-service";
pub(crate) const SOURCE_RESOURCE_VERSION_ANNOTATION: &str =
    "mirror.homelab.dev/source-resource-version";
pub(crate) const SERVICE_OWNER_LABEL: &str = "kubernetes.io/service-name";

const MAX_NAME_LEN: usize = 63;
const NAME_HASH_LEN: usize = 10;

/// Identity of a source object, `(namespace, name)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SourceKey {
    pub namespace: String,
    pub name: String,
}

impl SourceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Destination name for a source object.
///
/// `{name}-{namespace}-{hash}` where the hash covers `namespace/name`.
/// Namespaces and names cannot contain `/`, so the hashed form is
/// unambiguous and two distinct sources only share a name on a digest
/// collision, which the engine detects and refuses to overwrite. The
/// readable prefix is truncated to stay inside the DNS label limit.
pub(crate) fn mirror_name(key: &SourceKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.namespace.as_bytes());
    hasher.update(b"/");
    hasher.update(key.name.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    let hash = &digest[..NAME_HASH_LEN];

    let mut prefix = format!("{}-{}", key.name, key.namespace);
    prefix.truncate(MAX_NAME_LEN - NAME_HASH_LEN - 1);
    let prefix = prefix.trim_end_matches('-');
    format!("{prefix}-{hash}")
}

/// Reads the back-reference off a mirrored object's labels.
pub(crate) fn source_ref(labels: &BTreeMap<String, String>) -> Option<SourceKey> {
    let namespace = labels.get(SOURCE_NAMESPACE_LABEL)?;
    let name = labels.get(SOURCE_NAME_LABEL)?;
    Some(SourceKey::new(namespace, name))
}

/// Origin Service owning an EndpointSlice, resolved from the well-known
/// service-name label.
pub(crate) fn owning_service(slice: &EndpointSlice) -> Option<SourceKey> {
    let namespace = slice.namespace()?;
    let name = slice.labels().get(SERVICE_OWNER_LABEL)?;
    Some(SourceKey::new(namespace, name))
}

/// True when the cached mirror was built from this source revision.
pub(crate) fn up_to_date<K: ResourceExt>(cached: &K, source_revision: Option<&str>) -> bool {
    match source_revision {
        Some(revision) => {
            cached.annotations().get(SOURCE_RESOURCE_VERSION_ANNOTATION)
                == Some(&revision.to_string())
        }
        None => false,
    }
}

fn back_reference(
    source: &impl ResourceExt,
    kind: &str,
    key: &SourceKey,
) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
    let mut labels = source.labels().clone();
    labels.insert(MIRROR_LABEL.into(), "true".into());
    labels.insert(SOURCE_KIND_LABEL.into(), kind.into());
    labels.insert(SOURCE_NAMESPACE_LABEL.into(), key.namespace.clone());
    labels.insert(SOURCE_NAME_LABEL.into(), key.name.clone());

    let mut annotations = BTreeMap::new();
    annotations.insert(
        SOURCE_RESOURCE_VERSION_ANNOTATION.into(),
        source.resource_version().unwrap_or_default(),
    );
    (labels, annotations)
}

/// Builds the mirrored copy of a source Service.
///
/// Cluster-assigned and origin-scoped fields are cleared: endpoints are
/// mirrored explicitly, so the destination control plane must not assign
/// addresses or manage endpoints for the copy.
pub(crate) fn mirrored_service(source: &Service, key: &SourceKey, global_namespace: &str) -> Service {
    let (labels, annotations) = back_reference(source, "Service", key);

    let mut spec = source.spec.clone().unwrap_or_default();
    spec.selector = None;
    spec.cluster_ip = None;
    spec.cluster_ips = None;
    if let Some(ports) = spec.ports.as_mut() {
        for port in ports {
            port.node_port = None;
        }
    }

    Service {
        metadata: ObjectMeta {
            name: Some(mirror_name(key)),
            namespace: Some(global_namespace.into()),
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(spec),
        status: None,
    }
}

/// Builds the mirrored copy of one source EndpointSlice, rehomed under the
/// mirrored Service's name.
pub(crate) fn mirrored_slice(
    source: &EndpointSlice,
    service_key: &SourceKey,
    mirror_service_name: &str,
    global_namespace: &str,
) -> Result<EndpointSlice> {
    let namespace = source
        .namespace()
        .ok_or(Error::MissingMetadata("EndpointSlice namespace"))?;
    let slice_key = SourceKey::new(namespace, source.name_any());

    let (mut labels, annotations) = back_reference(source, "EndpointSlice", &slice_key);
    labels.insert(SOURCE_SERVICE_LABEL.into(), service_key.name.clone());
    labels.insert(SERVICE_OWNER_LABEL.into(), mirror_service_name.into());

    Ok(EndpointSlice {
        metadata: ObjectMeta {
            name: Some(mirror_name(&slice_key)),
            namespace: Some(global_namespace.into()),
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        address_type: source.address_type.clone(),
        endpoints: source.endpoints.clone(),
        ports: source.ports.clone(),
    })
}

/// Source EndpointSlices owned by a Service, from the local cache.
pub(crate) fn slices_for_service(
    store: &Store<EndpointSlice>,
    key: &SourceKey,
) -> Vec<Arc<EndpointSlice>> {
    store
        .state()
        .into_iter()
        .filter(|slice| {
            slice.namespace().as_deref() == Some(key.namespace.as_str())
                && slice.labels().get(SERVICE_OWNER_LABEL) == Some(&key.name)
        })
        .collect()
}

/// Mirrored EndpointSlices derived from a source Service, from the mirror
/// namespace cache.
pub(crate) fn mirrored_slices_for_source(
    store: &Store<EndpointSlice>,
    key: &SourceKey,
) -> Vec<Arc<EndpointSlice>> {
    store
        .state()
        .into_iter()
        .filter(|slice| {
            slice.labels().get(SOURCE_SERVICE_LABEL) == Some(&key.name)
                && slice.labels().get(SOURCE_NAMESPACE_LABEL) == Some(&key.namespace)
        })
        .collect()
}

/// Desired state for one source identity: the mirrored Service plus one
/// mirrored slice per cached source slice. `None` means no mirror should
/// exist. Depends only on the caches, so replaying any event history
/// converges to the same result.
pub(crate) fn desired_mirrors(
    services: &Store<Service>,
    endpoint_slices: &Store<EndpointSlice>,
    key: &SourceKey,
    global_namespace: &str,
) -> Result<Option<(Service, Vec<EndpointSlice>)>> {
    let Some(source) = services.get(&object_ref(key)) else {
        return Ok(None);
    };

    let service = mirrored_service(&source, key, global_namespace);
    let mirror_service_name = service.name_any();

    let mut slices = Vec::new();
    for slice in slices_for_service(endpoint_slices, key) {
        slices.push(mirrored_slice(
            &slice,
            key,
            &mirror_service_name,
            global_namespace,
        )?);
    }
    Ok(Some((service, slices)))
}

pub(crate) fn object_ref<K>(key: &SourceKey) -> kube::runtime::reflector::ObjectRef<K>
where
    K: kube::Resource<DynamicType = ()>,
{
    kube::runtime::reflector::ObjectRef::new(&key.name).within(&key.namespace)
}
