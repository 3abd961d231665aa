use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("kube error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("utils error: {0}")]
    UtilsError(#[from] global_mirror_k8s_utils::Error),

    #[error("timed out waiting for caches to sync")]
    SyncTimeout,

    #[error("cancelled before caches finished syncing")]
    SyncCancelled,

    #[error("invalid selector expression: {0}")]
    InvalidSelector(String),

    #[error("object is missing {0}")]
    MissingMetadata(&'static str),
}
