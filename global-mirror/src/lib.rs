pub mod config;
pub mod http;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("kube error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("kubeconfig error: {0}")]
    KubeconfigError(#[from] kube::config::KubeconfigError),

    #[error("controller error: {0}")]
    ControllerError(#[from] global_mirror_controller::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
