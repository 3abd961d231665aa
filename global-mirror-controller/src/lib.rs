mod context;
mod controller;
mod error;
mod gc;
mod metrics;
mod mirror;
mod runtime;
mod settings;
#[cfg(test)]
mod testing;

pub use error::Error;
pub use metrics::REGISTRY;
pub use mirror::{MIRROR_LABEL, SOURCE_NAME_LABEL, SOURCE_NAMESPACE_LABEL, SourceKey};
pub use runtime::start_mirror_controller;
pub use settings::MirrorSettings;

pub type Result<T> = std::result::Result<T, Error>;
