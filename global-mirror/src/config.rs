use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use global_mirror_controller::MirrorSettings;

/// Mirrors exported Services and their EndpointSlices into a single global
/// namespace.
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Namespace that receives the mirrored objects
    #[arg(long, env = "GLOBAL_NAMESPACE", default_value = "default")]
    pub global_namespace: String,

    /// Label selector matching the Services and EndpointSlices to mirror
    #[arg(long, env = "MIRROR_SELECTOR", default_value = "mirror.homelab.dev/export=true")]
    pub selector: String,

    /// Restrict sources to a namespace (repeatable, default all namespaces)
    #[arg(long = "source-namespace")]
    pub source_namespaces: Vec<String>,

    /// Path to a kubeconfig file, defaults to in-cluster discovery
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// Metrics listener address
    #[arg(long, default_value = "0.0.0.0:9090")]
    pub metrics_address: SocketAddr,

    /// Seconds to wait for the initial cache sync before giving up
    #[arg(long, default_value_t = 30)]
    pub sync_timeout: u64,

    /// Seconds between drift-repair sweeps of the global namespace
    #[arg(long, default_value_t = 60)]
    pub gc_interval: u64,

    /// Seconds an orphaned mirror is spared before collection
    #[arg(long, default_value_t = 30)]
    pub gc_grace: u64,
}

impl Args {
    pub fn mirror_settings(&self) -> global_mirror_controller::Result<MirrorSettings> {
        MirrorSettings::new(
            &self.global_namespace,
            &self.selector,
            &self.source_namespaces,
            Duration::from_secs(self.sync_timeout),
            Duration::from_secs(self.gc_interval),
            Duration::from_secs(self.gc_grace),
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults_build_settings() {
        let args = Args::parse_from(["global-mirror"]);
        let settings = args.mirror_settings().expect("settings");
        assert_eq!(settings.global_namespace, "default");
        assert_eq!(settings.source_namespaces, None);
        assert_eq!(settings.sync_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_source_namespace_restriction() {
        let args = Args::parse_from([
            "global-mirror",
            "--global-namespace",
            "mirrors",
            "--source-namespace",
            "team-a",
            "--source-namespace",
            "team-b",
        ]);
        let settings = args.mirror_settings().expect("settings");
        let namespaces = settings.source_namespaces.expect("restricted");
        assert!(namespaces.contains("team-a"));
        assert!(namespaces.contains("team-b"));
        assert_eq!(namespaces.len(), 2);
    }

    #[test]
    fn test_invalid_selector_is_rejected() {
        let args = Args::parse_from(["global-mirror", "--selector", ""]);
        assert!(args.mirror_settings().is_err());
    }
}
