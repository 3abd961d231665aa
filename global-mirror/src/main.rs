use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use global_mirror::{Error, Result, config::Args, http};
use global_mirror_controller::start_mirror_controller;
use kube::Client;
use kube::config::{Config, KubeConfigOptions, Kubeconfig};
use tokio::task::JoinError;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    setup_subscriber();

    let settings = match args.mirror_settings() {
        Ok(settings) => settings,
        Err(e) => {
            error!("invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    let client = match build_client(args.kubeconfig.as_deref()).await {
        Ok(client) => client,
        Err(e) => {
            error!("failed to build kubernetes client: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!("starting global service mirror");
    let cancel = tokio_util::sync::CancellationToken::new();
    let mut metrics_handle = tokio::spawn(http::serve_metrics(
        args.metrics_address,
        cancel.child_token(),
    ));
    let mirror_cancel = cancel.child_token();
    let mut mirror_handle = tokio::spawn(async move {
        start_mirror_controller(client, settings, mirror_cancel)
            .await
            .map_err(Error::from)
    });
    let mut shutdown_handle = tokio::spawn(async move { shutdown_signal().await });

    // watch for shutdown and errors; a task that stops on its own is fatal
    let failed = tokio::select! {
        h = &mut metrics_handle => {
            cancel.cancel();
            let mirror = mirror_handle.await;
            exit("metrics", h) | exit("mirror controller", mirror)
        }
        h = &mut mirror_handle => {
            cancel.cancel();
            let metrics = metrics_handle.await;
            exit("mirror controller", h) | exit("metrics", metrics)
        }
        _ = &mut shutdown_handle => {
            cancel.cancel();
            let (metrics, mirror) = tokio::join!(metrics_handle, mirror_handle);
            let metrics_failed = exit("metrics", metrics);
            let mirror_failed = exit("mirror controller", mirror);
            metrics_failed | mirror_failed
        }
    };
    info!("Exiting...");
    if failed {
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn setup_subscriber() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "global_mirror=info,global_mirror_controller=info,global_mirror_k8s_utils=info".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn build_client(kubeconfig: Option<&Path>) -> Result<Client> {
    match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)?;
            let config =
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;
            Ok(Client::try_from(config)?)
        }
        None => Ok(Client::try_default().await?),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };
    tokio::select! {
        _ = ctrl_c => {
            info!("captured ctrl_c signal");
        },
        _ = terminate => {},
    }
}

fn exit(task: &str, out: std::result::Result<Result<()>, JoinError>) -> bool {
    match out {
        Ok(Ok(_)) => {
            info!("{task} exited");
            false
        }
        Ok(Err(e)) => {
            error!("{task} failed with error: {e}");
            true
        }
        Err(e) => {
            error!("{task} task failed to complete: {e}");
            true
        }
    }
}
