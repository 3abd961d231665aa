use std::fmt::Debug;
use std::hash::Hash;
use std::pin::pin;

use futures::StreamExt;
use k8s_openapi::serde::de::DeserializeOwned;
use kube::runtime::reflector::{self, Store};
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Resource};
use thiserror::Error;
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, trace};

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to create store: {0}")]
    StoreCreation(String),

    #[error("kube error: {0}")]
    KubeError(#[from] kube::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// Condensed view of a watch stream. Individual objects delivered during a
/// (re)list are only applied to the local store; `Resynced` marks the end of
/// each completed list so consumers can run a full convergence pass instead
/// of replaying the initial burst object by object.
#[derive(Clone, Debug)]
pub enum WatchEvent<K> {
    Applied(K),
    Deleted(K),
    Resynced,
}

/// Starts a watch for one resource kind, reflecting it into a local store
/// and forwarding live events on a bounded channel.
///
/// Watch disconnects are retried internally with backoff and never surface
/// to the consumer. The spawned task ends when the token is cancelled or
/// the receiver is dropped.
pub fn watch_with_store<K>(
    api: Api<K>,
    config: watcher::Config,
    cancel: CancellationToken,
) -> (Store<K>, mpsc::Receiver<WatchEvent<K>>)
where
    K: Resource + Send + Sync + Clone + Debug + DeserializeOwned + 'static,
    <K as Resource>::DynamicType: Default + Eq + Hash + Clone + Send,
{
    let (reader, writer) = reflector::store();
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

    let task = async move {
        let mut stream = pin!(watcher(api, config).default_backoff().reflect(writer));
        loop {
            let event = select! {
                _ = cancel.cancelled() => break,
                event = stream.next() => event,
            };
            let forward = match event {
                Some(Ok(event)) => {
                    trace!("received event: {:?}", event);
                    match event {
                        watcher::Event::Apply(obj) => Some(WatchEvent::Applied(obj)),
                        watcher::Event::Delete(obj) => Some(WatchEvent::Deleted(obj)),
                        watcher::Event::InitDone => Some(WatchEvent::Resynced),
                        watcher::Event::Init | watcher::Event::InitApply(_) => None,
                    }
                }
                Some(Err(e)) => {
                    error!(%e, "unexpected error with stream");
                    None
                }
                None => break,
            };
            if let Some(event) = forward {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        }
    };
    tokio::spawn(task);
    (reader, rx)
}

/// Resolves once the store has absorbed its initial list.
pub async fn store_ready<K>(store: &Store<K>) -> Result<()>
where
    K: Resource + Clone + 'static,
    <K as Resource>::DynamicType: Eq + Hash + Clone,
{
    store
        .wait_until_ready()
        .await
        .map_err(|e| Error::StoreCreation(e.to_string()))
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;
    use kube::runtime::reflector::store;

    use super::*;

    fn make_configmap(name: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("default".into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_store_ready_after_initial_list() {
        let (reader, mut writer) = store::<ConfigMap>();
        writer.apply_watcher_event(&watcher::Event::Init);
        writer.apply_watcher_event(&watcher::Event::InitApply(make_configmap("a")));
        writer.apply_watcher_event(&watcher::Event::InitDone);

        tokio::time::timeout(Duration::from_secs(1), store_ready(&reader))
            .await
            .expect("readiness")
            .expect("store ready");
        assert_eq!(reader.state().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_not_ready_before_initial_list() {
        let (reader, _writer) = store::<ConfigMap>();

        let waited = tokio::time::timeout(Duration::from_secs(30), store_ready(&reader)).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn test_store_ready_fails_when_writer_dropped() {
        let (reader, writer) = store::<ConfigMap>();
        drop(writer);

        let ready = store_ready(&reader).await;
        assert!(matches!(ready, Err(Error::StoreCreation(_))));
    }
}
