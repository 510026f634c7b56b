//! Event dispatch
//!
//! Wires control-plane watch streams to the reconciler handlers. One
//! handler runs at a time per stream; the three streams (claims, volumes,
//! storage classes) run concurrently against the shared reconciler.
//!
//! The watcher folds creation and update into a single `Applied` event, so
//! a last-seen map per stream discriminates the two. Retryable handler
//! errors are redelivered with exponential backoff; permanent errors are
//! logged and dropped.

use futures::{Future, StreamExt};
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::Api;
use kube::runtime::watcher::{self, Event};
use kube::{Client, ResourceExt};
use prometheus::IntCounterVec;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::error::{ErrorAction, Result};
use crate::provisioner::Provisioner;

/// Ceiling for redelivery of one event before it is dropped
const MAX_RETRY_ELAPSED: Duration = Duration::from_secs(300);

fn event_counter() -> &'static IntCounterVec {
    static COUNTER: OnceLock<IntCounterVec> = OnceLock::new();
    COUNTER.get_or_init(|| {
        prometheus::register_int_counter_vec!(
            "node_disk_events_total",
            "Events handled by the provisioner",
            &["resource", "outcome"]
        )
        .expect("event counter registration")
    })
}

/// Run the dispatch loops until the process is stopped.
pub async fn run(provisioner: Arc<Provisioner>, client: Client) -> Result<()> {
    let claims = watch_claims(provisioner.clone(), Api::all(client.clone()));
    let volumes = watch_volumes(provisioner.clone(), Api::all(client.clone()));
    let classes = watch_classes(provisioner, Api::all(client));

    tokio::join!(claims, volumes, classes);
    Ok(())
}

async fn watch_claims(provisioner: Arc<Provisioner>, api: Api<PersistentVolumeClaim>) {
    let mut known: HashMap<String, PersistentVolumeClaim> = HashMap::new();
    let stream = watcher::watcher(api, watcher::Config::default());
    futures::pin_mut!(stream);

    while let Some(item) = stream.next().await {
        match item {
            Ok(Event::Applied(claim)) => {
                let uid = claim.uid().unwrap_or_default();
                match known.insert(uid, claim.clone()) {
                    Some(old) => {
                        handle("claim", || provisioner.claim_updated(&old, &claim)).await
                    }
                    None => handle("claim", || provisioner.claim_created(&claim)).await,
                }
            }
            Ok(Event::Deleted(claim)) => {
                known.remove(&claim.uid().unwrap_or_default());
                handle("claim", || provisioner.claim_deleted(&claim)).await;
            }
            Ok(Event::Restarted(claims)) => {
                // Existing claims replay as creations; every creation path
                // is idempotent, so live volumes are left undisturbed.
                known.clear();
                for claim in claims {
                    known.insert(claim.uid().unwrap_or_default(), claim.clone());
                    handle("claim", || provisioner.claim_created(&claim)).await;
                }
            }
            Err(err) => warn!("Claim watch interrupted (will resume): {}", err),
        }
    }
}

async fn watch_volumes(provisioner: Arc<Provisioner>, api: Api<PersistentVolume>) {
    let stream = watcher::watcher(api, watcher::Config::default());
    futures::pin_mut!(stream);

    while let Some(item) = stream.next().await {
        match item {
            // Volume spec is immutable once published; only deletion and
            // restart-resume carry work.
            Ok(Event::Applied(_)) => {}
            Ok(Event::Deleted(pv)) => {
                handle("volume", || provisioner.volume_deleted(&pv)).await;
            }
            Ok(Event::Restarted(volumes)) => {
                for pv in volumes {
                    handle("volume", || provisioner.volume_resumed(&pv)).await;
                }
            }
            Err(err) => warn!("Volume watch interrupted (will resume): {}", err),
        }
    }
}

async fn watch_classes(provisioner: Arc<Provisioner>, api: Api<StorageClass>) {
    let stream = watcher::watcher(api, watcher::Config::default());
    futures::pin_mut!(stream);

    while let Some(item) = stream.next().await {
        match item {
            Ok(Event::Applied(class)) => {
                if class.provisioner == provisioner.provisioner_name() {
                    provisioner.storage_class_observed(&class);
                }
            }
            Ok(Event::Deleted(class)) => {
                debug!(
                    "Storage class {:?} deleted; registration kept for live volumes",
                    class.metadata.name
                );
            }
            Ok(Event::Restarted(classes)) => {
                for class in classes {
                    if class.provisioner == provisioner.provisioner_name() {
                        provisioner.storage_class_observed(&class);
                    }
                }
            }
            Err(err) => warn!("Storage class watch interrupted (will resume): {}", err),
        }
    }
}

/// Run one handler with the permanent-vs-retryable contract applied.
async fn handle<F, Fut>(resource: &'static str, operation: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let backoff = backoff::ExponentialBackoff {
        max_elapsed_time: Some(MAX_RETRY_ELAPSED),
        ..Default::default()
    };

    let result = backoff::future::retry(backoff, || async {
        operation().await.map_err(|err| match err.action() {
            ErrorAction::Retry => {
                warn!("Retryable {} handler failure: {}", resource, err);
                backoff::Error::transient(err)
            }
            ErrorAction::Fail => backoff::Error::permanent(err),
        })
    })
    .await;

    match result {
        Ok(()) => {
            event_counter().with_label_values(&[resource, "ok"]).inc();
        }
        Err(err) if matches!(err.action(), ErrorAction::Fail) => {
            event_counter()
                .with_label_values(&[resource, "permanent"])
                .inc();
            warn!("Permanent {} handler failure: {}", resource, err);
        }
        Err(err) => {
            event_counter()
                .with_label_values(&[resource, "exhausted"])
                .inc();
            error!(
                "Giving up on {} event after retries: {}",
                resource, err
            );
        }
    }
}
