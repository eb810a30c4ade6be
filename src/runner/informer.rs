use crate::k8s_types::{self, K8sType};
use crate::resource::{InvalidResourceError, K8sResource};
use crate::runner::guard::ScaleGuard;
use crate::runner::metrics::GuardMetrics;
use crate::store::{ApiError, ResourceStore, StoreError, WatchEvent};

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures::StreamExt;
use tokio::sync::mpsc::{self, error::SendError, Receiver, Sender};
use tokio::task::JoinHandle;

use std::fmt::{self, Display};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const EVENT_QUEUE_CAPACITY: usize = 256;

/// A handle to a running scale guard. Dropping it stops both the watch and the dispatcher.
pub struct GuardHandle {
    running: Arc<AtomicBool>,
    producer: JoinHandle<()>,
    consumer: JoinHandle<()>,
}

impl std::ops::Drop for GuardHandle {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        self.producer.abort();
        self.consumer.abort();
    }
}

impl GuardHandle {
    pub fn is_active(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
enum WatcherError {
    ChannelClosed,
    Store(StoreError),
}

impl Display for WatcherError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WatcherError::ChannelClosed => f.write_str("Event channel closed"),
            WatcherError::Store(err) => write!(f, "Store error: {}", err),
        }
    }
}

impl std::error::Error for WatcherError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WatcherError::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl WatcherError {
    fn is_resource_version_expired(&self) -> bool {
        matches!(self, WatcherError::Store(StoreError::Expired))
    }
}

impl From<StoreError> for WatcherError {
    fn from(err: StoreError) -> WatcherError {
        WatcherError::Store(err)
    }
}

impl From<ApiError> for WatcherError {
    fn from(err: ApiError) -> WatcherError {
        if err.code == 410 {
            WatcherError::Store(StoreError::Expired)
        } else {
            WatcherError::Store(StoreError::Upstream(err.to_string()))
        }
    }
}

impl From<InvalidResourceError> for WatcherError {
    fn from(err: InvalidResourceError) -> WatcherError {
        WatcherError::Store(StoreError::Upstream(err.to_string()))
    }
}

impl<T> From<SendError<T>> for WatcherError {
    fn from(_: SendError<T>) -> WatcherError {
        WatcherError::ChannelClosed
    }
}

fn watch_backoff() -> ExponentialBackoff {
    let mut backoff = ExponentialBackoff {
        initial_interval: Duration::from_millis(500),
        max_interval: Duration::from_secs(30),
        max_elapsed_time: None,
        ..Default::default()
    };
    backoff.reset();
    backoff
}

/// Starts the scale guard on the current tokio runtime.
///
/// A producer task lists every StatefulSet in `namespace` (all namespaces if `None`) and then
/// watches for changes, queueing each added or modified workload. A single consumer task
/// hands the queued workloads to `guard` one at a time, in the order they were observed.
pub fn start_scale_guard<S: ResourceStore + 'static>(
    store: Arc<S>,
    namespace: Option<String>,
    guard: ScaleGuard<S>,
    metrics: GuardMetrics,
) -> GuardHandle {
    let running = Arc::new(AtomicBool::new(true));
    let (sender, receiver) = mpsc::channel(EVENT_QUEUE_CAPACITY);

    let watcher = WorkloadWatcher {
        store,
        k8s_type: k8s_types::apps::v1::StatefulSet,
        namespace,
        sender,
        metrics: metrics.clone(),
        running: running.clone(),
        backoff: watch_backoff(),
    };
    let producer = tokio::spawn(async move {
        watcher.run().await;
    });
    let consumer = tokio::spawn(dispatch(receiver, guard, metrics, running.clone()));

    GuardHandle {
        running,
        producer,
        consumer,
    }
}

async fn dispatch<S: ResourceStore>(
    mut receiver: Receiver<K8sResource>,
    guard: ScaleGuard<S>,
    metrics: GuardMetrics,
    running: Arc<AtomicBool>,
) {
    while let Some(resource) = receiver.recv().await {
        if !running.load(Ordering::Relaxed) {
            break;
        }
        if guard.observe(resource).await.is_err() {
            metrics.error();
        }
    }
    log::info!("Scale guard dispatcher stopped");
}

struct WorkloadWatcher<S: ResourceStore> {
    store: Arc<S>,
    k8s_type: &'static K8sType,
    namespace: Option<String>,
    sender: Sender<K8sResource>,
    metrics: GuardMetrics,
    running: Arc<AtomicBool>,
    backoff: ExponentialBackoff,
}

impl<S: ResourceStore> WorkloadWatcher<S> {
    async fn run(mut self) {
        log::debug!(
            "Starting scale guard for {} in namespace: {:?}",
            self.k8s_type,
            self.namespace
        );

        while self.running.load(Ordering::Relaxed) {
            let result = match self.sweep().await {
                Ok(resource_version) => self.watch_from(resource_version).await,
                Err(err) => Err(err),
            };
            if let Err(err) = result {
                if !self.handle_error(err).await {
                    break;
                }
            }
        }
        log::info!("Ending scale guard watch of {}", self.k8s_type);
    }

    /// Returns false when the watcher should stop
    async fn handle_error(&mut self, error: WatcherError) -> bool {
        match error {
            WatcherError::ChannelClosed => {
                log::info!("Scale guard dispatcher has stopped, stopping watch");
                false
            }
            ref err if err.is_resource_version_expired() => {
                log::warn!("ResourceVersion is too old for {}, re-listing", self.k8s_type);
                true
            }
            err => {
                self.metrics.error();
                let delay = self
                    .backoff
                    .next_backoff()
                    .unwrap_or(self.backoff.max_interval);
                log::error!(
                    "Error watching {}, retrying in {}ms: {}",
                    self.k8s_type,
                    delay.as_millis(),
                    err
                );
                tokio::time::sleep(delay).await;
                true
            }
        }
    }

    /// Queues every existing workload, so that drift from while the process was down gets
    /// corrected. Returns the list's resource version to watch from.
    async fn sweep(&mut self) -> Result<Option<String>, WatcherError> {
        log::info!(
            "Listing {} in namespace: {:?}",
            self.k8s_type,
            self.namespace
        );
        self.metrics.request_started();
        let list = self
            .store
            .list(self.k8s_type, self.namespace.as_deref(), None)
            .await?;
        self.metrics.set_workload_count(list.items.len());

        for item in list.items {
            self.metrics.event_received();
            match K8sResource::from_value(item) {
                Ok(resource) => self.sender.send(resource).await?,
                Err(err) => log::warn!("Skipping invalid {}: {}", self.k8s_type, err),
            }
        }
        Ok(list.metadata.resource_version)
    }

    async fn watch_from(&mut self, mut resource_version: Option<String>) -> Result<(), WatcherError> {
        while self.running.load(Ordering::Relaxed) {
            log::debug!(
                "Starting watch of {} with resourceVersion: {:?}",
                self.k8s_type,
                resource_version
            );
            self.metrics.request_started();
            let mut events = self
                .store
                .watch(
                    self.k8s_type,
                    self.namespace.as_deref(),
                    resource_version.as_deref(),
                    None,
                )
                .await?;

            while let Some(event) = events.next().await {
                self.metrics.event_received();
                if let Some(version) = self.handle_event(event?).await? {
                    resource_version = Some(version);
                }
                self.backoff.reset();
            }
            log::debug!("Watch of {} ended, restarting", self.k8s_type);
        }
        Ok(())
    }

    async fn handle_event(&mut self, event: WatchEvent) -> Result<Option<String>, WatcherError> {
        let object = match event {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) => obj,
            WatchEvent::Deleted(obj) => {
                let resource = K8sResource::from_value(obj)?;
                return Ok(Some(resource.resource_version().to_owned()));
            }
            WatchEvent::Error(err) => {
                log::warn!("Got api error for watch on {}: {}", self.k8s_type, err);
                return Err(err.into());
            }
        };
        let resource = K8sResource::from_value(object)?;
        let resource_version = resource.resource_version().to_owned();
        self.sender.send(resource).await?;
        Ok(Some(resource_version))
    }
}
