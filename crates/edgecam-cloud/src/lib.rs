//! Cloud-facing seams: blob publication and the device message channel.

pub mod blob;
pub mod iothub;
mod signing;

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use edgecam_types::{
    events::{CloudMessage, InboundEvent},
    twin::ReportedState,
    EdgecamError, Result,
};
use futures::{stream::BoxStream, Stream, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::{BroadcastStream, UnboundedReceiverStream};
use tracing::{debug, info};

pub use blob::AzureBlobPublisher;
pub use iothub::{DeviceCredentials, IotHubClient, RetryPolicy};
pub use signing::sas_token;

/// Destination for the latest annotated image.
#[async_trait]
pub trait BlobPublisher: Send + Sync {
    /// Upload the file at `path`, replacing whatever the remote blob held.
    async fn upload(&self, path: &Path) -> Result<()>;
    /// Where the uploaded image can be fetched from.
    fn public_url(&self) -> &str;
}

/// Bidirectional link to the cloud broker.
#[async_trait]
pub trait MessageClient: Send + Sync {
    fn subscribe(&self) -> BoxStream<'static, InboundEvent>;
    async fn ack(&self, message: &CloudMessage) -> Result<()>;
    /// Returns the request id the broker will echo in its acknowledgement.
    async fn send_reported_state(&self, state: &ReportedState) -> Result<String>;
}

/// Publisher that keeps uploads in memory.
#[derive(Clone, Default)]
pub struct MemoryPublisher {
    uploads: Arc<Mutex<Vec<(PathBuf, Vec<u8>)>>>,
    failing: Arc<AtomicBool>,
    public_url: String,
}

impl MemoryPublisher {
    pub fn new(public_url: impl Into<String>) -> Self {
        Self {
            public_url: public_url.into(),
            ..Self::default()
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.lock().map(|u| u.len()).unwrap_or_default()
    }

    pub fn last_upload(&self) -> Option<Vec<u8>> {
        self.uploads
            .lock()
            .ok()
            .and_then(|u| u.last().map(|(_, bytes)| bytes.clone()))
    }
}

#[async_trait]
impl BlobPublisher for MemoryPublisher {
    async fn upload(&self, path: &Path) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(upload_error("memory publisher set to fail"));
        }
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|err| upload_error(format!("cannot read {}: {err}", path.display())))?;
        debug!(bytes = bytes.len(), "Stored upload in memory");
        if let Ok(mut guard) = self.uploads.lock() {
            guard.push((path.to_path_buf(), bytes));
        }
        Ok(())
    }

    fn public_url(&self) -> &str {
        &self.public_url
    }
}

/// In-process message client backed by a broadcast channel.
#[derive(Clone)]
pub struct ChannelMessageClient {
    tx: broadcast::Sender<InboundEvent>,
    acked: Arc<Mutex<Vec<CloudMessage>>>,
    reported: Arc<Mutex<Vec<ReportedState>>>,
}

impl ChannelMessageClient {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            acked: Arc::default(),
            reported: Arc::default(),
        }
    }

    /// Inject an event as if the broker had delivered it.
    pub fn push(&self, event: InboundEvent) {
        if self.tx.send(event).is_err() {
            debug!("No subscriber for injected event");
        }
    }

    pub fn acked(&self) -> Vec<CloudMessage> {
        self.acked.lock().map(|a| a.clone()).unwrap_or_default()
    }

    pub fn reported(&self) -> Vec<ReportedState> {
        self.reported.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl MessageClient for ChannelMessageClient {
    fn subscribe(&self) -> BoxStream<'static, InboundEvent> {
        BroadcastStream::new(self.tx.subscribe())
            .filter_map(|event| async move { event.ok() })
            .boxed()
    }

    async fn ack(&self, message: &CloudMessage) -> Result<()> {
        if let Ok(mut guard) = self.acked.lock() {
            guard.push(message.clone());
        }
        Ok(())
    }

    async fn send_reported_state(&self, state: &ReportedState) -> Result<String> {
        info!(timezone = state.timezone, "Reported state recorded locally");
        let mut guard = self
            .reported
            .lock()
            .map_err(|_| network_error("reported state lock poisoned"))?;
        guard.push(state.clone());
        Ok(format!("local-{}", guard.len()))
    }
}

/// Drive `source` on its own task and hand its items over a channel.
///
/// The source keeps being polled while the consumer is busy, which keeps
/// transport housekeeping (keep-alives, acks, reconnects) running during long
/// handlers. The task stops once the source ends or the receiver is dropped.
pub fn detach<S>(source: S) -> BoxStream<'static, S::Item>
where
    S: Stream + Send + 'static,
    S::Item: Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut source = Box::pin(source);
        while let Some(item) = source.next().await {
            if tx.send(item).is_err() {
                debug!("Event consumer gone; stopping source");
                break;
            }
        }
    });
    UnboundedReceiverStream::new(rx).boxed()
}

pub fn upload_error(message: impl Into<String>) -> EdgecamError {
    EdgecamError::Upload(message.into())
}

pub fn network_error(message: impl Into<String>) -> EdgecamError {
    EdgecamError::Network(message.into())
}
