//! Command dispatch between the inbound surfaces and the camera/blob backends.

use std::sync::Arc;

use async_trait::async_trait;
use edgecam_cloud::{BlobPublisher, MessageClient};
use edgecam_controller::CameraController;
use edgecam_types::{
    events::{CloudMessage, InboundEvent, ReportedStateAck},
    twin::{desired_timezone, ReportedState, TwinUpdate},
    vision::AnnotatedImage,
    Result,
};
use futures::StreamExt;
use tracing::{debug, error, info, warn};

/// Payload of the only cloud-to-device message that triggers work.
pub const PICTURE_COMMAND: &[u8] = b"picture";

#[derive(Debug)]
pub enum MessageOutcome {
    Published(AnnotatedImage),
    Ignored,
}

/// Maps HTTP requests and broker events onto camera and blob actions.
pub struct CommandDispatcher {
    camera: Arc<CameraController>,
    publisher: Arc<dyn BlobPublisher>,
}

impl CommandDispatcher {
    pub fn new(camera: Arc<CameraController>, publisher: Arc<dyn BlobPublisher>) -> Self {
        Self { camera, publisher }
    }

    pub fn camera(&self) -> &CameraController {
        &self.camera
    }

    pub fn public_url(&self) -> &str {
        self.publisher.public_url()
    }

    pub async fn capture(&self) -> Result<AnnotatedImage> {
        self.camera.capture().await
    }

    /// Capture a fresh image and push it to the blob store. Uploads are not retried.
    pub async fn capture_and_upload(&self) -> Result<AnnotatedImage> {
        let image = self.camera.capture().await?;
        self.publisher.upload(&image.path).await?;
        info!(url = self.publisher.public_url(), "Image posted");
        Ok(image)
    }

    pub async fn dispatch_message(&self, payload: &[u8]) -> Result<MessageOutcome> {
        if payload != PICTURE_COMMAND {
            debug!(payload = %String::from_utf8_lossy(payload), "Ignoring message");
            return Ok(MessageOutcome::Ignored);
        }
        info!("Picture requested by cloud message");
        self.capture_and_upload().await.map(MessageOutcome::Published)
    }

    /// Apply `desired.timezone` and return the state to report back.
    pub fn handle_twin_update(&self, update: &TwinUpdate) -> Result<ReportedState> {
        let raw = desired_timezone(&update.payload)?;
        let timezone = self.camera.set_timezone(&raw)?;
        debug!(kind = ?update.kind, timezone, "Twin update applied");
        Ok(ReportedState { timezone })
    }

    pub fn handle_reported_ack(&self, ack: &ReportedStateAck) {
        debug!(status = ack.status, request_id = %ack.request_id, "Reported state acknowledged");
    }
}

/// Long-running consumer of broker events.
#[async_trait]
pub trait EventPump {
    async fn run(&self) -> Result<()>;
}

pub struct BrokerPump {
    client: Arc<dyn MessageClient>,
    dispatcher: Arc<CommandDispatcher>,
}

impl BrokerPump {
    pub fn new(client: Arc<dyn MessageClient>, dispatcher: Arc<CommandDispatcher>) -> Self {
        Self { client, dispatcher }
    }

    /// Handle one event; failures are logged and never end the pump.
    pub async fn handle(&self, event: InboundEvent) {
        match event {
            InboundEvent::Message(message) => self.handle_message(message).await,
            InboundEvent::TwinUpdate(update) => self.handle_twin(update).await,
            InboundEvent::ReportedStateAck(ack) => self.dispatcher.handle_reported_ack(&ack),
        }
    }

    async fn handle_message(&self, message: CloudMessage) {
        match self.dispatcher.dispatch_message(&message.payload).await {
            Ok(MessageOutcome::Published(image)) => {
                info!(path = %image.path.display(), "Message handled")
            }
            Ok(MessageOutcome::Ignored) => {}
            Err(err) => error!(error = %err, "Message handling failed"),
        }
        // Accepted regardless of payload or outcome.
        if let Err(err) = self.client.ack(&message).await {
            warn!(error = %err, "Failed to acknowledge message");
        }
    }

    async fn handle_twin(&self, update: TwinUpdate) {
        let state = match self.dispatcher.handle_twin_update(&update) {
            Ok(state) => state,
            Err(err) => {
                warn!(error = %err, "Twin update ignored");
                return;
            }
        };
        match self.client.send_reported_state(&state).await {
            Ok(request_id) => debug!(request_id = %request_id, "Reported state sent"),
            Err(err) => error!(error = %err, "Failed to send reported state"),
        }
    }
}

#[async_trait]
impl EventPump for BrokerPump {
    async fn run(&self) -> Result<()> {
        info!("Broker pump started");
        let mut events = self.client.subscribe();
        while let Some(event) = events.next().await {
            self.handle(event).await;
        }
        warn!("Broker event stream ended");
        Ok(())
    }
}
