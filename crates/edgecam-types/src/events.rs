use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::twin::TwinUpdate;

/// Transport-level handle needed to acknowledge a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryTag {
    pub packet_id: u16,
    pub qos: u8,
}

/// Cloud-to-device message as received from the broker.
#[derive(Debug, Clone)]
pub struct CloudMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub delivery: DeliveryTag,
    pub received_at: DateTime<Utc>,
}

impl CloudMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>, delivery: DeliveryTag) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            delivery,
            received_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportedStateAck {
    pub status: u16,
    pub request_id: String,
}

/// Everything the broker can push at the device.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    Message(CloudMessage),
    TwinUpdate(TwinUpdate),
    ReportedStateAck(ReportedStateAck),
}
