//! IoT Hub device client over MQTT.
//!
//! Cloud-to-device messages, desired-property patches and twin responses
//! all arrive on one MQTT session. [`IotHubClient::subscribe`] drives the
//! session on a background task and turns incoming publishes into
//! [`InboundEvent`]s; the broker reconnects on a fixed interval until the
//! retry limit is exhausted.

use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::Utc;
use edgecam_types::{
    config::{BrokerConfig, ENV_CONNECTION_STRING},
    events::{CloudMessage, DeliveryTag, InboundEvent, ReportedStateAck},
    twin::{ReportedState, TwinUpdate},
    EdgecamError, Result,
};
use futures::{stream::BoxStream, StreamExt};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, Publish, QoS, Transport};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{detach, network_error, signing::sas_token, MessageClient};

const MQTT_PORT: u16 = 8883;
const API_VERSION: &str = "2021-04-12";
const KEEP_ALIVE: Duration = Duration::from_secs(30);
const REQUEST_CAPACITY: usize = 16;

const TWIN_DESIRED_PREFIX: &str = "$iothub/twin/PATCH/properties/desired/";
const TWIN_RESPONSE_PREFIX: &str = "$iothub/twin/res/";
const TWIN_GET_RID_PREFIX: &str = "get-";
const TWIN_REPORTED_RID_PREFIX: &str = "rep-";

/// Identity parsed from a `HostName=..;DeviceId=..;SharedAccessKey=..` string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCredentials {
    pub host_name: String,
    pub device_id: String,
    pub shared_access_key: String,
}

impl DeviceCredentials {
    pub fn parse(connection_string: &str) -> Result<Self> {
        let mut host_name = None;
        let mut device_id = None;
        let mut shared_access_key = None;

        for part in connection_string.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let Some((key, value)) = part.split_once('=') else {
                return Err(EdgecamError::Configuration(format!(
                    "malformed connection string segment {part:?}"
                )));
            };
            match key {
                "HostName" => host_name = Some(value.to_string()),
                "DeviceId" => device_id = Some(value.to_string()),
                "SharedAccessKey" => shared_access_key = Some(value.to_string()),
                other => debug!(segment = other, "Ignoring connection string segment"),
            }
        }

        let missing = |name: &str| {
            EdgecamError::Configuration(format!("connection string has no {name}"))
        };
        Ok(Self {
            host_name: host_name.ok_or_else(|| missing("HostName"))?,
            device_id: device_id.ok_or_else(|| missing("DeviceId"))?,
            shared_access_key: shared_access_key.ok_or_else(|| missing("SharedAccessKey"))?,
        })
    }

    pub fn resource_uri(&self) -> String {
        format!("{}/devices/{}", self.host_name, self.device_id)
    }

    pub fn username(&self) -> String {
        format!(
            "{}/{}/?api-version={API_VERSION}",
            self.host_name, self.device_id
        )
    }

    pub fn password(&self, ttl: Duration) -> Result<(String, i64)> {
        let expiry = Utc::now().timestamp() + ttl.as_secs() as i64;
        let token = sas_token(&self.resource_uri(), &self.shared_access_key, expiry)?;
        Ok((token, expiry))
    }

    fn c2d_topic_prefix(&self) -> String {
        format!("devices/{}/messages/devicebound/", self.device_id)
    }
}

/// Fixed-interval reconnect policy bounded by a total retry window.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub limit: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.retry_interval_secs),
            limit: Duration::from_secs(config.retry_limit_secs),
        }
    }

    /// Whether another attempt is allowed after failing continuously since `since`.
    pub fn should_retry(&self, since: Instant, now: Instant) -> bool {
        now.duration_since(since) < self.limit
    }
}

pub struct IotHubClient {
    client: AsyncClient,
    eventloop: Mutex<Option<EventLoop>>,
    credentials: DeviceCredentials,
    retry: RetryPolicy,
    message_timeout: Duration,
    sas_ttl: Duration,
}

impl IotHubClient {
    /// Prepare a session; the network connection is made once the event stream is polled.
    pub fn new(config: &BrokerConfig) -> Result<Self> {
        let connection_string = config
            .connection_string
            .as_deref()
            .ok_or(EdgecamError::ConfigMissing(ENV_CONNECTION_STRING))?;
        let credentials = DeviceCredentials::parse(connection_string)?;
        let sas_ttl = Duration::from_secs(config.sas_ttl_secs);
        let (password, _) = credentials.password(sas_ttl)?;

        let mut options = MqttOptions::new(&credentials.device_id, &credentials.host_name, MQTT_PORT);
        options
            .set_credentials(credentials.username(), password)
            .set_keep_alive(KEEP_ALIVE)
            .set_manual_acks(true)
            .set_transport(Transport::tls_with_default_config());

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        info!(
            host = %credentials.host_name,
            device = %credentials.device_id,
            "IoT Hub client prepared"
        );

        Ok(Self {
            client,
            eventloop: Mutex::new(Some(eventloop)),
            credentials,
            retry: RetryPolicy::from_config(config),
            message_timeout: Duration::from_millis(config.message_timeout_ms),
            sas_ttl,
        })
    }

    pub fn device_id(&self) -> &str {
        &self.credentials.device_id
    }

    async fn with_timeout<F>(&self, what: &str, future: F) -> Result<()>
    where
        F: std::future::Future<Output = std::result::Result<(), rumqttc::ClientError>>,
    {
        tokio::time::timeout(self.message_timeout, future)
            .await
            .map_err(|_| network_error(format!("{what} timed out")))?
            .map_err(|err| network_error(format!("{what} failed: {err}")))
    }
}

/// Subscriptions and the initial full-twin request issued on every (re)connect.
async fn on_connected(client: &AsyncClient, credentials: &DeviceCredentials) -> Result<()> {
    let subscriptions = [
        (format!("{}#", credentials.c2d_topic_prefix()), QoS::AtLeastOnce),
        (format!("{TWIN_DESIRED_PREFIX}#"), QoS::AtMostOnce),
        (format!("{TWIN_RESPONSE_PREFIX}#"), QoS::AtMostOnce),
    ];
    for (topic, qos) in subscriptions {
        client
            .subscribe(&topic, qos)
            .await
            .map_err(|err| network_error(format!("subscribe {topic} failed: {err}")))?;
    }

    let rid = format!("{TWIN_GET_RID_PREFIX}{}", Uuid::new_v4().simple());
    client
        .publish(
            format!("$iothub/twin/GET/?$rid={rid}"),
            QoS::AtMostOnce,
            false,
            Vec::new(),
        )
        .await
        .map_err(|err| network_error(format!("twin request failed: {err}")))?;
    debug!(rid = %rid, "Requested full twin");
    Ok(())
}

/// Split `$iothub/twin/res/{status}/?$rid={rid}&...` into status and request id.
fn parse_twin_response(topic: &str) -> Option<(u16, String)> {
    let rest = topic.strip_prefix(TWIN_RESPONSE_PREFIX)?;
    let (status, query) = rest.split_once('/')?;
    let status = status.parse().ok()?;
    let rid = query
        .trim_start_matches('?')
        .split('&')
        .find_map(|pair| pair.strip_prefix("$rid="))?;
    Some((status, rid.to_string()))
}

/// Map an incoming publish onto the event it represents, if any.
fn classify(credentials: &DeviceCredentials, publish: &Publish) -> Option<InboundEvent> {
    let topic = publish.topic.as_str();

    if topic.starts_with(&credentials.c2d_topic_prefix()) {
        let delivery = DeliveryTag {
            packet_id: publish.pkid,
            qos: publish.qos as u8,
        };
        return Some(InboundEvent::Message(CloudMessage::new(
            topic,
            publish.payload.to_vec(),
            delivery,
        )));
    }

    if topic.starts_with(TWIN_DESIRED_PREFIX) {
        let update = TwinUpdate::from_desired_patch(&publish.payload).unwrap_or_else(|err| {
            warn!(error = %err, "Desired patch is not JSON; forwarding raw payload");
            TwinUpdate {
                kind: edgecam_types::twin::TwinUpdateKind::Partial,
                payload: String::from_utf8_lossy(&publish.payload).into_owned(),
            }
        });
        return Some(InboundEvent::TwinUpdate(update));
    }

    if let Some((status, request_id)) = parse_twin_response(topic) {
        if request_id.starts_with(TWIN_GET_RID_PREFIX) {
            if status == 200 {
                let payload = String::from_utf8_lossy(&publish.payload).into_owned();
                return Some(InboundEvent::TwinUpdate(TwinUpdate::complete(payload)));
            }
            warn!(status, "Full twin request rejected");
            return None;
        }
        return Some(InboundEvent::ReportedStateAck(ReportedStateAck {
            status,
            request_id,
        }));
    }

    debug!(topic, "Ignoring publish on unexpected topic");
    None
}

fn qos_from(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

#[async_trait]
impl MessageClient for IotHubClient {
    fn subscribe(&self) -> BoxStream<'static, InboundEvent> {
        let taken = self.eventloop.lock().ok().and_then(|mut slot| slot.take());
        let Some(mut eventloop) = taken else {
            warn!("IoT Hub event stream already taken");
            return futures::stream::empty().boxed();
        };

        let client = self.client.clone();
        let credentials = self.credentials.clone();
        let retry = self.retry;
        let sas_ttl = self.sas_ttl;

        let stream = async_stream::stream! {
            let mut failing_since: Option<Instant> = None;
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        failing_since = None;
                        info!(code = ?ack.code, "Connected to IoT Hub");
                        if let Err(err) = on_connected(&client, &credentials).await {
                            error!(error = %err, "Failed to set up IoT Hub subscriptions");
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let event = classify(&credentials, &publish);
                        if !matches!(event, Some(InboundEvent::Message(_))) {
                            // Only device-bound messages wait for the dispatcher's verdict.
                            if let Err(err) = client.ack(&publish).await {
                                warn!(error = %err, "Failed to ack twin publish");
                            }
                        }
                        if let Some(event) = event {
                            yield event;
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        let now = Instant::now();
                        let since = *failing_since.get_or_insert(now);
                        if !retry.should_retry(since, now) {
                            error!(
                                error = %err,
                                limit_secs = retry.limit.as_secs(),
                                "IoT Hub unreachable, giving up"
                            );
                            break;
                        }
                        warn!(
                            error = %err,
                            retry_in_secs = retry.interval.as_secs(),
                            "IoT Hub connection error"
                        );
                        match credentials.password(sas_ttl) {
                            Ok((password, _)) => {
                                eventloop
                                    .mqtt_options
                                    .set_credentials(credentials.username(), password);
                            }
                            Err(err) => error!(error = %err, "Failed to refresh SAS token"),
                        }
                        tokio::time::sleep(retry.interval).await;
                    }
                }
            }
        };
        // Polled on its own task so keep-alives continue while handlers run.
        detach(stream)
    }

    async fn ack(&self, message: &CloudMessage) -> Result<()> {
        let mut publish = Publish::new(
            message.topic.clone(),
            qos_from(message.delivery.qos),
            Vec::new(),
        );
        publish.pkid = message.delivery.packet_id;
        self.with_timeout("message ack", self.client.ack(&publish)).await
    }

    async fn send_reported_state(&self, state: &ReportedState) -> Result<String> {
        let rid = format!("{TWIN_REPORTED_RID_PREFIX}{}", Uuid::new_v4().simple());
        let topic = format!("$iothub/twin/PATCH/properties/reported/?$rid={rid}");
        self.with_timeout(
            "reported state",
            self.client
                .publish(topic, QoS::AtMostOnce, false, state.to_json().into_bytes()),
        )
        .await?;
        debug!(rid = %rid, timezone = state.timezone, "Reported state sent");
        Ok(rid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONNECTION: &str =
        "HostName=hub.azure-devices.net;DeviceId=cam-1;SharedAccessKey=c2VjcmV0LWtleQ==";

    fn credentials() -> DeviceCredentials {
        DeviceCredentials::parse(CONNECTION).unwrap()
    }

    fn publish(topic: &str, payload: &[u8]) -> Publish {
        let mut publish = Publish::new(topic, QoS::AtLeastOnce, payload.to_vec());
        publish.pkid = 7;
        publish
    }

    #[test]
    fn parses_connection_string() {
        let creds = credentials();
        assert_eq!(creds.host_name, "hub.azure-devices.net");
        assert_eq!(creds.device_id, "cam-1");
        assert_eq!(creds.shared_access_key, "c2VjcmV0LWtleQ==");
        assert_eq!(
            creds.username(),
            "hub.azure-devices.net/cam-1/?api-version=2021-04-12"
        );
    }

    #[test]
    fn rejects_incomplete_connection_string() {
        assert!(DeviceCredentials::parse("HostName=hub;DeviceId=cam").is_err());
        assert!(DeviceCredentials::parse("HostName").is_err());
    }

    #[test]
    fn missing_connection_string_is_config_missing() {
        let mut config = edgecam_types::config::EdgecamConfig::default().broker;
        config.connection_string = None;
        let err = IotHubClient::new(&config).err().expect("should fail");
        assert!(matches!(err, EdgecamError::ConfigMissing(ENV_CONNECTION_STRING)));
    }

    #[test]
    fn device_bound_publish_becomes_message() {
        let event = classify(
            &credentials(),
            &publish("devices/cam-1/messages/devicebound/%24.to=x", b"picture"),
        );
        let Some(InboundEvent::Message(message)) = event else {
            panic!("expected message, got {event:?}");
        };
        assert_eq!(message.payload, b"picture");
        assert_eq!(message.delivery, DeliveryTag { packet_id: 7, qos: 1 });
    }

    #[test]
    fn desired_patch_becomes_partial_twin_update() {
        let event = classify(
            &credentials(),
            &publish("$iothub/twin/PATCH/properties/desired/?$version=4", br#"{"timezone":"5"}"#),
        );
        let Some(InboundEvent::TwinUpdate(update)) = event else {
            panic!("expected twin update, got {event:?}");
        };
        assert_eq!(
            edgecam_types::twin::desired_timezone(&update.payload).unwrap(),
            "5"
        );
    }

    #[test]
    fn twin_responses_are_split_by_request_id() {
        let full = classify(
            &credentials(),
            &publish("$iothub/twin/res/200/?$rid=get-abc", br#"{"desired":{"timezone":1}}"#),
        );
        assert!(matches!(full, Some(InboundEvent::TwinUpdate(_))));

        let ack = classify(
            &credentials(),
            &publish("$iothub/twin/res/204/?$rid=rep-xyz&$version=9", b""),
        );
        let Some(InboundEvent::ReportedStateAck(ack)) = ack else {
            panic!("expected reported ack, got {ack:?}");
        };
        assert_eq!(ack.status, 204);
        assert_eq!(ack.request_id, "rep-xyz");
    }

    #[test]
    fn unrelated_topics_are_ignored() {
        assert!(classify(&credentials(), &publish("devices/other/messages/devicebound/", b"x")).is_none());
        assert!(parse_twin_response("$iothub/twin/res/abc/?$rid=1").is_none());
    }

    #[test]
    fn retry_policy_stops_after_limit() {
        let policy = RetryPolicy {
            interval: Duration::from_secs(5),
            limit: Duration::from_secs(100),
        };
        let start = Instant::now();
        assert!(policy.should_retry(start, start + Duration::from_secs(99)));
        assert!(!policy.should_retry(start, start + Duration::from_secs(100)));
    }
}
