use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::{DeserializeFromStr, SerializeDisplay};
use strum_macros::{Display, EnumString};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::device::DeviceKind;
use crate::protocol;
use crate::transport::SessionRegistry;

/// Stream id every session subscription currently resolves to.
pub const STREAM_ALL: &str = "all";

/// Device lifecycle changes fanned out to subscribed sessions.
#[derive(
    Debug, Clone, Copy, Eq, PartialEq, Display, EnumString, SerializeDisplay, DeserializeFromStr,
)]
pub enum EventKind {
    #[strum(to_string = "discovered")]
    Discovered,
    #[strum(to_string = "status_changed")]
    StatusChanged,
    #[strum(to_string = "removed")]
    Removed,
    #[strum(to_string = "connected")]
    Connected,
    #[strum(to_string = "disconnected")]
    Disconnected,
    #[strum(to_string = "error")]
    Error,
}

/// One structured device event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEvent {
    pub event_type: EventKind,
    pub device_id: String,
    pub device_kind: DeviceKind,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl DeviceEvent {
    /// Creates an event stamped with the current time.
    #[must_use]
    pub fn new(event_type: EventKind, device_id: impl Into<String>, kind: DeviceKind) -> Self {
        Self {
            event_type,
            device_id: device_id.into(),
            device_kind: kind,
            timestamp: OffsetDateTime::now_utc(),
            data: None,
        }
    }

    /// Attaches a free-form payload to the event.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// In-process pub/sub hub between device-side components and sessions.
///
/// Publishers never block: events land in an unbounded queue drained by one
/// fan-out task, which preserves publication order per device.
#[derive(Debug)]
pub struct EventFabric {
    tx: mpsc::UnboundedSender<DeviceEvent>,
}

impl EventFabric {
    /// Creates the fabric and the receiving half for the fan-out task.
    #[must_use]
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<DeviceEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }

    /// Enqueues one event for fan-out. Publishing after shutdown is a no-op.
    pub fn publish(&self, event: DeviceEvent) {
        if self.tx.send(event).is_err() {
            debug!("event fabric is shut down; dropping event");
        }
    }
}

/// Runs the fan-out loop: one notification frame per event, pushed to every
/// session subscribed to the `all` stream.
pub fn spawn_fanout(
    mut rx: mpsc::UnboundedReceiver<DeviceEvent>,
    sessions: Arc<SessionRegistry>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            let params =
                serde_json::to_value(&event).unwrap_or_else(|_| serde_json::json!(null));
            let frame = protocol::notification_frame("device.event", params);
            sessions.broadcast_to_stream(STREAM_ALL, &frame);
        }
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn events_serialise_with_snake_case_kinds() {
        let event = DeviceEvent::new(EventKind::StatusChanged, "serial_com1", DeviceKind::Serial)
            .with_data(serde_json::json!({"status": "connected"}));
        let value = serde_json::to_value(&event).expect("event should serialise");
        assert_eq!("status_changed", value["event_type"]);
        assert_eq!("serial", value["device_kind"]);
        assert_eq!("connected", value["data"]["status"]);
    }

    #[test]
    fn event_kind_parses_from_wire_names() {
        let parsed: EventKind = "disconnected".parse().expect("kind should parse");
        assert_eq!(EventKind::Disconnected, parsed);
    }
}
