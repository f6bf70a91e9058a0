use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::time::to_iso;

/// Bounded fan-out depth per subscriber. A subscriber that falls more than
/// this many events behind loses the oldest events and is told so with a
/// `lag` frame; the connection stays up.
pub const SUBSCRIBER_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TelemetryData {
    pub voltage_v: f64,
    pub current_a: f64,
    pub temperature_c: f64,
    pub resistance_mohm: f64,
    pub soc_pct: f64,
    pub soh_pct: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatusData {
    pub status: String,
    pub soh_pct: f64,
    pub temperature_c: f64,
}

/// Server → client frames. The `event` tag is the frame name on the wire.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerFrame {
    Connected {
        message: String,
        timestamp: String,
    },
    Subscribed {
        #[serde(rename = "type")]
        scope: String,
        id: String,
        timestamp: String,
    },
    Unsubscribed {
        #[serde(rename = "type")]
        scope: String,
        id: String,
        timestamp: String,
    },
    TelemetryUpdate {
        battery_id: String,
        data: TelemetryData,
        timestamp: String,
    },
    BatteryStatusUpdate {
        battery_id: String,
        data: StatusData,
        timestamp: String,
    },
    Alert {
        alert_id: i64,
        battery_id: String,
        location_id: String,
        alert_type: String,
        severity: String,
        message: String,
        resolved: bool,
        timestamp: String,
    },
    Pong {
        timestamp: String,
    },
    Lag {
        dropped: u64,
        timestamp: String,
    },
    Error {
        detail: String,
    },
}

/// Client → server frames. Unknown frame names or extra fields are rejected.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case", deny_unknown_fields)]
pub enum ClientFrame {
    SubscribeLocation { location_id: String },
    UnsubscribeLocation { location_id: String },
    SubscribeBattery { battery_id: String },
    UnsubscribeBattery { battery_id: String },
    Ping {},
}

/// One routed event on the bus. Every event carries the owning site so site
/// subscribers filter without a lookup; the bus is global-FIFO, which is
/// strictly stronger than per-battery causal order.
#[derive(Debug, Clone)]
pub struct BusEvent {
    pub battery_id: String,
    pub location_id: String,
    pub frame: Arc<ServerFrame>,
}

#[derive(Debug)]
pub struct Hub {
    bus: broadcast::Sender<BusEvent>,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(SUBSCRIBER_QUEUE_DEPTH);
        Self { bus }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.bus.subscribe()
    }

    /// Non-blocking publish. With no subscribers the event is dropped, which
    /// is the contract: disconnected subscribers miss updates.
    pub fn publish(&self, battery_id: &str, location_id: &str, frame: ServerFrame) {
        let _ = self.bus.send(BusEvent {
            battery_id: battery_id.to_string(),
            location_id: location_id.to_string(),
            frame: Arc::new(frame),
        });
    }

    pub fn publish_telemetry(
        &self,
        battery_id: &str,
        location_id: &str,
        ts: chrono::DateTime<Utc>,
        data: TelemetryData,
    ) {
        self.publish(
            battery_id,
            location_id,
            ServerFrame::TelemetryUpdate {
                battery_id: battery_id.to_string(),
                data,
                timestamp: to_iso(ts),
            },
        );
    }

    pub fn publish_status(
        &self,
        battery_id: &str,
        location_id: &str,
        ts: chrono::DateTime<Utc>,
        data: StatusData,
    ) {
        self.publish(
            battery_id,
            location_id,
            ServerFrame::BatteryStatusUpdate {
                battery_id: battery_id.to_string(),
                data,
                timestamp: to_iso(ts),
            },
        );
    }

    #[allow(clippy::too_many_arguments)]
    pub fn publish_alert(
        &self,
        alert_id: i64,
        battery_id: &str,
        location_id: &str,
        alert_type: &str,
        severity: &str,
        message: &str,
        resolved: bool,
        ts: chrono::DateTime<Utc>,
    ) {
        self.publish(
            battery_id,
            location_id,
            ServerFrame::Alert {
                alert_id,
                battery_id: battery_id.to_string(),
                location_id: location_id.to_string(),
                alert_type: alert_type.to_string(),
                severity: severity.to_string(),
                message: message.to_string(),
                resolved,
                timestamp: to_iso(ts),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frames_parse_from_wire_shape() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"event":"subscribe_battery","battery_id":"BAT-1"}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::SubscribeBattery {
                battery_id: "BAT-1".to_string()
            }
        );

        let frame: ClientFrame = serde_json::from_str(r#"{"event":"ping"}"#).unwrap();
        assert_eq!(frame, ClientFrame::Ping {});
    }

    #[test]
    fn unknown_client_fields_are_rejected() {
        let result: Result<ClientFrame, _> = serde_json::from_str(
            r#"{"event":"subscribe_battery","battery_id":"BAT-1","extra":true}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn subscribed_frame_uses_type_field_on_wire() {
        let frame = ServerFrame::Subscribed {
            scope: "battery".to_string(),
            id: "BAT-1".to_string(),
            timestamp: "2026-01-01T00:00:00.000Z".to_string(),
        };
        let wire = serde_json::to_value(&frame).unwrap();
        assert_eq!(wire["event"], "subscribed");
        assert_eq!(wire["type"], "battery");
        assert_eq!(wire["id"], "BAT-1");
    }

    #[tokio::test]
    async fn events_arrive_in_publish_order() {
        let hub = Hub::new();
        let mut rx = hub.subscribe();
        for i in 0..5 {
            hub.publish(
                "BAT-1",
                "DC-CNX-01",
                ServerFrame::Pong {
                    timestamp: format!("t{i}"),
                },
            );
        }
        for i in 0..5 {
            let event = rx.recv().await.unwrap();
            match event.frame.as_ref() {
                ServerFrame::Pong { timestamp } => assert_eq!(timestamp, &format!("t{i}")),
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn lagged_subscriber_sees_drop_count() {
        let hub = Hub::new();
        let mut rx = hub.subscribe();
        for i in 0..(SUBSCRIBER_QUEUE_DEPTH + 10) {
            hub.publish(
                "BAT-1",
                "DC-CNX-01",
                ServerFrame::Pong {
                    timestamp: format!("t{i}"),
                },
            );
        }
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => assert!(n >= 10),
            other => panic!("expected lag, got {other:?}"),
        }
    }
}
