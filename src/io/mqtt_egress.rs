//! MQTT publisher for analytics records
//!
//! Publishes every record to `<topic_prefix>/<kind>`:
//! - visitor_entry, dwell_time - durable facts (QoS 1)
//! - section_analytics, cashier_status, system_status - periodic snapshots (QoS 0)

use crate::infra::config::Config;
use crate::io::egress_channel::SiteRecord;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Topic for a record kind under the configured prefix
pub fn record_topic(prefix: &str, kind: &str) -> String {
    format!("{}/{}", prefix.trim_end_matches('/'), kind)
}

fn record_qos(kind: &str) -> QoS {
    match kind {
        "visitor_entry" | "dwell_time" => QoS::AtLeastOnce,
        _ => QoS::AtMostOnce,
    }
}

/// MQTT publisher actor
///
/// Receives records from the egress channel and publishes them.
pub struct MqttPublisher {
    client: AsyncClient,
    rx: mpsc::Receiver<SiteRecord>,
    topic_prefix: String,
}

impl MqttPublisher {
    /// Create a new MQTT publisher
    ///
    /// Connects to the broker at the configured MQTT host/port.
    pub fn new(config: &Config, rx: mpsc::Receiver<SiteRecord>) -> Self {
        let client_id = format!("visit-analytics-egress-{}", std::process::id());
        let mut mqttoptions = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
        mqttoptions.set_keep_alive(Duration::from_secs(30));
        mqttoptions.set_clean_session(true);

        if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
            mqttoptions.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(mqttoptions, 100);

        tokio::spawn(async move {
            let mut eventloop = eventloop;
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt_egress_connected");
                    }
                    Ok(Event::Incoming(Packet::PubAck(_))) => {
                        debug!("mqtt_egress_puback");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "mqtt_egress_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Self { client, rx, topic_prefix: config.mqtt_egress_topic_prefix().to_string() }
    }

    /// Run the publisher loop until shutdown, then drain queued records
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(prefix = %self.topic_prefix, "mqtt_egress_started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("mqtt_egress_shutdown");
                        while let Ok(record) = self.rx.try_recv() {
                            self.publish_record(record).await;
                        }
                        return;
                    }
                }
                Some(record) = self.rx.recv() => {
                    self.publish_record(record).await;
                }
            }
        }
    }

    async fn publish_record(&self, record: SiteRecord) {
        let kind = record.kind();
        let json = match serde_json::to_vec(&record) {
            Ok(json) => json,
            Err(e) => {
                error!(id = %record.id, error = %e, "mqtt_egress_serialize_failed");
                return;
            }
        };

        let topic = record_topic(&self.topic_prefix, kind);
        if let Err(e) = self.client.publish(&topic, record_qos(kind), false, json).await {
            error!(topic = %topic, id = %record.id, error = %e, "mqtt_egress_publish_failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_topic() {
        assert_eq!(record_topic("analytics", "dwell_time"), "analytics/dwell_time");
        assert_eq!(record_topic("site/7/analytics/", "system_status"), "site/7/analytics/system_status");
    }

    #[test]
    fn test_record_qos() {
        assert_eq!(record_qos("visitor_entry"), QoS::AtLeastOnce);
        assert_eq!(record_qos("dwell_time"), QoS::AtLeastOnce);
        assert_eq!(record_qos("cashier_status"), QoS::AtMostOnce);
    }
}
