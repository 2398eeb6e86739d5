//! MQTT client implementation

use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::errors::UpgradeError;

/// MQTT broker address
#[derive(Debug, Clone)]
pub struct MqttAddress {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    /// Optional path to a PEM-encoded CA certificate for broker verification.
    /// When `None` and `use_tls` is `true`, the system certificate store is used.
    pub ca_cert_path: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for MqttAddress {
    fn default() -> Self {
        Self {
            host: "".to_string(),
            port: 8883,
            use_tls: true,
            ca_cert_path: None,
            username: None,
            password: None,
        }
    }
}

impl MqttAddress {
    pub fn is_configured(&self) -> bool {
        !self.host.is_empty()
    }
}

/// MQTT client wrapper
pub struct MqttClient {
    client: AsyncClient,
    eventloop: EventLoop,
    client_id: String,
}

impl MqttClient {
    /// Create a new MQTT client. Nothing is sent until the event loop is polled.
    pub fn new(address: &MqttAddress, client_id: &str) -> Result<Self, UpgradeError> {
        if address.host.is_empty() {
            return Err(UpgradeError::MqttError("MQTT host is not configured".to_string()));
        }

        let mut options = MqttOptions::new(client_id, &address.host, address.port);
        options.set_keep_alive(Duration::from_secs(30));
        if let Some(username) = &address.username {
            options.set_credentials(username, address.password.clone().unwrap_or_default());
        }

        if address.use_tls {
            use rumqttc::{TlsConfiguration, Transport};
            use rustls::ClientConfig;
            use std::sync::Arc;

            let mut root_cert_store = rustls::RootCertStore::empty();

            if let Some(ref ca_path) = address.ca_cert_path {
                let ca_pem = std::fs::read(ca_path)
                    .map_err(|e| UpgradeError::MqttError(format!("Failed to read CA cert {ca_path}: {e}")))?;
                let mut cursor = std::io::Cursor::new(ca_pem);
                for cert in rustls_pemfile::certs(&mut cursor).flatten() {
                    let _ = root_cert_store.add(cert);
                }
            } else {
                for cert in rustls_native_certs::load_native_certs().unwrap_or_default() {
                    let _ = root_cert_store.add(cert);
                }
            }

            let client_config = ClientConfig::builder()
                .with_root_certificates(root_cert_store)
                .with_no_client_auth();

            options.set_transport(Transport::tls_with_config(TlsConfiguration::Rustls(
                Arc::new(client_config),
            )));
        }

        let (client, eventloop) = AsyncClient::new(options, 64);

        Ok(Self {
            client,
            eventloop,
            client_id: client_id.to_string(),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Handle for publishing while the event loop is driven elsewhere
    pub fn publisher(&self) -> MqttPublisher {
        MqttPublisher {
            client: self.client.clone(),
        }
    }

    /// Drive the connection one step
    pub async fn poll(&mut self) -> Result<(), UpgradeError> {
        match self.eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("MQTT connected");
                Ok(())
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                debug!("Publish {} acknowledged", ack.pkid);
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(e) => {
                warn!("MQTT poll error: {}", e);
                Err(UpgradeError::MqttError(e.to_string()))
            }
        }
    }

    /// Disconnect from broker
    pub async fn disconnect(&mut self) -> Result<(), UpgradeError> {
        self.client
            .disconnect()
            .await
            .map_err(|e| UpgradeError::MqttError(e.to_string()))?;
        info!("MQTT disconnected");
        Ok(())
    }
}

/// Cloneable publishing half of [`MqttClient`]
#[derive(Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
}

impl MqttPublisher {
    /// Publish a value as JSON
    pub async fn publish_json<T: Serialize>(&self, topic: &str, value: &T) -> Result<(), UpgradeError> {
        let payload = serde_json::to_vec(value)?;
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| UpgradeError::MqttError(e.to_string()))?;
        debug!("Published to: {}", topic);
        Ok(())
    }
}
