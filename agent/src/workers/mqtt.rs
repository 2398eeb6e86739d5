//! MQTT worker driving the broker connection for the event sink

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::mqtt::client::{MqttAddress, MqttClient};

/// MQTT worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// MQTT broker address
    pub broker_address: MqttAddress,

    /// Reconnect delay on failure
    pub reconnect_delay: Duration,

    /// Consecutive failures before giving up
    pub max_reconnect_attempts: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            broker_address: MqttAddress::default(),
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_attempts: 10,
        }
    }
}

/// Run the MQTT worker. Publishes made through the client's publisher only
/// reach the broker while this loop polls.
pub async fn run<S, F>(
    options: &Options,
    mut client: MqttClient,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!(
        "MQTT worker starting ({}:{}, client {})",
        options.broker_address.host,
        options.broker_address.port,
        client.client_id()
    );

    let mut failures = 0;

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown_signal => {
                info!("MQTT worker shutting down...");
                if let Err(e) = client.disconnect().await {
                    warn!("MQTT disconnect failed: {}", e);
                }
                return;
            }
            polled = client.poll() => {
                match polled {
                    Ok(()) => failures = 0,
                    Err(e) => {
                        failures += 1;
                        if failures >= options.max_reconnect_attempts {
                            error!("MQTT broker unreachable after {} attempts, giving up: {}", failures, e);
                            return;
                        }
                        warn!(
                            "MQTT connection error ({}/{}): {}. Reconnecting in {:?}",
                            failures, options.max_reconnect_attempts, e, options.reconnect_delay
                        );
                        sleep_fn(options.reconnect_delay).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_gives_up_on_unreachable_broker() {
        let options = Options {
            broker_address: MqttAddress {
                host: "127.0.0.1".to_string(),
                port: 1,
                use_tls: false,
                ..Default::default()
            },
            reconnect_delay: Duration::from_millis(10),
            max_reconnect_attempts: 2,
        };
        let client = MqttClient::new(&options.broker_address, "upgrade-agent-test").unwrap();
        run(
            &options,
            client,
            tokio::time::sleep,
            Box::pin(std::future::pending::<()>()),
        )
        .await;
    }

    #[tokio::test]
    async fn test_stops_on_shutdown() {
        let options = Options {
            broker_address: MqttAddress {
                host: "127.0.0.1".to_string(),
                port: 1,
                use_tls: false,
                ..Default::default()
            },
            ..Default::default()
        };
        let client = MqttClient::new(&options.broker_address, "upgrade-agent-test").unwrap();
        run(&options, client, tokio::time::sleep, Box::pin(async {})).await;
    }
}
