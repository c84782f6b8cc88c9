//! Connection task and handles for the broker link.
//!
//! One tokio task owns the rumqttc event loop. Connection loss never escapes
//! the task: the loop sleeps through the configured backoff schedule and polls
//! again, resubscribing on every ConnAck. Callers observe the link through a
//! `watch` channel carrying [`BusStatus`] snapshots.

use std::time::Duration;

use chrono::Local;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, Publish, QoS};
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::BusConfig;
use super::event::EmotionEvent;
use crate::policy::DriveModeDecision;

const KEEP_ALIVE: Duration = Duration::from_secs(5);

#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Point-in-time snapshot of the broker link, published over `watch`.
#[derive(Clone, Debug, Default)]
pub struct BusStatus {
    pub connection_state: ConnectionState,
    pub last_error: Option<String>,
    pub events_received: usize,
    pub events_discarded: usize,
    pub last_activity: Option<chrono::DateTime<Local>>,
}

#[derive(Debug, Error)]
pub enum EventBusError {
    #[error("invalid broker address '{0}': expected host or host:port")]
    InvalidAddress(String),
    #[error("failed to encode decision payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("mqtt client error: {0}")]
    Client(#[from] rumqttc::ClientError),
}

/// Handle for the broker connection task.
///
/// `connect` returns immediately; the subscription is established by the
/// background task once the broker acknowledges the connection. Dropping the
/// handle without calling [`EventBusHandle::shutdown`] leaves the task running
/// until the runtime itself stops.
pub struct EventBusHandle {
    client: AsyncClient,
    publish_topic: Option<String>,
    status_rx: watch::Receiver<BusStatus>,
    cancel: CancellationToken,
    task_handle: Option<JoinHandle<()>>,
}

impl EventBusHandle {
    /// Spawns the connection task. Decoded events are forwarded to `events_tx`
    /// with `try_send`; a full pipeline queue counts as a discard and never
    /// blocks the network task.
    pub fn connect(
        config: BusConfig,
        events_tx: mpsc::Sender<EmotionEvent>,
    ) -> Result<Self, EventBusError> {
        let (host, port) = split_address(&config.address)?;

        let mut options = MqttOptions::new(config.client_id.clone(), host, port);
        options.set_keep_alive(KEEP_ALIVE);
        if let (Some(user), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(user.clone(), password.clone());
        }

        let (client, event_loop) = AsyncClient::new(options, 100);
        let (status_tx, status_rx) = watch::channel(BusStatus::default());
        let cancel = CancellationToken::new();

        let publish_topic = config.publish_topic.clone();
        let worker = BusWorker {
            client: client.clone(),
            event_loop,
            config,
            events_tx,
            status_tx,
            cancel: cancel.child_token(),
        };
        let task_handle = tokio::spawn(worker.run());

        Ok(Self {
            client,
            publish_topic,
            status_rx,
            cancel,
            task_handle: Some(task_handle),
        })
    }

    pub fn status(&self) -> watch::Receiver<BusStatus> {
        self.status_rx.clone()
    }

    /// Outbound publisher for decision changes, if an outbound topic is
    /// configured. The publisher shares the connection with the inbound side.
    pub fn decision_publisher(&self) -> Option<DecisionPublisher> {
        self.publish_topic.as_ref().map(|topic| DecisionPublisher {
            client: self.client.clone(),
            topic: topic.clone(),
        })
    }

    /// Stops the connection task and waits for it to drain.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.task_handle.take() {
            if let Err(e) = handle.await {
                error!("event bus task panicked: {}", e);
            }
        }
    }
}

/// Publishes drive-mode decisions on the outbound topic, QoS at-least-once.
#[derive(Clone)]
pub struct DecisionPublisher {
    client: AsyncClient,
    topic: String,
}

impl DecisionPublisher {
    pub async fn publish(&self, decision: &DriveModeDecision) -> Result<(), EventBusError> {
        let payload = serde_json::to_vec(decision)?;
        self.client
            .publish(self.topic.clone(), QoS::AtLeastOnce, false, payload)
            .await?;
        debug!(topic = %self.topic, mode = %decision.mode, "decision republished");
        Ok(())
    }
}

struct BusWorker {
    client: AsyncClient,
    event_loop: EventLoop,
    config: BusConfig,
    events_tx: mpsc::Sender<EmotionEvent>,
    status_tx: watch::Sender<BusStatus>,
    cancel: CancellationToken,
}

impl BusWorker {
    async fn run(mut self) {
        self.update(|status| status.connection_state = ConnectionState::Connecting);
        let mut attempt: u32 = 0;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("event bus shutting down");
                    break;
                }

                polled = self.event_loop.poll() => match polled {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        attempt = 0;
                        info!(broker = %self.config.address, topic = %self.config.topic, "connected to broker");
                        self.update(|status| {
                            status.connection_state = ConnectionState::Connected;
                            status.last_error = None;
                        });
                        // rumqttc does not restore subscriptions across
                        // reconnects, so every ConnAck resubscribes.
                        if let Err(e) = self
                            .client
                            .subscribe(self.config.topic.clone(), QoS::AtLeastOnce)
                            .await
                        {
                            error!("subscribe request failed: {}", e);
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        self.handle_publish(publish);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        attempt = attempt.saturating_add(1);
                        let delay = self.config.reconnect.delay_for_attempt(attempt);
                        warn!(
                            error = %e,
                            attempt,
                            "broker connection lost, retrying in {:?}",
                            delay
                        );
                        self.update(|status| {
                            status.connection_state = ConnectionState::Reconnecting;
                            status.last_error = Some(e.to_string());
                        });

                        tokio::select! {
                            _ = self.cancel.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }

        let _ = self.client.disconnect().await;
        self.update(|status| status.connection_state = ConnectionState::Disconnected);
    }

    fn handle_publish(&self, publish: Publish) {
        match EmotionEvent::decode(&publish.payload) {
            Ok(event) => {
                debug!(
                    topic = %publish.topic,
                    label = %event.label,
                    confidence = event.confidence,
                    "emotion event received"
                );
                match self.events_tx.try_send(event) {
                    Ok(()) => self.update(|status| {
                        status.events_received += 1;
                        status.last_activity = Some(Local::now());
                    }),
                    Err(TrySendError::Full(_)) => {
                        warn!("pipeline queue full, discarding emotion event");
                        self.update(|status| status.events_discarded += 1);
                    }
                    Err(TrySendError::Closed(_)) => {
                        warn!("pipeline receiver dropped, discarding emotion event");
                        self.update(|status| status.events_discarded += 1);
                    }
                }
            }
            Err(e) => {
                warn!(topic = %publish.topic, "discarding malformed payload: {}", e);
                self.update(|status| status.events_discarded += 1);
            }
        }
    }

    fn update(&self, apply: impl FnOnce(&mut BusStatus)) {
        self.status_tx.send_modify(apply);
    }
}

fn split_address(address: &str) -> Result<(String, u16), EventBusError> {
    match address.rsplit_once(':') {
        None => Ok((address.to_string(), 1883)),
        Some((host, port)) if !host.is_empty() => port
            .parse()
            .map(|port| (host.to_string(), port))
            .map_err(|_| EventBusError::InvalidAddress(address.to_string())),
        Some(_) => Err(EventBusError::InvalidAddress(address.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_without_port_defaults_to_1883() {
        assert_eq!(split_address("broker.local").unwrap(), ("broker.local".to_string(), 1883));
    }

    #[test]
    fn address_with_port_is_split() {
        assert_eq!(
            split_address("192.168.24.254:1884").unwrap(),
            ("192.168.24.254".to_string(), 1884)
        );
    }

    #[test]
    fn garbage_port_is_rejected() {
        assert!(matches!(
            split_address("broker.local:mqtt"),
            Err(EventBusError::InvalidAddress(_))
        ));
        assert!(matches!(
            split_address(":1883"),
            Err(EventBusError::InvalidAddress(_))
        ));
    }
}
