//! MQTT transport on top of `rumqttc`.
//!
//! rumqttc drives the socket from `EventLoop::poll`. A driver task owns the
//! event loop and alternates between two phases:
//!
//! - disconnected: wait for a connect request, then poll until `ConnAck` or an
//!   error and report the outcome back to the caller;
//! - connected: poll continuously, turning every inbound publish into a
//!   [`Delivery`] on the dispatcher channel, until the link drops.
//!
//! Polling never waits on the dispatcher channel. Publishes that do not fit
//! are held in a backlog and handed over as capacity frees up, so pings,
//! acknowledgements and subscriptions keep flowing while handlers are slow.
//!
//! Reconnect timing is therefore owned by the connection manager, not by
//! rumqttc's implicit reconnect-on-poll.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, Incoming, MqttOptions, Outgoing, Publish, QoS, SubscribeFilter,
    SubscribeReasonCode, TlsConfiguration, Transport,
};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MqttSettings;
use crate::error::{ConfigError, TransportError};

use super::{Acknowledge, BrokerTransport, Delivery, InboundMessage, NoAck, QualityOfService};

type ConnectReply = oneshot::Sender<Result<(), TransportError>>;
type SubscribeReply = oneshot::Sender<Vec<SubscribeReasonCode>>;

/// How long `subscribe` waits for the broker's SUBACK.
const SUBACK_TIMEOUT: Duration = Duration::from_secs(10);

fn to_rumqttc(qos: QualityOfService) -> QoS {
    match qos {
        QualityOfService::AtMostOnce => QoS::AtMostOnce,
        QualityOfService::AtLeastOnce => QoS::AtLeastOnce,
        QualityOfService::ExactlyOnce => QoS::ExactlyOnce,
    }
}

/// Map SUBACK return codes (in request order) onto the requested filters.
fn check_suback(filters: &[String], codes: &[SubscribeReasonCode]) -> Result<(), TransportError> {
    for (i, filter) in filters.iter().enumerate() {
        match codes.get(i) {
            Some(SubscribeReasonCode::Success(_)) => {}
            Some(SubscribeReasonCode::Failure) => {
                return Err(TransportError::SubscribeFailed {
                    filter: filter.clone(),
                    message: "rejected by broker".to_string(),
                });
            }
            None => {
                return Err(TransportError::SubscribeFailed {
                    filter: filter.clone(),
                    message: format!("SUBACK carried {} return codes for {} filters", codes.len(), filters.len()),
                });
            }
        }
    }
    Ok(())
}

/// Build client options from settings.
pub fn mqtt_options(settings: &MqttSettings) -> Result<MqttOptions, ConfigError> {
    let mut options = MqttOptions::new(settings.client_id.clone(), settings.host.clone(), settings.port);
    options.set_keep_alive(Duration::from_secs(settings.keep_alive_secs));
    options.set_clean_session(settings.clean_session);
    options.set_manual_acks(settings.manual_acks);

    if let (Some(user), Some(pass)) = (&settings.username, &settings.password) {
        options.set_credentials(user.clone(), pass.clone());
    }

    if settings.use_tls {
        let Some(path) = &settings.ca_pem_path else {
            return Err(ConfigError::InvalidSetting {
                field: "mqtt.ca_pem_path".to_string(),
                reason: "required when use_tls is true".to_string(),
            });
        };
        let ca = std::fs::read(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        options.set_transport(Transport::tls_with_config(TlsConfiguration::Simple {
            ca,
            alpn: None,
            client_auth: None,
        }));
    }

    Ok(options)
}

struct MqttAck {
    client: AsyncClient,
    publish: Publish,
}

#[async_trait]
impl Acknowledge for MqttAck {
    async fn ack(self: Box<Self>) -> Result<(), TransportError> {
        self.client
            .ack(&self.publish)
            .await
            .map_err(|e| TransportError::AckFailed { message: e.to_string() })
    }
}

/// [`BrokerTransport`] backed by a rumqttc client and a driver task.
pub struct MqttTransport {
    client: AsyncClient,
    connect_tx: mpsc::Sender<ConnectReply>,
    connected: Arc<AtomicBool>,
    /// Waiter for the one outstanding subscribe batch.
    suback: Arc<Mutex<Option<SubscribeReply>>>,
    driver: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl MqttTransport {
    /// Create the client and spawn the driver task.
    ///
    /// Inbound publishes are sent to `deliveries`. The driver stops when
    /// `cancel` fires or the delivery receiver is dropped.
    pub fn start(
        settings: &MqttSettings,
        deliveries: mpsc::Sender<Delivery>,
        cancel: CancellationToken,
    ) -> Result<Self, ConfigError> {
        let options = mqtt_options(settings)?;
        let (client, eventloop) = AsyncClient::new(options, settings.channel_capacity);
        let (connect_tx, connect_rx) = mpsc::channel::<ConnectReply>(1);
        let connected = Arc::new(AtomicBool::new(false));
        let suback = Arc::new(Mutex::new(None));

        let driver = Driver {
            eventloop,
            client: client.clone(),
            manual_acks: settings.manual_acks,
            connected: Arc::clone(&connected),
            suback: Arc::clone(&suback),
            deliveries,
            connect_rx,
            cancel,
        };
        let handle = tokio::spawn(driver.run());

        Ok(Self {
            client,
            connect_tx,
            connected,
            suback,
            driver: Mutex::new(Some(handle)),
        })
    }

    /// Whether the driver currently holds an acknowledged session.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

#[async_trait]
impl BrokerTransport for MqttTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.connect_tx
            .send(reply_tx)
            .await
            .map_err(|_| TransportError::Closed)?;
        reply_rx.await.map_err(|_| TransportError::Closed)?
    }

    /// Send all filters in one SUBSCRIBE and wait for the broker's SUBACK.
    async fn subscribe(&self, filters: &[String], qos: QualityOfService) -> Result<(), TransportError> {
        let failed = |message: String| TransportError::SubscribeFailed {
            filter: filters.join(","),
            message,
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        match self.suback.lock() {
            Ok(mut slot) => *slot = Some(reply_tx),
            Err(_) => return Err(TransportError::Closed),
        }

        let requests = filters.iter().map(|f| SubscribeFilter::new(f.clone(), to_rumqttc(qos)));
        self.client
            .subscribe_many(requests)
            .await
            .map_err(|e| failed(e.to_string()))?;

        let codes = match tokio::time::timeout(SUBACK_TIMEOUT, reply_rx).await {
            Ok(Ok(codes)) => codes,
            Ok(Err(_)) => return Err(failed("connection lost before SUBACK".to_string())),
            Err(_) => return Err(failed(format!("no SUBACK within {}s", SUBACK_TIMEOUT.as_secs()))),
        };
        check_suback(filters, &codes)?;
        debug!(filters = ?filters, "subscription acknowledged");
        Ok(())
    }

    async fn probe(&self) -> Result<bool, TransportError> {
        // rumqttc exchanges PINGREQ/PINGRESP itself; the driver flips the flag
        // as soon as a ping times out or the socket errors.
        Ok(self.is_connected())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let result = if self.is_connected() {
            self.client
                .disconnect()
                .await
                .map_err(|e| TransportError::DisconnectFailed { message: e.to_string() })
        } else {
            Ok(())
        };

        let handle = self.driver.lock().ok().and_then(|mut guard| guard.take());
        if let Some(handle) = handle {
            // The driver exits once it observes the outgoing disconnect or the
            // cancellation token; do not wait on a stuck socket forever.
            if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
                warn!("mqtt driver did not stop within 5s");
            }
        }

        result
    }
}

struct Driver {
    eventloop: EventLoop,
    client: AsyncClient,
    manual_acks: bool,
    connected: Arc<AtomicBool>,
    suback: Arc<Mutex<Option<SubscribeReply>>>,
    deliveries: mpsc::Sender<Delivery>,
    connect_rx: mpsc::Receiver<ConnectReply>,
    cancel: CancellationToken,
}

impl Driver {
    async fn run(mut self) {
        let cancel = self.cancel.clone();
        loop {
            let reply = tokio::select! {
                () = cancel.cancelled() => break,
                reply = self.connect_rx.recv() => match reply {
                    Some(reply) => reply,
                    None => break,
                },
            };

            let outcome = tokio::select! {
                () = cancel.cancelled() => Err(TransportError::Closed),
                outcome = self.handshake() => outcome,
            };
            let ok = outcome.is_ok();
            let _ = reply.send(outcome);
            if !ok {
                continue;
            }

            self.connected.store(true, Ordering::Release);
            let keep_running = self.pump().await;
            self.connected.store(false, Ordering::Release);
            // A pending subscribe sees its reply dropped and fails.
            drop(self.take_suback_waiter());
            if !keep_running {
                break;
            }
        }
        debug!("mqtt driver stopped");
    }

    async fn handshake(&mut self) -> Result<(), TransportError> {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                    return if ack.code == ConnectReturnCode::Success {
                        info!(session_present = ack.session_present, "connected to mqtt broker");
                        Ok(())
                    } else {
                        Err(TransportError::ConnectionFailed {
                            message: format!("broker refused connection: {:?}", ack.code),
                        })
                    };
                }
                Ok(_) => {}
                Err(e) => {
                    return Err(TransportError::ConnectionFailed { message: e.to_string() });
                }
            }
        }
    }

    /// Poll while connected. Returns false when the driver should stop.
    ///
    /// Publishes still in the backlog when the link drops are discarded
    /// unacknowledged; the broker redelivers them.
    async fn pump(&mut self) -> bool {
        let mut backlog: VecDeque<Delivery> = VecDeque::new();
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return false,
                permit = self.deliveries.reserve(), if !backlog.is_empty() => {
                    let Ok(permit) = permit else {
                        debug!("delivery channel closed; stopping mqtt driver");
                        return false;
                    };
                    if let Some(delivery) = backlog.pop_front() {
                        permit.send(delivery);
                    }
                }
                event = self.eventloop.poll() => {
                    if let Some(keep_running) = self.on_event(event, &mut backlog) {
                        if !backlog.is_empty() {
                            debug!(dropped = backlog.len(), "discarding undelivered publishes");
                        }
                        return keep_running;
                    }
                }
            }
        }
    }

    /// Handle one polled event. `Some` ends the connected phase.
    fn on_event(
        &self,
        event: Result<Event, rumqttc::ConnectionError>,
        backlog: &mut VecDeque<Delivery>,
    ) -> Option<bool> {
        match event {
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                backlog.push_back(self.delivery(publish));
                None
            }
            Ok(Event::Incoming(Incoming::SubAck(ack))) => {
                match self.take_suback_waiter() {
                    Some(waiter) => {
                        let _ = waiter.send(ack.return_codes);
                    }
                    None => debug!(pkid = ack.pkid, "unexpected SUBACK"),
                }
                None
            }
            Ok(Event::Incoming(Incoming::Disconnect)) => {
                warn!("broker sent disconnect");
                Some(true)
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                info!("disconnected from mqtt broker");
                Some(false)
            }
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "mqtt connection lost");
                Some(true)
            }
        }
    }

    fn delivery(&self, publish: Publish) -> Delivery {
        let message = InboundMessage::new(publish.topic.clone(), publish.payload.to_vec());
        let needs_ack = self.manual_acks && publish.qos != QoS::AtMostOnce;
        let ack: Box<dyn Acknowledge> = if needs_ack {
            Box::new(MqttAck {
                client: self.client.clone(),
                publish,
            })
        } else {
            Box::new(NoAck)
        };
        Delivery::new(message, ack)
    }

    fn take_suback_waiter(&self) -> Option<SubscribeReply> {
        self.suback.lock().ok().and_then(|mut slot| slot.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::Settings;

    #[test]
    fn options_from_settings() {
        let settings = Settings::from_toml_str(
            r#"
            [mqtt]
            host = "broker.local"
            port = 1884
            client_id = "ingest-1"
            username = "user"
            password = "secret"
            topics = "test/<sensorId>/measurements"
            keep_alive_secs = 15
            clean_session = true
            "#,
        )
        .unwrap();

        let options = mqtt_options(&settings.mqtt).unwrap();
        assert_eq!(options.broker_address(), ("broker.local".to_string(), 1884));
        assert_eq!(options.client_id(), "ingest-1");
        assert_eq!(options.keep_alive(), Duration::from_secs(15));
        assert!(options.clean_session());
        assert!(options.manual_acks());
        assert_eq!(options.credentials(), Some(("user".to_string(), "secret".to_string())));
    }

    #[test]
    fn tls_without_ca_is_rejected() {
        let mut settings = Settings::from_toml_str(
            r#"
            [mqtt]
            host = "broker.local"
            topics = "test/<sensorId>/measurements"
            "#,
        )
        .unwrap();
        settings.mqtt.use_tls = true;
        assert!(mqtt_options(&settings.mqtt).is_err());
    }

    #[test]
    fn suback_failure_code_fails_the_subscription() {
        let filters = vec!["a/+/m".to_string(), "b/+/+".to_string()];
        let granted = || SubscribeReasonCode::Success(QoS::AtLeastOnce);

        assert!(check_suback(&filters, &[granted(), granted()]).is_ok());

        let err = check_suback(&filters, &[granted(), SubscribeReasonCode::Failure]).unwrap_err();
        assert!(matches!(err, TransportError::SubscribeFailed { ref filter, .. } if filter == "b/+/+"));

        let err = check_suback(&filters, &[granted()]).unwrap_err();
        assert!(matches!(err, TransportError::SubscribeFailed { ref filter, .. } if filter == "b/+/+"));
    }

    #[test]
    fn qos_mapping() {
        assert_eq!(to_rumqttc(QualityOfService::AtMostOnce), QoS::AtMostOnce);
        assert_eq!(to_rumqttc(QualityOfService::AtLeastOnce), QoS::AtLeastOnce);
        assert_eq!(to_rumqttc(QualityOfService::ExactlyOnce), QoS::ExactlyOnce);
    }
}
