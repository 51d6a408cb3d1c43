use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use sensor_ingest::service::delivery_channel;
use sensor_ingest::transport::Acknowledge;
use sensor_ingest::{
    BrokerTransport, ConnectionState, Delivery, InMemorySensorStore, InboundMessage, IngestService,
    QualityOfService, Settings, TransportError,
};

#[derive(Default)]
struct FakeBroker {
    connected: AtomicBool,
    subscriptions: Mutex<Vec<String>>,
    disconnects: AtomicUsize,
}

#[async_trait]
impl BrokerTransport for FakeBroker {
    async fn connect(&self) -> Result<(), TransportError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, filters: &[String], _qos: QualityOfService) -> Result<(), TransportError> {
        self.subscriptions.lock().unwrap().extend(filters.iter().cloned());
        Ok(())
    }

    async fn probe(&self) -> Result<bool, TransportError> {
        Ok(self.connected.load(Ordering::SeqCst))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct CountingAck(Arc<AtomicUsize>);

#[async_trait]
impl Acknowledge for CountingAck {
    async fn ack(self: Box<Self>) -> Result<(), TransportError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn publish(tx: &mpsc::Sender<Delivery>, acks: &Arc<AtomicUsize>, topic: &str, payload: &str) {
    let message = InboundMessage::new(topic, payload.as_bytes().to_vec());
    tx.send(Delivery::new(message, Box::new(CountingAck(Arc::clone(acks)))))
        .await
        .unwrap();
}

const SETTINGS: &str = r#"
    [mqtt]
    host = "localhost"
    topics = "Aranetest/+/sensors/<sensorId>/json/measurements, Aranetest/+/sensors/<sensorId>/<metadataName>"

    [ingest]
    keepalive_interval_ms = 50
    watch_retry_interval_ms = 20
"#;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn service_stores_gates_and_shuts_down() {
    let settings = Settings::from_toml_str(SETTINGS).unwrap();
    let store = Arc::new(InMemorySensorStore::new());
    store.set_active("dead", false).unwrap();

    let broker = Arc::new(FakeBroker::default());
    let cancel = CancellationToken::new();
    let (tx, rx) = delivery_channel(&settings);

    let service = IngestService::new(settings, store.clone(), broker.clone(), rx, cancel.clone()).unwrap();
    let cache = service.cache();
    let connection = service.connection();
    let shutdown = service.shutdown_handle();
    let running = tokio::spawn(service.run());

    wait_until("cache load", || cache.is_loaded()).await;
    wait_until("connected", || connection.state() == ConnectionState::Connected).await;
    assert_eq!(
        *broker.subscriptions.lock().unwrap(),
        vec![
            "Aranetest/+/sensors/+/json/measurements".to_string(),
            "Aranetest/+/sensors/+/+".to_string()
        ]
    );

    let acks = Arc::new(AtomicUsize::new(0));
    publish(&tx, &acks, "Aranetest/1/sensors/3002FA/json/measurements", r#"{"time":"1729716854","co2":415}"#).await;
    publish(&tx, &acks, "Aranetest/1/sensors/3002FA/name", "Kitchen").await;
    publish(&tx, &acks, "Aranetest/1/sensors/dead/name", "Ghost").await;
    publish(&tx, &acks, "unrelated/topic", "{}").await;
    wait_until("four acks", || acks.load(Ordering::SeqCst) == 4).await;

    let sensor = store.sensor("3002FA").unwrap().unwrap();
    assert_eq!(sensor.topics.len(), 2);
    assert_eq!(sensor.metadata.get("name").and_then(|v| v.as_str()), Some("Kitchen"));
    assert_eq!(sensor.latest_measurement_timestamp.map(|t| t.timestamp()), Some(1_729_716_854));
    assert!(store.sensor("dead").unwrap().unwrap().metadata.is_empty());

    // Deactivate a sensor while running; its next message is skipped.
    store.set_active("3002FA", false).unwrap();
    wait_until("deactivation", || cache.is_inactive("3002FA")).await;
    publish(&tx, &acks, "Aranetest/1/sensors/3002FA/json/measurements", r#"{"time":"1729716900","co2":500}"#).await;
    wait_until("fifth ack", || acks.load(Ordering::SeqCst) == 5).await;
    assert_eq!(store.measurements("3002FA").unwrap().len(), 1);

    shutdown.shutdown().await;
    let stats = running.await.unwrap().unwrap();

    assert_eq!(stats.dispatched, 5);
    assert_eq!(stats.acked, 5);
    assert_eq!(stats.unacked, 0);
    assert!(broker.disconnects.load(Ordering::SeqCst) >= 1);
    assert!(cancel.is_cancelled());
    assert_eq!(connection.state(), ConnectionState::Disconnected);
    assert!(!cache.is_loaded());
}

#[tokio::test]
async fn invalid_settings_fail_before_start() {
    let mut settings = Settings::from_toml_str(SETTINGS).unwrap();
    settings.mqtt.topics = "Aranetest/+/sensors/+/json/measurements".to_string();

    let (_tx, rx) = delivery_channel(&settings);
    let result = IngestService::new(
        settings,
        Arc::new(InMemorySensorStore::new()),
        Arc::new(FakeBroker::default()),
        rx,
        CancellationToken::new(),
    );
    assert!(result.is_err());
}
