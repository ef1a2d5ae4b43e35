//! MQTT rendition of the bus.
//!
//! Every value lives on `{root}/{service}/{path}` as a retained JSON payload
//! `{"value": ...}`. The four consumption outputs are written together as one
//! retained message on `{root}/{service}/Ac` so a reader never sees a mix of
//! old and new phases.
//!
//! The broker does not keep our subscriptions across a reconnect with a clean
//! session, nor our retained messages across a restart without persistence.
//! [`Session`] replays both after every reconnect, and drops the received
//! values while the connection is down so stale readings are never used.

use super::{BusAddress, ExternalSource, MetricStore, ServiceDirectory};
use crate::config::MqttConfig;
use crate::error::{AppError, Result};
use crate::power::format_watts;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use rumqttc::v5 as mqtt5;
use rumqttc::Transport;

pub type MqttOptions = mqtt5::MqttOptions;
pub type AsyncClient = mqtt5::AsyncClient;
pub type EventLoop = mqtt5::EventLoop;
pub type QoS = mqtt5::mqttbytes::QoS;

/// Topic carrying the atomic output batch, relative to the service prefix.
pub const BATCH_TOPIC: &str = "Ac";

pub fn build_options(address: &BusAddress, cfg: &MqttConfig) -> MqttOptions {
    let client_id = format!("{}-{}", cfg.client_id, Uuid::new_v4());
    let mut opts = MqttOptions::new(client_id, address.host.clone(), address.port);
    opts.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs));
    opts.set_clean_start(cfg.clean_session);
    if let (Some(u), Some(p)) = (&cfg.username, &cfg.password) {
        opts.set_credentials(u.clone(), p.clone());
    }
    if address.port == 8883 {
        opts.set_transport(Transport::tls_with_default_config());
    }
    opts
}

pub fn topic(root: &str, service: &str, path: &str) -> String {
    format!("{root}/{service}/{path}")
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Latest payload per received topic.
#[derive(Debug, Clone, Default)]
pub struct ValueTable {
    inner: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl ValueTable {
    /// An empty payload clears the topic, as an empty retained message does.
    pub fn insert(&self, topic: impl Into<String>, payload: &[u8]) {
        let topic = topic.into();
        let mut table = lock(&self.inner);
        if payload.is_empty() {
            table.remove(&topic);
        } else {
            table.insert(topic, payload.to_vec());
        }
    }

    pub fn get(&self, topic: &str) -> Option<Vec<u8>> {
        lock(&self.inner).get(topic).cloned()
    }

    /// True when any topic starts with `prefix`.
    pub fn has_prefix(&self, prefix: &str) -> bool {
        lock(&self.inner).keys().any(|t| t.starts_with(prefix))
    }

    pub fn clear(&self) {
        lock(&self.inner).clear();
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// State the client must restore after a reconnect.
#[derive(Debug, Clone, Default)]
pub struct BusState {
    values: ValueTable,
    filters: Arc<Mutex<BTreeSet<String>>>,
    retained: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl BusState {
    pub fn values(&self) -> &ValueTable {
        &self.values
    }

    pub fn add_filter(&self, filter: impl Into<String>) {
        lock(&self.filters).insert(filter.into());
    }

    /// Keep the latest retained payload we sent on `topic`.
    pub fn remember_retained(&self, topic: impl Into<String>, payload: Vec<u8>) {
        lock(&self.retained).insert(topic.into(), payload);
    }
}

/// What the event loop reports, reduced to what the bus reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    Connected,
    Message { topic: String, payload: Vec<u8> },
    Disconnected,
}

impl BusEvent {
    fn from_mqtt(event: mqtt5::Event) -> Option<Self> {
        match event {
            mqtt5::Event::Incoming(mqtt5::Incoming::ConnAck(_)) => Some(BusEvent::Connected),
            mqtt5::Event::Incoming(mqtt5::Incoming::Publish(p)) => {
                match std::str::from_utf8(&p.topic) {
                    Ok(topic) => Some(BusEvent::Message {
                        topic: topic.to_string(),
                        payload: p.payload.to_vec(),
                    }),
                    Err(_) => {
                        warn!(topic = ?p.topic, "non-utf8 topic; skipping message");
                        None
                    }
                }
            }
            mqtt5::Event::Incoming(mqtt5::Incoming::Disconnect(_)) => {
                Some(BusEvent::Disconnected)
            }
            _ => None,
        }
    }
}

/// Subscriptions and retained messages to send again on a new connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Replay {
    pub filters: Vec<String>,
    pub retained: Vec<(String, Vec<u8>)>,
}

/// Connection bookkeeping owned by the event-loop task.
#[derive(Debug)]
pub struct Session {
    state: BusState,
    connected_before: bool,
}

impl Session {
    pub fn new(state: BusState) -> Self {
        Self {
            state,
            connected_before: false,
        }
    }

    /// Apply `event`; returns what has to be re-sent after a reconnect.
    /// The first connection needs no replay: the requests queued by
    /// [`MqttBus::watch`] and the service registration are still pending.
    pub fn handle(&mut self, event: BusEvent) -> Option<Replay> {
        match event {
            BusEvent::Message { topic, payload } => {
                self.state.values.insert(topic, &payload);
                None
            }
            BusEvent::Disconnected => {
                self.state.values.clear();
                None
            }
            BusEvent::Connected if !self.connected_before => {
                self.connected_before = true;
                None
            }
            BusEvent::Connected => Some(Replay {
                filters: lock(&self.state.filters).iter().cloned().collect(),
                retained: lock(&self.state.retained)
                    .iter()
                    .map(|(t, p)| (t.clone(), p.clone()))
                    .collect(),
            }),
        }
    }
}

/// Connection to the broker plus the table of the latest payload per topic.
pub struct MqttBus {
    client: AsyncClient,
    root: String,
    state: BusState,
}

impl MqttBus {
    /// Create the client and spawn the task that drives its event loop.
    pub fn connect(options: MqttOptions, root: impl Into<String>) -> Self {
        let (client, eventloop) = AsyncClient::new(options, 64);
        let state = BusState::default();
        tokio::spawn(drive(eventloop, client.clone(), Session::new(state.clone())));
        Self {
            client,
            root: root.into(),
            state,
        }
    }

    /// Start receiving everything `service` publishes, now and after reconnects.
    pub async fn watch(&self, service: &str) -> Result<()> {
        let filter = topic(&self.root, service, "#");
        self.state.add_filter(filter.clone());
        self.client
            .subscribe(filter, QoS::AtLeastOnce)
            .await
            .map_err(|e| AppError::Mqtt(e.to_string()))
    }

    pub fn import(&self, service: &str, path: &str) -> MqttImport {
        MqttImport {
            values: self.state.values.clone(),
            service: service.to_string(),
            path: path.to_string(),
            topic: topic(&self.root, service, path),
        }
    }

    pub fn service(&self, name: &str) -> MqttService {
        MqttService {
            client: self.client.clone(),
            state: self.state.clone(),
            prefix: format!("{}/{}", self.root, name),
        }
    }
}

impl ServiceDirectory for MqttBus {
    fn exists(&self, service: &str) -> Result<bool> {
        Ok(self
            .state
            .values
            .has_prefix(&format!("{}/{}/", self.root, service)))
    }
}

async fn drive(mut eventloop: EventLoop, client: AsyncClient, mut session: Session) {
    loop {
        let event = match eventloop.poll().await {
            Ok(event) => BusEvent::from_mqtt(event),
            Err(e) => {
                warn!("mqtt error: {e}; reconnecting after short delay");
                session.handle(BusEvent::Disconnected);
                tokio::time::sleep(Duration::from_secs(2)).await;
                continue;
            }
        };
        let Some(replay) = event.and_then(|ev| session.handle(ev)) else {
            continue;
        };
        info!(
            filters = replay.filters.len(),
            retained = replay.retained.len(),
            "reconnected; restoring subscriptions"
        );
        // try_* only queue: this task is the one draining the request channel.
        for filter in replay.filters {
            if let Err(e) = client.try_subscribe(filter.clone(), QoS::AtLeastOnce) {
                warn!(filter = %filter, "resubscribe failed: {e}");
            }
        }
        for (topic, payload) in replay.retained {
            if let Err(e) = client.try_publish(topic.clone(), QoS::AtLeastOnce, true, payload) {
                warn!(topic = %topic, "republish failed: {e}");
            }
        }
    }
}

/// One imported value; reads the latest payload from the shared table.
pub struct MqttImport {
    values: ValueTable,
    service: String,
    path: String,
    topic: String,
}

impl ExternalSource for MqttImport {
    fn service(&self) -> &str {
        &self.service
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn get_value(&self) -> Result<Option<f64>> {
        match self.values.get(&self.topic) {
            None => Ok(None),
            Some(payload) => decode_value(&payload).map_err(|reason| AppError::Read {
                service: self.service.clone(),
                path: self.path.clone(),
                reason,
            }),
        }
    }
}

/// Accepts `{"value": n}`, `{"value": null}` or a bare number.
pub fn decode_value(payload: &[u8]) -> std::result::Result<Option<f64>, String> {
    let v: Value = serde_json::from_slice(payload).map_err(|e| e.to_string())?;
    let inner = match &v {
        Value::Object(obj) => obj.get("value").unwrap_or(&Value::Null),
        other => other,
    };
    match inner {
        Value::Null => Ok(None),
        Value::Number(n) => n
            .as_f64()
            .map(Some)
            .ok_or_else(|| format!("unrepresentable number {n}")),
        other => Err(format!("not a number: {other}")),
    }
}

/// The published consumption service.
pub struct MqttService {
    client: AsyncClient,
    state: BusState,
    prefix: String,
}

impl MqttService {
    fn send(&self, path: &str, payload: &Value) -> Result<()> {
        let topic = format!("{}/{}", self.prefix, path);
        let body = serde_json::to_vec(payload)?;
        self.state.remember_retained(topic.clone(), body.clone());
        self.client
            .try_publish(topic, QoS::AtLeastOnce, true, body)
            .map_err(|e| AppError::Publish(e.to_string()))
    }
}

impl MetricStore for MqttService {
    fn register(&self, identity: &[(String, Value)], outputs: &[&str]) -> Result<()> {
        for (path, value) in identity {
            self.send(path, &json!({ "value": value }))
                .map_err(|e| AppError::Registration(format!("{path}: {e}")))?;
        }
        let zeros: Vec<(&str, f64)> = outputs.iter().map(|p| (*p, 0.0)).collect();
        self.publish(&zeros)
            .map_err(|e| AppError::Registration(e.to_string()))?;
        debug!(prefix = %self.prefix, fields = identity.len(), "service registered");
        Ok(())
    }

    fn publish(&self, values: &[(&str, f64)]) -> Result<()> {
        self.send(BATCH_TOPIC, &batch_payload(values))
    }
}

pub fn batch_payload(values: &[(&str, f64)]) -> Value {
    let mut obj = Map::new();
    for (path, w) in values {
        obj.insert(
            path.to_string(),
            json!({ "value": w, "text": format_watts(*w) }),
        );
    }
    Value::Object(obj)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusScope;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_decode_value() {
        assert_eq!(decode_value(br#"{"value": 1715}"#), Ok(Some(1715.0)));
        assert_eq!(decode_value(br#"{"value": -23.5}"#), Ok(Some(-23.5)));
        assert_eq!(decode_value(br#"{"value": null}"#), Ok(None));
        assert_eq!(decode_value(br#"{}"#), Ok(None));
        assert_eq!(decode_value(b"400"), Ok(Some(400.0)));
        assert!(decode_value(br#"{"value": "high"}"#).is_err());
        assert!(decode_value(b"not json").is_err());
    }

    #[test]
    fn test_batch_payload() {
        let payload = batch_payload(&[("Ac/Power", 702.0), ("Ac/L2/Power", 0.0)]);
        assert_eq!(
            payload,
            json!({
                "Ac/Power": { "value": 702.0, "text": "702.0 W" },
                "Ac/L2/Power": { "value": 0.0, "text": "0.0 W" },
            })
        );
    }

    #[test]
    fn test_topic_layout() {
        assert_eq!(
            topic("venus", "com.victronenergy.grid.meter", "Ac/L1/Power"),
            "venus/com.victronenergy.grid.meter/Ac/L1/Power"
        );
    }

    #[test]
    fn test_build_options() {
        let cfg = MqttConfig::default();
        let address = BusAddress {
            scope: BusScope::System,
            host: "broker".into(),
            port: 1883,
        };
        let opts = build_options(&address, &cfg);
        assert!(opts.client_id().starts_with("consumption-calc-"));
        assert_eq!(opts.keep_alive(), Duration::from_secs(30));
    }

    fn import(values: &ValueTable, service: &str, path: &str) -> MqttImport {
        MqttImport {
            values: values.clone(),
            service: service.to_string(),
            path: path.to_string(),
            topic: topic("venus", service, path),
        }
    }

    #[test]
    fn test_value_table_prefix_needs_full_service_name() {
        let table = ValueTable::default();
        table.insert("venus/svc2/Ac/Power", br#"{"value": 1}"#);

        assert!(table.has_prefix("venus/svc2/"));
        assert!(!table.has_prefix("venus/svc/"));
    }

    #[test]
    fn test_value_table_empty_payload_clears_topic() {
        let table = ValueTable::default();
        table.insert("venus/grid/Ac/Power", br#"{"value": 10}"#);
        assert!(table.get("venus/grid/Ac/Power").is_some());

        table.insert("venus/grid/Ac/Power", b"");
        assert_eq!(table.get("venus/grid/Ac/Power"), None);
        assert!(table.is_empty());
    }

    #[test]
    fn test_import_reads_latest_value() {
        let table = ValueTable::default();
        let src = import(&table, "grid", "Ac/Power");
        assert_eq!(src.get_value().unwrap(), None);

        table.insert("venus/grid/Ac/Power", br#"{"value": -2300}"#);
        assert_eq!(src.get_value().unwrap(), Some(-2300.0));
        table.insert("venus/grid/Ac/Power", br#"{"value": null}"#);
        assert_eq!(src.get_value().unwrap(), None);
    }

    #[test]
    fn test_import_non_numeric_payload_is_read_error() {
        let table = ValueTable::default();
        let src = import(&table, "pv", "Ac/L1/Power");
        table.insert("venus/pv/Ac/L1/Power", br#"{"value": "offline"}"#);

        match src.get_value() {
            Err(AppError::Read { service, path, .. }) => {
                assert_eq!(service, "pv");
                assert_eq!(path, "Ac/L1/Power");
            }
            other => panic!("expected read error, got {other:?}"),
        }
    }

    #[test]
    fn test_session_stores_messages() {
        let state = BusState::default();
        let mut session = Session::new(state.clone());
        let replay = session.handle(BusEvent::Message {
            topic: "venus/grid/Ac/Power".into(),
            payload: br#"{"value": 5}"#.to_vec(),
        });

        assert_eq!(replay, None);
        assert!(state.values().has_prefix("venus/grid/"));
    }

    #[test]
    fn test_first_connect_needs_no_replay() {
        let state = BusState::default();
        state.add_filter("venus/grid/#");
        let mut session = Session::new(state);
        assert_eq!(session.handle(BusEvent::Connected), None);
    }

    #[test]
    fn test_reconnect_drops_stale_values_and_restores_subscriptions() {
        let state = BusState::default();
        state.add_filter("venus/grid/#");
        state.add_filter("venus/pv/#");
        state.remember_retained("venus/calc/Role", br#"{"value":"acload"}"#.to_vec());
        let mut session = Session::new(state.clone());
        let grid = import(state.values(), "grid", "Ac/Power");

        session.handle(BusEvent::Connected);
        session.handle(BusEvent::Message {
            topic: "venus/grid/Ac/Power".into(),
            payload: br#"{"value": 1715}"#.to_vec(),
        });
        assert_eq!(grid.get_value().unwrap(), Some(1715.0));

        // Connection lost: readings must not be served from before the outage
        session.handle(BusEvent::Disconnected);
        assert_eq!(grid.get_value().unwrap(), None);

        let replay = session.handle(BusEvent::Connected).unwrap();
        assert_eq!(
            replay,
            Replay {
                filters: vec!["venus/grid/#".into(), "venus/pv/#".into()],
                retained: vec![(
                    "venus/calc/Role".into(),
                    br#"{"value":"acload"}"#.to_vec()
                )],
            }
        );
    }

    #[test]
    fn test_retained_keeps_latest_payload_per_topic() {
        let state = BusState::default();
        state.remember_retained("venus/calc/Ac", b"old".to_vec());
        state.remember_retained("venus/calc/Ac", b"new".to_vec());
        let mut session = Session::new(state);
        session.handle(BusEvent::Connected);

        let replay = session.handle(BusEvent::Connected).unwrap();
        assert_eq!(
            replay.retained,
            vec![("venus/calc/Ac".to_string(), b"new".to_vec())]
        );
    }
}
