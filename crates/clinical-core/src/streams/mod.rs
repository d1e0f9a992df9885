//! Encounter delta stream hub (component F).
//!
//! A transport-agnostic coalescing/rate-limiting fan-out: callers `publish`
//! JSON deltas for an encounter, subscribers receive at most one flush per
//! `min_interval`, always the latest pending payload, with the most recent
//! snapshot replayed immediately on subscribe. The actual WebSocket framing
//! lives in the server crate; this hub only owns the per-encounter queueing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

use crate::error::StreamError;

/// A live subscription: an id (for later [`StreamHub::unsubscribe`]) and the
/// receiving half of the channel the hub pushes flushed events into.
pub struct Subscription {
    pub id: u64,
    pub receiver: mpsc::UnboundedReceiver<Value>,
}

struct Subscriber {
    id: u64,
    sender: mpsc::UnboundedSender<Value>,
}

#[derive(Default)]
struct EncounterState {
    subscribers: Vec<Subscriber>,
    last_event_id: u64,
    last_payload: Option<Value>,
    last_fingerprint: Option<String>,
    last_sent: Option<Instant>,
    pending: Option<Value>,
    pending_fingerprint: Option<String>,
    flush_scheduled: bool,
}

/// One named channel's (e.g. `"codes"`, `"compliance"`, `"compose"`)
/// per-encounter delta hub (spec §4.6).
pub struct StreamHub {
    channel: String,
    min_interval: Duration,
    states: RwLock<HashMap<String, Arc<Mutex<EncounterState>>>>,
    next_subscriber_id: AtomicU64,
}

impl StreamHub {
    pub fn new(channel: impl Into<String>, min_interval: Duration) -> Self {
        Self {
            channel: channel.into(),
            min_interval,
            states: RwLock::new(HashMap::new()),
            next_subscriber_id: AtomicU64::new(1),
        }
    }

    fn state_for(&self, encounter_id: &str) -> Arc<Mutex<EncounterState>> {
        if let Some(state) = self.states.read().unwrap().get(encounter_id) {
            return state.clone();
        }
        let mut states = self.states.write().unwrap();
        states
            .entry(encounter_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(EncounterState::default())))
            .clone()
    }

    /// Register a subscriber for `encounter_id`. If a payload has already
    /// been flushed for this encounter, the snapshot is pushed onto the
    /// returned channel immediately, before any future flush can interleave.
    pub async fn subscribe(&self, encounter_id: &str) -> Result<Subscription, StreamError> {
        if encounter_id.is_empty() {
            return Err(StreamError::MissingEncounterId);
        }
        let state = self.state_for(encounter_id);
        let id = self.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();

        let mut guard = state.lock().await;
        if let Some(snapshot) = guard.last_payload.clone() {
            let _ = tx.send(snapshot);
        }
        guard.subscribers.push(Subscriber { id, sender: tx });
        drop(guard);

        tracing::debug!(channel = %self.channel, encounter_id, subscriber_id = id, "subscriber joined");
        Ok(Subscription { id, receiver: rx })
    }

    pub async fn unsubscribe(&self, encounter_id: &str, subscriber_id: u64) {
        let state = self.state_for(encounter_id);
        let mut guard = state.lock().await;
        guard.subscribers.retain(|s| s.id != subscriber_id);
        tracing::debug!(channel = %self.channel, encounter_id, subscriber_id, "subscriber left");
    }

    /// Queue `payload` for `encounter_id`. Identical-fingerprint payloads are
    /// suppressed; otherwise the payload flushes immediately if the rate
    /// limit allows it or there are no subscribers yet, and is otherwise
    /// coalesced into a single delayed flush.
    pub async fn publish(self: &Arc<Self>, encounter_id: &str, payload: Value) -> Result<(), StreamError> {
        if encounter_id.is_empty() {
            return Err(StreamError::MissingEncounterId);
        }
        let fingerprint = fingerprint(&payload);
        let state = self.state_for(encounter_id);
        let mut guard = state.lock().await;

        if guard.pending.is_none() && guard.last_fingerprint.as_deref() == Some(fingerprint.as_str()) {
            return Ok(());
        }
        if guard.pending_fingerprint.as_deref() == Some(fingerprint.as_str()) {
            return Ok(());
        }

        guard.pending = Some(payload);
        guard.pending_fingerprint = Some(fingerprint);

        let delay = compute_delay(guard.last_sent, self.min_interval);
        let has_subscribers = !guard.subscribers.is_empty();

        if delay.is_zero() || !has_subscribers {
            self.flush_locked(&mut guard, encounter_id);
        } else if !guard.flush_scheduled {
            guard.flush_scheduled = true;
            let hub = self.clone();
            let encounter_id = encounter_id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let state = hub.state_for(&encounter_id);
                let mut guard = state.lock().await;
                guard.flush_scheduled = false;
                hub.flush_locked(&mut guard, &encounter_id);
            });
        }

        Ok(())
    }

    /// Move `pending` into `last_*`, stamp it with routing metadata, and
    /// deliver to every live subscriber, dropping any whose channel is closed.
    fn flush_locked(&self, state: &mut EncounterState, encounter_id: &str) {
        let Some(payload) = state.pending.take() else {
            state.pending_fingerprint = None;
            return;
        };
        let pending_fingerprint = state.pending_fingerprint.take();
        let payload_fingerprint = pending_fingerprint.unwrap_or_else(|| fingerprint(&payload));

        if state.last_fingerprint.as_deref() == Some(payload_fingerprint.as_str()) && state.last_payload.is_some() {
            return;
        }

        state.last_event_id += 1;
        let event = envelope(payload, encounter_id, &self.channel, state.last_event_id);

        state.last_payload = Some(event.clone());
        state.last_fingerprint = Some(payload_fingerprint);
        state.last_sent = Some(Instant::now());

        state.subscribers.retain(|subscriber| subscriber.sender.send(event.clone()).is_ok());
        tracing::debug!(
            channel = %self.channel,
            encounter_id,
            event_id = state.last_event_id,
            subscriber_count = state.subscribers.len(),
            "flushed encounter delta"
        );
    }
}

fn compute_delay(last_sent: Option<Instant>, min_interval: Duration) -> Duration {
    let Some(last_sent) = last_sent else {
        return Duration::ZERO;
    };
    let elapsed = last_sent.elapsed();
    min_interval.saturating_sub(elapsed)
}

/// Stamp `type` (defaulted to the channel name when absent), `encounterId`,
/// `channel`, and `eventId` onto the payload, wrapping non-object payloads
/// under a `data` key first.
fn envelope(payload: Value, encounter_id: &str, channel: &str, event_id: u64) -> Value {
    let mut object = match payload {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("data".to_string(), other);
            map
        }
    };
    object
        .entry("type".to_string())
        .or_insert_with(|| Value::String(channel.to_string()));
    object.insert("encounterId".to_string(), Value::String(encounter_id.to_string()));
    object.insert("channel".to_string(), Value::String(channel.to_string()));
    object.insert("eventId".to_string(), Value::Number(event_id.into()));
    Value::Object(object)
}

/// Canonical (sorted-key) JSON hash, used as a cheap equality fingerprint for
/// coalescing repeated publishes.
fn fingerprint(value: &Value) -> String {
    let canonical = serde_json::to_string(&sort_keys(value)).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted = Map::new();
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                sorted.insert(key.clone(), sort_keys(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration as StdDuration;

    fn hub(min_interval_ms: u64) -> Arc<StreamHub> {
        Arc::new(StreamHub::new("codes", StdDuration::from_millis(min_interval_ms)))
    }

    #[tokio::test]
    async fn subscribe_without_encounter_id_errors() {
        let hub = hub(500);
        let err = hub.subscribe("").await.unwrap_err();
        assert!(matches!(err, StreamError::MissingEncounterId));
    }

    #[tokio::test]
    async fn first_publish_with_no_prior_state_flushes_immediately() {
        let hub = hub(500);
        let mut sub = hub.subscribe("enc-1").await.unwrap();
        hub.publish("enc-1", json!({"codes": ["99213"]})).await.unwrap();

        let event = sub.receiver.recv().await.unwrap();
        assert_eq!(event["encounterId"], "enc-1");
        assert_eq!(event["channel"], "codes");
        assert_eq!(event["eventId"], 1);
        assert_eq!(event["codes"], json!(["99213"]));
    }

    #[tokio::test]
    async fn late_subscriber_receives_last_snapshot_immediately() {
        let hub = hub(500);
        hub.publish("enc-2", json!({"codes": ["99213"]})).await.unwrap();
        // Give the immediate flush (no prior subscribers) a moment to land.
        tokio::time::sleep(StdDuration::from_millis(10)).await;

        let mut sub = hub.subscribe("enc-2").await.unwrap();
        let event = sub.receiver.recv().await.unwrap();
        assert_eq!(event["eventId"], 1);
    }

    #[tokio::test]
    async fn identical_payload_is_suppressed() {
        let hub = hub(0);
        let mut sub = hub.subscribe("enc-3").await.unwrap();
        hub.publish("enc-3", json!({"codes": ["99213"]})).await.unwrap();
        hub.publish("enc-3", json!({"codes": ["99213"]})).await.unwrap();

        let first = sub.receiver.recv().await.unwrap();
        assert_eq!(first["eventId"], 1);
        let second = tokio::time::timeout(StdDuration::from_millis(50), sub.receiver.recv()).await;
        assert!(second.is_err(), "duplicate payload must not produce a second event");
    }

    #[tokio::test]
    async fn rapid_publishes_coalesce_into_one_delayed_flush() {
        let hub = hub(200);
        let mut sub = hub.subscribe("enc-4").await.unwrap();
        hub.publish("enc-4", json!({"codes": ["A"]})).await.unwrap();
        let first = sub.receiver.recv().await.unwrap();
        assert_eq!(first["codes"], json!(["A"]));

        hub.publish("enc-4", json!({"codes": ["B"]})).await.unwrap();
        hub.publish("enc-4", json!({"codes": ["C"]})).await.unwrap();

        let second = sub.receiver.recv().await.unwrap();
        assert_eq!(second["codes"], json!(["C"]));
        assert_eq!(second["eventId"], 2);
    }

    #[tokio::test]
    async fn unsubscribe_stops_further_delivery() {
        let hub = hub(0);
        let sub = hub.subscribe("enc-5").await.unwrap();
        hub.unsubscribe("enc-5", sub.id).await;
        hub.publish("enc-5", json!({"codes": ["99213"]})).await.unwrap();

        let mut receiver = sub.receiver;
        let result = tokio::time::timeout(StdDuration::from_millis(50), receiver.recv()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn non_object_payload_is_wrapped_under_data() {
        let hub = hub(0);
        let mut sub = hub.subscribe("enc-6").await.unwrap();
        hub.publish("enc-6", json!(["a", "b"])).await.unwrap();
        let event = sub.receiver.recv().await.unwrap();
        assert_eq!(event["data"], json!(["a", "b"]));
        assert_eq!(event["type"], "codes");
    }
}
