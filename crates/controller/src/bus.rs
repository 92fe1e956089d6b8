//! Message Bus Adapter: a thin dispatcher over an MQTT client (`rumqttc`)
//! that resolves topic-wildcard subscriptions to locally-registered
//! callbacks, republishes JSON at QoS 1, and re-subscribes everything on
//! every reconnect. Malformed payloads never reach a callback; a callback
//! that panics never takes down the receive loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Minimum/maximum reconnect backoff, per the bus adapter contract.
const RECONNECT_BACKOFF_MIN: Duration = Duration::from_secs(2);
const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(30);

pub type Callback = Arc<dyn Fn(String, Value) + Send + Sync>;

struct Subscription {
    pattern: String,
    callback: Callback,
}

pub struct BusAdapter {
    client: AsyncClient,
    subscriptions: Mutex<Vec<Subscription>>,
    dropped_payloads: AtomicU64,
}

impl BusAdapter {
    /// Build the adapter and its background event loop. The event loop must
    /// be driven by [`BusAdapter::run`] (typically `tokio::spawn`-ed) for
    /// anything — connect, subscribe, publish — to actually happen.
    pub fn connect(client_id: &str, host: &str, port: u16, keepalive: Duration) -> (Arc<Self>, EventLoop) {
        let mut opts = MqttOptions::new(client_id, host, port);
        opts.set_keep_alive(keepalive);
        opts.set_clean_session(false);
        let (client, eventloop) = AsyncClient::new(opts, 100);
        let adapter = Arc::new(Self {
            client,
            subscriptions: Mutex::new(Vec::new()),
            dropped_payloads: AtomicU64::new(0),
        });
        (adapter, eventloop)
    }

    /// Register `callback` for every inbound message whose topic matches
    /// `pattern` (`+`/`#` wildcards supported). Issues the subscribe now and
    /// again automatically on every reconnect.
    pub async fn subscribe<F>(&self, pattern: &str, callback: F) -> Result<()>
    where
        F: Fn(String, Value) + Send + Sync + 'static,
    {
        self.client
            .subscribe(pattern, QoS::AtLeastOnce)
            .await
            .with_context(|| format!("subscribing to {pattern}"))?;
        self.subscriptions.lock().await.push(Subscription {
            pattern: pattern.to_string(),
            callback: Arc::new(callback),
        });
        Ok(())
    }

    /// Serialize `value` as JSON and publish it at QoS 1.
    pub async fn publish_json(&self, topic: &str, value: &impl Serialize, retain: bool) -> Result<()> {
        let bytes = serde_json::to_vec(value).context("serializing publish payload")?;
        self.client
            .publish(topic, QoS::AtLeastOnce, retain, bytes)
            .await
            .with_context(|| format!("publishing to {topic}"))?;
        Ok(())
    }

    pub fn dropped_payload_count(&self) -> u64 {
        self.dropped_payloads.load(Ordering::Relaxed)
    }

    pub async fn disconnect(&self) {
        let _ = self.client.disconnect().await;
    }

    /// Decode `payload` as JSON and fan it out to every subscription whose
    /// pattern matches `topic`. Non-JSON payloads are dropped and counted,
    /// never reaching a callback. A callback that panics is caught so one
    /// broken handler cannot take down the whole receive loop.
    async fn dispatch(&self, topic: &str, payload: &[u8]) {
        let value: Value = match serde_json::from_slice(payload) {
            Ok(v) => v,
            Err(e) => {
                self.dropped_payloads.fetch_add(1, Ordering::Relaxed);
                warn!(topic, "malformed bus payload dropped: {e}");
                return;
            }
        };

        let subs = self.subscriptions.lock().await;
        for sub in subs.iter() {
            if !topic_matches(&sub.pattern, topic) {
                continue;
            }
            let callback = sub.callback.clone();
            let topic_owned = topic.to_string();
            let value_owned = value.clone();
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                (callback)(topic_owned, value_owned)
            }));
            if result.is_err() {
                error!(topic, "bus callback panicked — swallowed");
            }
        }
    }

    /// Drive the network event loop: reconnect with backoff, re-issue every
    /// subscription on each successful (re)connect, dispatch incoming
    /// publishes. Runs until cancelled (e.g. the task is aborted).
    pub async fn run(self: Arc<Self>, mut eventloop: EventLoop) {
        let mut backoff = RECONNECT_BACKOFF_MIN;
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    backoff = RECONNECT_BACKOFF_MIN;
                    info!("bus connected");
                    let subs = self.subscriptions.lock().await;
                    for sub in subs.iter() {
                        if let Err(e) = self.client.subscribe(&sub.pattern, QoS::AtLeastOnce).await {
                            error!(pattern = %sub.pattern, "re-subscribe failed: {e}");
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    self.dispatch(&p.topic, &p.payload).await;
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("bus disconnected");
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("bus error: {e} — reconnecting in {backoff:?}");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX);
                }
            }
        }
    }
}

/// MQTT-style topic matching: `+` matches exactly one level, `#` matches the
/// rest of the topic (must be the final pattern segment to be meaningful,
/// though this implementation treats it as a match-all from that point on
/// regardless of position, matching common broker behavior).
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let pattern_parts: Vec<&str> = pattern.split('/').collect();
    let topic_parts: Vec<&str> = topic.split('/').collect();
    match_parts(&pattern_parts, &topic_parts)
}

fn match_parts(pattern: &[&str], topic: &[&str]) -> bool {
    match (pattern.first(), topic.first()) {
        (None, None) => true,
        (None, Some(_)) => false,
        (Some(&"#"), _) => true,
        (Some(&"+"), Some(_)) => match_parts(&pattern[1..], &topic[1..]),
        (Some(a), Some(b)) if *a == *b => match_parts(&pattern[1..], &topic[1..]),
        _ => false,
    }
}
