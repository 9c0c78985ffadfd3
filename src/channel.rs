use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration, Instant};

use crate::job::AgentResult;

/// One event delivered to a collection loop.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// An agent reported a result.
    Return(AgentResult),
    /// A late membership update: more agents are expected to answer.
    Roster { job_id: String, agents: Vec<String> },
}

struct SubEntry {
    tx: mpsc::UnboundedSender<Value>,
    rx: Weak<tokio::sync::Mutex<mpsc::UnboundedReceiver<Value>>>,
}

#[derive(Default)]
struct BusInner {
    subs: Mutex<HashMap<String, SubEntry>>,
}

/// Shared, multiplexed event feed.
///
/// Transport adapters push raw frames in with [`EventBus::inject`]; each
/// in-flight job holds one [`Subscription`] keyed by its job id. Many
/// subscriptions share the one bus, so concurrently-running collection loops
/// interleave freely on the wire.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in frames for `job_id`. Subscribing twice for the
    /// same job id is idempotent: the second handle shares the first's queue
    /// rather than registering a new listener.
    pub fn subscribe(&self, job_id: &str) -> Subscription {
        let mut subs = self.inner.subs.lock().expect("bus lock poisoned");
        if let Some(entry) = subs.get(job_id) {
            if let Some(rx) = entry.rx.upgrade() {
                return Subscription {
                    bus: self.clone(),
                    job_id: job_id.to_string(),
                    rx,
                    closed: false,
                };
            }
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        subs.insert(
            job_id.to_string(),
            SubEntry {
                tx,
                rx: Arc::downgrade(&rx),
            },
        );
        Subscription {
            bus: self.clone(),
            job_id: job_id.to_string(),
            rx,
            closed: false,
        }
    }

    /// Deliver a raw frame from the transport. Frames without a `jid`, or
    /// with a jid nobody subscribed to, are dropped.
    pub fn inject(&self, frame: Value) {
        let Some(jid) = frame.get("jid").and_then(Value::as_str) else {
            tracing::warn!("Dropping frame without a jid");
            return;
        };
        let subs = self.inner.subs.lock().expect("bus lock poisoned");
        match subs.get(jid) {
            Some(entry) => {
                // Receiver gone means the subscription was dropped without
                // close(); the send failure is harmless.
                let _ = entry.tx.send(frame);
            }
            None => {
                tracing::trace!(job_id = jid, "No subscriber for frame");
            }
        }
    }

    /// Number of live subscriptions, for diagnostics and leak tests.
    pub fn subscription_count(&self) -> usize {
        self.inner.subs.lock().expect("bus lock poisoned").len()
    }

    fn unsubscribe(&self, job_id: &str) {
        self.inner
            .subs
            .lock()
            .expect("bus lock poisoned")
            .remove(job_id);
    }
}

/// The polling end of one job's event feed. The only suspension point in a
/// collection loop besides the liveness probe.
pub struct Subscription {
    bus: EventBus,
    job_id: String,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Value>>>,
    closed: bool,
}

impl Subscription {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Wait up to `max_wait` for the next parseable event. Returns `None` on
    /// timeout; a plain timeout is never an error. Malformed frames are
    /// dropped with a warning and polling continues within the window.
    pub async fn poll(&mut self, max_wait: Duration) -> Option<ChannelEvent> {
        if self.closed {
            return None;
        }
        let deadline = Instant::now() + max_wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let frame = {
                let rx = Arc::clone(&self.rx);
                match timeout(remaining, async move { rx.lock().await.recv().await }).await {
                    Ok(Some(frame)) => frame,
                    // Sender side gone: behave like a quiet channel until the
                    // window closes.
                    Ok(None) => {
                        tokio::time::sleep(remaining).await;
                        return None;
                    }
                    Err(_) => return None,
                }
            };
            match parse_frame(&frame) {
                Some(event) => return Some(event),
                None => continue,
            }
        }
    }

    /// Tear down the bus registration. Safe to call repeatedly; also runs on
    /// drop so every exit path releases the subscription.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.bus.unsubscribe(&self.job_id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

/// Parse one raw frame. Tolerant by design: one bad frame must never crash a
/// collection loop, so anything unrecognizable maps to `None`.
fn parse_frame(frame: &Value) -> Option<ChannelEvent> {
    let jid = frame.get("jid").and_then(Value::as_str)?.to_string();

    if let Some(minions) = frame
        .get("data")
        .and_then(|d| d.get("minions"))
        .and_then(Value::as_array)
    {
        return Some(ChannelEvent::Roster {
            job_id: jid,
            agents: string_list(minions),
        });
    }
    if let Some(syndic) = frame.get("syndic").and_then(Value::as_array) {
        return Some(ChannelEvent::Roster {
            job_id: jid,
            agents: string_list(syndic),
        });
    }

    let Some(ret) = frame.get("return") else {
        tracing::debug!(job_id = %jid, "Frame carries no return, skipping");
        return None;
    };
    let Some(id) = frame.get("id").and_then(Value::as_str) else {
        tracing::warn!(job_id = %jid, "Dropping malformed return frame without agent id");
        return None;
    };

    Some(ChannelEvent::Return(AgentResult {
        agent_id: id.to_string(),
        job_id: jid,
        return_value: ret.clone(),
        success: frame.get("success").and_then(Value::as_bool).unwrap_or(false),
        output_format_hint: frame
            .get("out")
            .and_then(Value::as_str)
            .map(str::to_string),
    }))
}

fn string_list(values: &[Value]) -> Vec<String> {
    values
        .iter()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect()
}
