use std::collections::HashSet;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use crate::channel::{ChannelEvent, EventBus};
use crate::jid::gen_jid;
use crate::job::{FunctionCall, JobRequest};
use crate::publish::{ControlPlane, Publisher};
use crate::target::{Target, TargetType};

/// Remote function agents answer with their record of a job they are still
/// executing. A truthy reply means "still running".
pub const PROBE_FUNCTION: &str = "sys.find_job";

/// Out-of-band "is job X still running?" query against pending agents.
///
/// Probing is best-effort by contract: publish failures and silent agents
/// both degrade to "nobody confirmed", never to an error, so a hung probe
/// can never stall the extension decision past its own short window.
pub struct LiveProbe<'a, C> {
    publisher: &'a Publisher<C>,
    bus: &'a EventBus,
}

impl<'a, C: ControlPlane> LiveProbe<'a, C> {
    pub fn new(publisher: &'a Publisher<C>, bus: &'a EventBus) -> Self {
        Self { publisher, bus }
    }

    /// Ask each agent in `agents` whether `job_id` is still executing.
    /// Returns the agents that answered truthily within `window`; agents not
    /// originally queried that report in are included, since target
    /// prediction is best-effort.
    pub async fn probe(
        &self,
        agents: &HashSet<String>,
        job_id: &str,
        window: Duration,
    ) -> HashSet<String> {
        let mut confirmed = HashSet::new();
        if agents.is_empty() {
            return confirmed;
        }

        let mut queried: Vec<String> = agents.iter().cloned().collect();
        queried.sort();
        let probe_jid = gen_jid();
        let mut sub = self.bus.subscribe(&probe_jid);

        let request = JobRequest::new(
            Target::List(queried),
            TargetType::List,
            FunctionCall::single(PROBE_FUNCTION, vec![Value::String(job_id.to_string())]),
        );
        let handle = match self
            .publisher
            .publish(&request, &request.target, request.target_type, &probe_jid, window)
            .await
        {
            Ok(handle) => handle,
            Err(err) => {
                tracing::warn!(job_id, error = %err, "Liveness probe publish failed");
                sub.close();
                return confirmed;
            }
        };
        if handle.is_no_match() {
            sub.close();
            return confirmed;
        }

        let deadline = Instant::now() + window;
        let mut replied: HashSet<String> = HashSet::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match sub.poll(remaining).await {
                Some(ChannelEvent::Return(result)) => {
                    if is_truthy(&result.return_value) {
                        tracing::debug!(
                            job_id,
                            agent_id = %result.agent_id,
                            "Agent still running the job"
                        );
                        confirmed.insert(result.agent_id.clone());
                    }
                    replied.insert(result.agent_id);
                    // Every queried agent has spoken, no point waiting out
                    // the window.
                    if handle.expected_agents.is_subset(&replied) {
                        break;
                    }
                }
                Some(ChannelEvent::Roster { .. }) => continue,
                None => break,
            }
        }
        sub.close();
        confirmed
    }
}

/// A probe reply counts only if it carries actual job information; empty
/// containers mean "not running here".
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}
