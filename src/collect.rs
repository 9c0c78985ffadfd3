use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::channel::{ChannelEvent, EventBus, Subscription};
use crate::error::{MusterError, Result};
use crate::job::{JobHandle, ResultValue};
use crate::probe::LiveProbe;
use crate::publish::{ControlPlane, Publisher};
use crate::registry::JobRunRegistry;

/// Tuning for one collection loop.
#[derive(Debug, Clone)]
pub struct CollectOptions {
    /// The collection window; each granted extension adds one more of these.
    pub timeout: Duration,
    /// Window for each liveness probe round.
    pub probe_timeout: Duration,
    /// Extensions this collection may consume; `None` means unlimited.
    pub extension_budget: Option<u32>,
    /// Floor on every poll wait, preventing a busy-spin when the deadline is
    /// nearly due.
    pub min_wait_quantum: Duration,
    /// Synthesize terminal no-response records for silent agents.
    pub expect_agents: bool,
    /// Aggregate returns as per-function maps (compound jobs).
    pub compound: bool,
}

/// What one iteration of a collection loop produced.
#[derive(Debug, Clone, PartialEq)]
pub enum CollectionEvent {
    /// An agent reported in; emitted in arrival order.
    Returned {
        agent_id: String,
        result: ResultValue,
    },
    /// A probe confirmed these agents still executing; the deadline was
    /// extended by one window.
    StillRunning { agents: BTreeSet<String> },
    /// Terminal record for an agent that never answered. Always emitted
    /// last, sorted by agent id.
    NoResponse { agent_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Collecting,
    Extending,
    Done,
}

/// Live state of one collection loop.
#[derive(Debug)]
pub struct CollectionState {
    pub job_id: String,
    /// Grows monotonically: roster pushes and late arrivals fold in.
    pub expected_agents: HashSet<String>,
    pub responded_agents: HashSet<String>,
    /// One entry per agent, last write wins on duplicate deliveries.
    pub aggregate_results: HashMap<String, ResultValue>,
    deadline: Instant,
    extensions: u32,
    phase: Phase,
}

/// One job's collection loop: the phase machine `Collecting -> Extending ->
/// Done` driving blocking, streaming, and interactive consumption over the
/// same underlying poll primitive.
///
/// Every `next_event` iteration performs exactly one of the loop steps:
/// recompute the deadline, poll the channel, fold an event, probe on
/// timeout, or drain terminal records. Once `Done` is reached the loop is a
/// no-op returning `None`.
pub struct Collection<'a, C> {
    publisher: &'a Publisher<C>,
    bus: &'a EventBus,
    registry: JobRunRegistry,
    sub: Subscription,
    state: CollectionState,
    opts: CollectOptions,
    pending: VecDeque<CollectionEvent>,
    cancel: CancellationToken,
}

impl<'a, C: ControlPlane> Collection<'a, C> {
    pub fn new(
        publisher: &'a Publisher<C>,
        bus: &'a EventBus,
        registry: JobRunRegistry,
        sub: Subscription,
        handle: JobHandle,
        opts: CollectOptions,
    ) -> Self {
        let state = CollectionState {
            job_id: handle.job_id,
            expected_agents: handle.expected_agents,
            responded_agents: HashSet::new(),
            aggregate_results: HashMap::new(),
            deadline: Instant::now() + opts.timeout,
            extensions: 0,
            phase: Phase::Collecting,
        };
        Self {
            publisher,
            bus,
            registry,
            sub,
            state,
            opts,
            pending: VecDeque::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.state.job_id
    }

    pub fn state(&self) -> &CollectionState {
        &self.state
    }

    pub fn is_done(&self) -> bool {
        self.state.phase == Phase::Done
    }

    /// Handle for caller-initiated cancellation (e.g. an interrupt signal in
    /// CLI mode). Cancelling surfaces `CollectionInterrupted` from the next
    /// iteration and keeps the registry entry for out-of-band lookup.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drive the loop until it is terminal and return the full aggregate.
    /// Agents that never responded are simply absent from the map.
    pub async fn wait(&mut self) -> Result<HashMap<String, ResultValue>> {
        while self.next_event().await?.is_some() {}
        Ok(self.state.aggregate_results.clone())
    }

    /// Streaming mode: the next `(agent_id, result)` in arrival order.
    /// Finite and not restartable; after exhaustion it only returns `None`.
    pub async fn next_return(&mut self) -> Result<Option<(String, ResultValue)>> {
        loop {
            match self.next_event().await? {
                Some(CollectionEvent::Returned { agent_id, result }) => {
                    return Ok(Some((agent_id, result)))
                }
                Some(_) => continue,
                None => return Ok(None),
            }
        }
    }

    /// Advance the loop by one step and surface whatever it produced.
    pub async fn next_event(&mut self) -> Result<Option<CollectionEvent>> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(self.interrupt());
            }
            match self.state.phase {
                Phase::Done => return Ok(self.pending.pop_front()),
                Phase::Collecting => {
                    let time_left = self
                        .state
                        .deadline
                        .saturating_duration_since(Instant::now());
                    if time_left.is_zero() {
                        self.state.phase = Phase::Extending;
                        continue;
                    }
                    let wait = time_left.max(self.opts.min_wait_quantum);
                    let cancel = self.cancel.clone();
                    let polled = tokio::select! {
                        _ = cancel.cancelled() => None,
                        event = self.sub.poll(wait) => Some(event),
                    };
                    let Some(event) = polled else {
                        return Err(self.interrupt());
                    };
                    match event {
                        None => continue,
                        Some(ChannelEvent::Roster { job_id, agents }) => {
                            if job_id != self.state.job_id {
                                continue;
                            }
                            tracing::debug!(
                                job_id = %self.state.job_id,
                                count = agents.len(),
                                "Late roster update"
                            );
                            self.registry
                                .extend_expected(&self.state.job_id, agents.iter().cloned());
                            self.state.expected_agents.extend(agents);
                            continue;
                        }
                        Some(ChannelEvent::Return(result)) => {
                            // The bus routes by job id already, but one
                            // shared transport carries many jobs; never
                            // trust the filter blindly.
                            if result.job_id != self.state.job_id {
                                tracing::debug!(
                                    job_id = %self.state.job_id,
                                    foreign = %result.job_id,
                                    "Discarding cross-job event"
                                );
                                continue;
                            }
                            let agent_id = result.agent_id.clone();
                            let value = self.aggregate(result.return_value);
                            self.state.expected_agents.insert(agent_id.clone());
                            self.state.responded_agents.insert(agent_id.clone());
                            self.state
                                .aggregate_results
                                .insert(agent_id.clone(), value.clone());
                            self.registry.mark_responded(&self.state.job_id, &agent_id);
                            tracing::debug!(
                                job_id = %self.state.job_id,
                                agent_id = %agent_id,
                                "Result collected"
                            );
                            if self.all_responded() {
                                self.finish();
                            }
                            return Ok(Some(CollectionEvent::Returned {
                                agent_id,
                                result: value,
                            }));
                        }
                    }
                }
                Phase::Extending => {
                    if let Some(budget) = self.opts.extension_budget {
                        if self.state.extensions >= budget {
                            tracing::debug!(
                                job_id = %self.state.job_id,
                                extensions = self.state.extensions,
                                "Extension budget exhausted"
                            );
                            self.finish();
                            continue;
                        }
                    }
                    let pending_agents: HashSet<String> = self
                        .state
                        .expected_agents
                        .difference(&self.state.responded_agents)
                        .cloned()
                        .collect();
                    let probe = LiveProbe::new(self.publisher, self.bus);
                    let cancel = self.cancel.clone();
                    let probed = tokio::select! {
                        _ = cancel.cancelled() => None,
                        confirmed = probe.probe(
                            &pending_agents,
                            &self.state.job_id,
                            self.opts.probe_timeout,
                        ) => Some(confirmed),
                    };
                    let Some(confirmed) = probed else {
                        return Err(self.interrupt());
                    };
                    if confirmed.is_empty() {
                        self.finish();
                        continue;
                    }
                    // At least one agent is still executing: grant exactly
                    // one more window, recomputed from now so extensions
                    // never compound.
                    self.registry
                        .extend_expected(&self.state.job_id, confirmed.iter().cloned());
                    self.state.expected_agents.extend(confirmed.iter().cloned());
                    self.state.extensions += 1;
                    self.state.deadline = Instant::now() + self.opts.timeout;
                    self.state.phase = Phase::Collecting;
                    tracing::info!(
                        job_id = %self.state.job_id,
                        still_running = confirmed.len(),
                        extension = self.state.extensions,
                        "Deadline extended, agents still running"
                    );
                    return Ok(Some(CollectionEvent::StillRunning {
                        agents: confirmed.into_iter().collect(),
                    }));
                }
            }
        }
    }

    fn all_responded(&self) -> bool {
        !self.state.expected_agents.is_empty()
            && self
                .state
                .responded_agents
                .is_superset(&self.state.expected_agents)
    }

    /// Decide the aggregate shape exactly once, here, so consumers never
    /// re-inspect the payload.
    fn aggregate(&self, value: Value) -> ResultValue {
        if self.opts.compound {
            match value {
                Value::Object(map) => ResultValue::Compound(map),
                other => {
                    tracing::warn!(
                        job_id = %self.state.job_id,
                        "Compound job returned an unbundled value"
                    );
                    ResultValue::Single(other)
                }
            }
        } else {
            ResultValue::Single(value)
        }
    }

    fn finish(&mut self) {
        self.state.phase = Phase::Done;
        self.sub.close();
        if self.opts.expect_agents {
            let mut missing: Vec<String> = self
                .state
                .expected_agents
                .difference(&self.state.responded_agents)
                .cloned()
                .collect();
            missing.sort();
            for agent_id in missing {
                self.pending
                    .push_back(CollectionEvent::NoResponse { agent_id });
            }
        }
        self.registry.remove(&self.state.job_id);
        tracing::debug!(job_id = %self.state.job_id, "Collection finished");
    }

    fn interrupt(&mut self) -> MusterError {
        // The registry entry stays so the job can be looked up later.
        self.sub.close();
        tracing::info!(job_id = %self.state.job_id, "Collection interrupted");
        MusterError::CollectionInterrupted {
            job_id: self.state.job_id.clone(),
        }
    }
}
