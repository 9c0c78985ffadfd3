use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::channel::{EventBus, Subscription};
use crate::collect::{CollectOptions, Collection};
use crate::config::ClientConfig;
use crate::error::Result;
use crate::jid::gen_jid;
use crate::job::{JobHandle, JobRequest, ResultValue};
use crate::publish::{ControlPlane, FileKeySource, KeySource, Publisher};
use crate::registry::{JobRecord, JobRunRegistry};
use crate::target::{self, RangeService, Target};

/// Dispatch client: one explicit context object owning the publish and
/// collection machinery, constructed once and passed to each operation.
///
/// Many collection loops (for different job ids) may run concurrently
/// against one client; they multiplex over the shared [`EventBus`].
pub struct Client<C> {
    config: ClientConfig,
    bus: EventBus,
    publisher: Publisher<C>,
    registry: JobRunRegistry,
    range_service: Option<Arc<dyn RangeService>>,
}

impl<C: ControlPlane> Client<C> {
    pub fn new(control: C, bus: EventBus, config: ClientConfig) -> Self {
        let keys = Box::new(FileKeySource::new(&config.cache_dir, config.user.as_deref()));
        Self::with_key_source(control, bus, config, keys)
    }

    pub fn with_key_source(
        control: C,
        bus: EventBus,
        config: ClientConfig,
        keys: Box<dyn KeySource>,
    ) -> Self {
        let publisher = Publisher::new(control, keys, &config);
        Self {
            config,
            bus,
            publisher,
            registry: JobRunRegistry::new(),
            range_service: None,
        }
    }

    pub fn with_range_service(mut self, service: Arc<dyn RangeService>) -> Self {
        self.range_service = Some(service);
        self
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Diagnostic view of jobs currently collecting (plus interrupted jobs
    /// awaiting out-of-band lookup). Never blocks an active collector.
    pub fn in_flight(&self) -> Vec<JobRecord> {
        self.registry.in_flight()
    }

    /// Resolve, subscribe, publish, and register one job.
    ///
    /// The subscription is opened before the publish round-trip so results
    /// cannot slip between the ack and the first poll. A target that
    /// resolves to an explicitly empty list returns the no-match handle
    /// without opening a subscription at all.
    pub async fn run_job(&self, request: &JobRequest) -> Result<(JobHandle, Option<Subscription>)> {
        let (target, target_type) = target::resolve(
            request.target.clone(),
            request.target_type,
            &self.config.nodegroups,
            self.range_service.as_deref(),
        )?;
        if let Target::List(agents) = &target {
            if agents.is_empty() {
                return Ok((JobHandle::no_match(), None));
            }
        }

        let timeout = self.config.timeout_for(request.requested_timeout);
        let jid = gen_jid();
        let mut sub = self.bus.subscribe(&jid);

        let handle = match self
            .publisher
            .publish(request, &target, target_type, &jid, timeout)
            .await
        {
            Ok(handle) => handle,
            Err(err) => {
                sub.close();
                return Err(err);
            }
        };
        if handle.is_no_match() {
            sub.close();
            return Ok((handle, None));
        }
        // The control plane normally honors the jid we sent, but its word is
        // authoritative.
        if handle.job_id != jid {
            sub.close();
            sub = self.bus.subscribe(&handle.job_id);
        }
        self.registry
            .create(&handle.job_id, handle.expected_agents.clone());
        Ok((handle, Some(sub)))
    }

    /// Blocking mode: wait until the collection is terminal and return the
    /// aggregate, omitting agents that never responded.
    pub async fn cmd(&self, request: &JobRequest) -> Result<HashMap<String, ResultValue>> {
        let (handle, sub) = self.run_job(request).await?;
        let Some(sub) = sub else {
            return Ok(HashMap::new());
        };
        self.collect(request, handle, sub, false).wait().await
    }

    /// Streaming mode: a lazy collection yielding results as they arrive.
    /// `None` means zero agents matched and there is nothing to collect.
    pub async fn cmd_iter(&self, request: &JobRequest) -> Result<Option<Collection<'_, C>>> {
        let (handle, sub) = self.run_job(request).await?;
        Ok(sub.map(|sub| self.collect(request, handle, sub, false)))
    }

    /// CLI-interactive mode: like streaming, but silent agents surface as
    /// explicit no-response records once the loop is terminal.
    pub async fn cmd_cli(
        &self,
        request: &JobRequest,
        verbose: bool,
    ) -> Result<Option<Collection<'_, C>>> {
        let (handle, sub) = self.run_job(request).await?;
        let Some(sub) = sub else {
            println!("No agents matched the target. No command was sent.");
            return Ok(None);
        };
        if verbose {
            let banner = format!("Executing job with jid {}", handle.job_id);
            println!("{}", banner);
            println!("{}\n", "-".repeat(banner.len()));
        }
        Ok(Some(self.collect(request, handle, sub, true)))
    }

    /// Build the collection loop for a job published via [`run_job`].
    ///
    /// `expect_agents` makes silent agents surface as explicit no-response
    /// records once the loop is terminal (interactive/verbose behavior).
    ///
    /// [`run_job`]: Client::run_job
    pub fn collect(
        &self,
        request: &JobRequest,
        handle: JobHandle,
        sub: Subscription,
        expect_agents: bool,
    ) -> Collection<'_, C> {
        let probe_slack = if self.config.order_masters {
            self.config.syndic_wait
        } else {
            Duration::ZERO
        };
        let opts = CollectOptions {
            timeout: self.config.timeout_for(request.requested_timeout),
            probe_timeout: self.config.probe_timeout + probe_slack,
            extension_budget: self.config.extension_budget,
            min_wait_quantum: self.config.min_wait_quantum,
            expect_agents,
            compound: request.call.is_compound(),
        };
        Collection::new(
            &self.publisher,
            &self.bus,
            self.registry.clone(),
            sub,
            handle,
            opts,
        )
    }
}
