use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a dispatch client.
///
/// Timeouts are whole-second durations; a requested timeout of zero is
/// interpreted upstream as "use `default_timeout`", never as "return
/// immediately".
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Collection window for a job when the request does not carry one.
    pub default_timeout: Duration,

    /// Window for a single liveness probe round. Much smaller than a
    /// collection window so a hung probe cannot stall the extension decision.
    pub probe_timeout: Duration,

    /// How many deadline extensions one collection may consume.
    /// `None` opts in to unlimited extension; the bounded default is what
    /// guarantees termination.
    pub extension_budget: Option<u32>,

    /// Floor applied to every poll wait so a nearly-expired deadline does not
    /// degenerate into a busy-spin against the channel.
    pub min_wait_quantum: Duration,

    /// Nodegroup name -> compound target expression.
    pub nodegroups: HashMap<String, String>,

    /// Hierarchical (syndicated) topology: downstream masters may match
    /// agents the local prediction cannot see.
    pub order_masters: bool,

    /// Extra slack granted to probe windows when `order_masters` is set,
    /// giving downstream masters time to relay.
    pub syndic_wait: Duration,

    /// User recorded on published loads and used to locate the signing key.
    pub user: Option<String>,

    /// Directory holding the rotating signing key file.
    pub cache_dir: PathBuf,

    /// Result sink appended to every job's return routing, if configured.
    pub external_job_cache: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(10),
            extension_budget: Some(3),
            min_wait_quantum: Duration::from_secs(1),
            nodegroups: HashMap::new(),
            order_masters: false,
            syndic_wait: Duration::from_secs(5),
            user: None,
            cache_dir: PathBuf::from("/var/cache/muster"),
            external_job_cache: None,
        }
    }
}

impl ClientConfig {
    pub fn with_nodegroup(mut self, name: impl Into<String>, expr: impl Into<String>) -> Self {
        self.nodegroups.insert(name.into(), expr.into());
        self
    }

    /// Resolve a requested timeout against the configured default.
    /// Absent and zero both mean "use the default".
    pub fn timeout_for(&self, requested: Option<Duration>) -> Duration {
        match requested {
            Some(t) if !t.is_zero() => t,
            _ => self.default_timeout,
        }
    }
}
