use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

/// Snapshot of one in-flight job.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub job_id: String,
    pub expected_agents: HashSet<String>,
    pub responded_agents: HashSet<String>,
    pub created_at: DateTime<Utc>,
}

/// Short-lived record store for in-flight jobs.
///
/// Entries exist only as long as needed to answer the call: removed on
/// normal completion, retained across interruption so the job id can be
/// re-queried out-of-band. Diagnostic readers share the lock with at most
/// O(1) critical sections, so they never stall a live collector.
#[derive(Clone, Default)]
pub struct JobRunRegistry {
    inner: Arc<RwLock<HashMap<String, JobRecord>>>,
}

impl JobRunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, job_id: &str, expected_agents: HashSet<String>) {
        let record = JobRecord {
            job_id: job_id.to_string(),
            expected_agents,
            responded_agents: HashSet::new(),
            created_at: Utc::now(),
        };
        self.inner
            .write()
            .expect("registry lock poisoned")
            .insert(job_id.to_string(), record);
    }

    pub fn get(&self, job_id: &str) -> Option<JobRecord> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .get(job_id)
            .cloned()
    }

    /// Fold newly-discovered agents into the expected set. Monotonic: only
    /// ever adds, so it is safe against a concurrently-polling collector.
    pub fn extend_expected<I>(&self, job_id: &str, new_agents: I)
    where
        I: IntoIterator<Item = String>,
    {
        if let Some(record) = self
            .inner
            .write()
            .expect("registry lock poisoned")
            .get_mut(job_id)
        {
            record.expected_agents.extend(new_agents);
        }
    }

    pub fn mark_responded(&self, job_id: &str, agent_id: &str) {
        if let Some(record) = self
            .inner
            .write()
            .expect("registry lock poisoned")
            .get_mut(job_id)
        {
            record.expected_agents.insert(agent_id.to_string());
            record.responded_agents.insert(agent_id.to_string());
        }
    }

    pub fn remove(&self, job_id: &str) {
        self.inner
            .write()
            .expect("registry lock poisoned")
            .remove(job_id);
    }

    /// Diagnostic listing of in-flight jobs, oldest first.
    pub fn in_flight(&self) -> Vec<JobRecord> {
        let mut records: Vec<JobRecord> = self
            .inner
            .read()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        records
    }
}
