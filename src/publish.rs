use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::ClientConfig;
use crate::error::{MusterError, Result};
use crate::jid::UNREACHABLE_JID;
use crate::job::{JobHandle, JobRequest};
use crate::target::{Target, TargetType};

/// Wire load for the control-plane publish endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct PublishLoad {
    pub cmd: &'static str,
    pub tgt: Value,
    pub tgt_type: String,
    pub fun: Value,
    pub arg: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kwarg: Option<Map<String, Value>>,
    pub ret: String,
    pub jid: String,
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Collection timeout in seconds, forwarded to downstream masters in
    /// hierarchical topologies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<u64>,
}

/// Control-plane acknowledgement: the assigned job id and the predicted
/// agent set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishAck {
    pub jid: String,
    pub minions: Vec<String>,
}

/// The broadcast/publish endpoint, an opaque boundary.
///
/// `Ok(None)` means the control plane rejected the load outright (stale
/// signing key, denied credentials); a transport-level failure surfaces as
/// `ControlPlaneUnreachable`.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn publish(&self, load: &PublishLoad) -> Result<Option<PublishAck>>;
}

/// Source of the rotating signing key attached to every publish.
pub trait KeySource: Send + Sync {
    fn read_key(&self) -> String;
}

/// Reads `<cache_dir>/.<user>_key`. A missing or unreadable file yields an
/// empty key, letting external-auth credentials carry the request instead.
pub struct FileKeySource {
    path: PathBuf,
}

impl FileKeySource {
    pub fn new(cache_dir: &std::path::Path, user: Option<&str>) -> Self {
        let user = user.unwrap_or("root");
        Self {
            path: cache_dir.join(format!(".{}_key", user)),
        }
    }
}

impl KeySource for FileKeySource {
    fn read_key(&self) -> String {
        match std::fs::read_to_string(&self.path) {
            Ok(key) => key,
            Err(err) => {
                tracing::debug!(path = %self.path.display(), error = %err, "No signing key file");
                String::new()
            }
        }
    }
}

/// Builds and sends job-request envelopes, one round-trip per publish with a
/// single retry when the signing key rotated underneath us.
pub struct Publisher<C> {
    control: C,
    keys: Box<dyn KeySource>,
    cached_key: Mutex<Option<String>>,
    user: Option<String>,
    order_masters: bool,
    external_job_cache: Option<String>,
}

impl<C: ControlPlane> Publisher<C> {
    pub fn new(control: C, keys: Box<dyn KeySource>, config: &ClientConfig) -> Self {
        Self {
            control,
            keys,
            cached_key: Mutex::new(None),
            user: config.user.clone(),
            order_masters: config.order_masters,
            external_job_cache: config.external_job_cache.clone(),
        }
    }

    pub fn control(&self) -> &C {
        &self.control
    }

    /// Publish a job whose target has already been resolved.
    ///
    /// An explicitly empty list target short-circuits to the no-match handle
    /// without a round-trip; so does an ack predicting zero agents, unless
    /// downstream masters may still match.
    pub async fn publish(
        &self,
        request: &JobRequest,
        target: &Target,
        target_type: TargetType,
        jid: &str,
        timeout: Duration,
    ) -> Result<JobHandle> {
        if let Target::List(agents) = target {
            if agents.is_empty() {
                tracing::info!("No agents matched the target, nothing published");
                return Ok(JobHandle::no_match());
            }
        }

        let mut load = self.build_load(request, target, target_type, jid, timeout);

        let ack = match self.control.publish(&load).await? {
            Some(ack) => ack,
            None => {
                // The signing key may have rotated out from under us. Re-read
                // and retry exactly once if it changed.
                let fresh = self.keys.read_key();
                let stale = {
                    let mut cached = self.cached_key.lock().expect("key cache lock poisoned");
                    let changed = cached.as_deref() != Some(fresh.as_str());
                    if changed {
                        *cached = Some(fresh.clone());
                    }
                    !changed
                };
                if stale {
                    return Err(MusterError::AuthenticationDenied);
                }
                tracing::debug!(job_id = jid, "Signing key rotated, retrying publish once");
                load.key = fresh;
                self.control
                    .publish(&load)
                    .await?
                    .ok_or(MusterError::AuthenticationDenied)?
            }
        };

        if ack.jid == UNREACHABLE_JID {
            return Err(MusterError::ControlPlaneUnreachable);
        }
        if ack.minions.is_empty() && !self.order_masters {
            tracing::info!(job_id = %ack.jid, "Control plane predicted zero agents");
            return Ok(JobHandle::no_match());
        }

        let expected: HashSet<String> = ack.minions.into_iter().collect();
        tracing::debug!(job_id = %ack.jid, expected = expected.len(), "Job published");
        Ok(JobHandle::new(ack.jid, expected))
    }

    fn build_load(
        &self,
        request: &JobRequest,
        target: &Target,
        target_type: TargetType,
        jid: &str,
        timeout: Duration,
    ) -> PublishLoad {
        let mut routing = request.return_routing.clone();
        if let Some(cache) = &self.external_job_cache {
            routing.push(cache.clone());
        }
        PublishLoad {
            cmd: "publish",
            tgt: target.to_value(),
            tgt_type: target_type.as_str().to_string(),
            fun: request.call.fun_value(),
            arg: request.call.arg_value(),
            kwarg: request.keyword_arguments.clone(),
            ret: routing.join(","),
            jid: jid.to_string(),
            key: self.current_key(),
            user: self.user.clone(),
            to: self.order_masters.then(|| timeout.as_secs()),
        }
    }

    fn current_key(&self) -> String {
        let mut cached = self.cached_key.lock().expect("key cache lock poisoned");
        match cached.as_ref() {
            Some(key) => key.clone(),
            None => {
                let key = self.keys.read_key();
                *cached = Some(key.clone());
                key
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::FunctionCall;
    use serde_json::json;

    struct StaticKeys(&'static str);
    impl KeySource for StaticKeys {
        fn read_key(&self) -> String {
            self.0.to_string()
        }
    }

    struct NullControl;
    #[async_trait]
    impl ControlPlane for NullControl {
        async fn publish(&self, _load: &PublishLoad) -> Result<Option<PublishAck>> {
            Ok(None)
        }
    }

    #[test]
    fn load_wire_shape() {
        let publisher = Publisher::new(
            NullControl,
            Box::new(StaticKeys("secret")),
            &ClientConfig::default(),
        );
        let request = JobRequest::new(
            Target::expr("*"),
            TargetType::Glob,
            FunctionCall::single("test.ping", vec![]),
        )
        .with_return_routing(vec!["job_db".to_string()]);

        let load = publisher.build_load(
            &request,
            &request.target,
            request.target_type,
            "42",
            Duration::from_secs(5),
        );
        let wire = serde_json::to_value(&load).expect("load serializes");
        assert_eq!(wire["cmd"], json!("publish"));
        assert_eq!(wire["tgt"], json!("*"));
        assert_eq!(wire["tgt_type"], json!("glob"));
        assert_eq!(wire["fun"], json!("test.ping"));
        assert_eq!(wire["ret"], json!("job_db"));
        assert_eq!(wire["jid"], json!("42"));
        assert_eq!(wire["key"], json!("secret"));
        // Not a hierarchical topology, so no forwarded timeout.
        assert!(wire.get("to").is_none());
    }

    #[test]
    fn external_job_cache_joins_return_routing() {
        let mut config = ClientConfig::default();
        config.external_job_cache = Some("archive".to_string());
        let publisher = Publisher::new(NullControl, Box::new(StaticKeys("")), &config);
        let request = JobRequest::new(
            Target::expr("*"),
            TargetType::Glob,
            FunctionCall::single("test.ping", vec![]),
        )
        .with_return_routing(vec!["job_db".to_string()]);

        let load = publisher.build_load(
            &request,
            &request.target,
            request.target_type,
            "42",
            Duration::from_secs(5),
        );
        assert_eq!(load.ret, "job_db,archive");
    }

    #[test]
    fn order_masters_forwards_timeout() {
        let mut config = ClientConfig::default();
        config.order_masters = true;
        let publisher = Publisher::new(NullControl, Box::new(StaticKeys("")), &config);
        let request = JobRequest::new(
            Target::expr("*"),
            TargetType::Glob,
            FunctionCall::single("test.ping", vec![]),
        );

        let load = publisher.build_load(
            &request,
            &request.target,
            request.target_type,
            "42",
            Duration::from_secs(30),
        );
        assert_eq!(load.to, Some(30));
    }
}
