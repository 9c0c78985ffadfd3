use std::collections::HashSet;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::error::{MusterError, Result};
use crate::target::{Target, TargetType};

/// The function (or functions) a job runs remotely.
///
/// A compound call bundles several functions into one publish; agents report
/// all sub-results in a single return keyed by function name.
#[derive(Debug, Clone, PartialEq)]
pub enum FunctionCall {
    Single {
        function: String,
        arguments: Vec<Value>,
    },
    Compound(Vec<(String, Vec<Value>)>),
}

impl FunctionCall {
    pub fn single(function: impl Into<String>, arguments: Vec<Value>) -> Self {
        FunctionCall::Single {
            function: function.into(),
            arguments,
        }
    }

    /// Build a compound call. The argument lists run parallel to the
    /// function names; a length mismatch is a construction-time error.
    pub fn compound(functions: Vec<String>, arguments: Vec<Vec<Value>>) -> Result<Self> {
        if functions.len() != arguments.len() {
            return Err(MusterError::InvalidRequest(format!(
                "compound call has {} functions but {} argument lists",
                functions.len(),
                arguments.len()
            )));
        }
        if functions.is_empty() {
            return Err(MusterError::InvalidRequest(
                "compound call has no functions".to_string(),
            ));
        }
        Ok(FunctionCall::Compound(
            functions.into_iter().zip(arguments).collect(),
        ))
    }

    pub fn is_compound(&self) -> bool {
        matches!(self, FunctionCall::Compound(_))
    }

    /// Wire form of the `fun` field: a string, or an array for compound calls.
    pub fn fun_value(&self) -> Value {
        match self {
            FunctionCall::Single { function, .. } => Value::String(function.clone()),
            FunctionCall::Compound(calls) => Value::Array(
                calls
                    .iter()
                    .map(|(f, _)| Value::String(f.clone()))
                    .collect(),
            ),
        }
    }

    /// Wire form of the `arg` field, parallel to `fun_value`.
    pub fn arg_value(&self) -> Value {
        match self {
            FunctionCall::Single { arguments, .. } => Value::Array(arguments.clone()),
            FunctionCall::Compound(calls) => Value::Array(
                calls
                    .iter()
                    .map(|(_, args)| Value::Array(args.clone()))
                    .collect(),
            ),
        }
    }
}

/// Immutable description of work to dispatch to a target set.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub target: Target,
    pub target_type: TargetType,
    pub call: FunctionCall,
    pub keyword_arguments: Option<Map<String, Value>>,
    /// Result-sink names; empty means "default routing".
    pub return_routing: Vec<String>,
    /// Absent or zero means "use the configured default".
    pub requested_timeout: Option<Duration>,
}

impl JobRequest {
    pub fn new(target: Target, target_type: TargetType, call: FunctionCall) -> Self {
        Self {
            target,
            target_type,
            call,
            keyword_arguments: None,
            return_routing: Vec::new(),
            requested_timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.requested_timeout = Some(timeout);
        self
    }

    pub fn with_kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.keyword_arguments = Some(kwargs);
        self
    }

    pub fn with_return_routing(mut self, sinks: Vec<String>) -> Self {
        self.return_routing = sinks;
        self
    }
}

/// Outcome of a successful publish: the assigned job id and the agents
/// predicted to match the target. Prediction is best-effort; agents matching
/// agent-side (regex, grains, compound) may be missing from the set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub job_id: String,
    pub expected_agents: HashSet<String>,
}

impl JobHandle {
    pub fn new(job_id: String, expected_agents: HashSet<String>) -> Self {
        Self {
            job_id,
            expected_agents,
        }
    }

    /// Sentinel handle for "zero agents matched, nothing was published".
    /// Callers treat this as "nothing to collect", not as an error.
    pub fn no_match() -> Self {
        Self {
            job_id: String::new(),
            expected_agents: HashSet::new(),
        }
    }

    pub fn is_no_match(&self) -> bool {
        self.job_id.is_empty()
    }
}

/// One inbound result event, owned by the collection loop that consumed it.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentResult {
    pub agent_id: String,
    pub job_id: String,
    pub return_value: Value,
    /// Defaults to false when the transport did not supply one.
    pub success: bool,
    /// Renderer hint, opaque to this layer.
    pub output_format_hint: Option<String>,
}

/// Aggregated per-agent result, tagged once at aggregation time so consumers
/// never re-inspect the payload shape.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultValue {
    Single(Value),
    /// Function name -> that function's return, for compound jobs.
    Compound(Map<String, Value>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn compound_call_length_mismatch_is_rejected() {
        let err = FunctionCall::compound(
            vec!["test.ping".to_string(), "cmd.run".to_string()],
            vec![vec![]],
        )
        .unwrap_err();
        assert!(matches!(err, MusterError::InvalidRequest(_)));
    }

    #[test]
    fn compound_call_wire_form() {
        let call = FunctionCall::compound(
            vec!["test.ping".to_string(), "cmd.run".to_string()],
            vec![vec![], vec![json!("uptime")]],
        )
        .expect("valid compound call");
        assert_eq!(call.fun_value(), json!(["test.ping", "cmd.run"]));
        assert_eq!(call.arg_value(), json!([[], ["uptime"]]));
    }

    #[test]
    fn single_call_wire_form() {
        let call = FunctionCall::single("test.ping", vec![]);
        assert_eq!(call.fun_value(), json!("test.ping"));
        assert_eq!(call.arg_value(), json!([]));
    }

    #[test]
    fn no_match_handle_is_distinguishable() {
        let handle = JobHandle::no_match();
        assert!(handle.is_no_match());
        assert!(handle.expected_agents.is_empty());

        let real = JobHandle::new("20260824120000123456".to_string(), HashSet::new());
        assert!(!real.is_no_match());
    }
}
