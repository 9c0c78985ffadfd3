//! Client-level wiring: target resolution feeding the publish path, job
//! registration, and jid handling.


use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map};

use muster::{
    FunctionCall, JobRequest, MusterError, RangeService, Target, TargetType,
};
use test_harness::{test_client, test_client_with, test_config};

fn ping(target: Target, target_type: TargetType) -> JobRequest {
    JobRequest::new(target, target_type, FunctionCall::single("test.ping", vec![]))
}

#[tokio::test(start_paused = true)]
async fn nodegroup_resolves_before_publishing() {
    let config = test_config().with_nodegroup("webservers", "L@host1,host2");
    let (client, _bus, control) = test_client_with(&["host1", "host2"], config);
    control.agent_returns("host1", Duration::from_secs(1), json!(true));
    control.agent_returns("host2", Duration::from_secs(1), json!(true));

    let results = client
        .cmd(&ping(Target::expr("webservers"), TargetType::Nodegroup))
        .await
        .expect("collection succeeds");
    assert_eq!(results.len(), 2);

    let load = control.state().publishes[0].clone();
    assert_eq!(load["tgt"], json!("L@host1,host2"));
    assert_eq!(load["tgt_type"], json!("compound"));
}

#[tokio::test(start_paused = true)]
async fn unknown_nodegroup_fails_before_publishing() {
    let (client, bus, control) = test_client(&["a"]);

    let err = client
        .cmd(&ping(Target::expr("missing"), TargetType::Nodegroup))
        .await
        .unwrap_err();
    assert!(matches!(err, MusterError::UnknownNodegroup(name) if name == "missing"));
    assert_eq!(control.publish_count(), 0);
    assert_eq!(bus.subscription_count(), 0);
}

struct FixedRange(Vec<&'static str>);

impl RangeService for FixedRange {
    fn expand(&self, _expr: &str) -> Result<Vec<String>, String> {
        Ok(self.0.iter().map(|s| s.to_string()).collect())
    }
}

#[tokio::test(start_paused = true)]
async fn range_target_publishes_the_expanded_list() {
    let (client, _bus, control) = test_client(&["host1", "host2"]);
    let client = client.with_range_service(Arc::new(FixedRange(vec!["host1", "host2"])));
    control.agent_returns("host1", Duration::from_secs(1), json!(true));
    control.agent_returns("host2", Duration::from_secs(1), json!(true));

    let results = client
        .cmd(&ping(Target::expr("%cluster"), TargetType::Range))
        .await
        .expect("collection succeeds");
    assert_eq!(results.len(), 2);

    let load = control.state().publishes[0].clone();
    assert_eq!(load["tgt"], json!(["host1", "host2"]));
    assert_eq!(load["tgt_type"], json!("list"));
}

#[tokio::test(start_paused = true)]
async fn run_job_registers_the_job() {
    let (client, _bus, _control) = test_client(&["a", "b"]);

    let (handle, sub) = client
        .run_job(&ping(Target::expr("*"), TargetType::Glob))
        .await
        .expect("publish succeeds");
    assert!(sub.is_some());
    // Twenty-digit timestamp jid.
    assert_eq!(handle.job_id.len(), 20);
    assert!(handle.job_id.chars().all(|c| c.is_ascii_digit()));
    assert_eq!(
        handle.expected_agents,
        HashSet::from(["a".to_string(), "b".to_string()])
    );

    let in_flight = client.in_flight();
    assert_eq!(in_flight.len(), 1);
    assert_eq!(in_flight[0].job_id, handle.job_id);
    assert_eq!(in_flight[0].expected_agents, handle.expected_agents);
    assert!(in_flight[0].responded_agents.is_empty());
}

#[tokio::test(start_paused = true)]
async fn kwargs_ride_the_published_load() {
    let (client, _bus, control) = test_client(&["a"]);
    control.agent_returns("a", Duration::from_secs(1), json!(true));

    let mut kwargs = Map::new();
    kwargs.insert("shell".to_string(), json!("/bin/sh"));
    let request = JobRequest::new(
        Target::expr("*"),
        TargetType::Glob,
        FunctionCall::single("cmd.run", vec![json!("uptime")]),
    )
    .with_kwargs(kwargs);

    client.cmd(&request).await.expect("collection succeeds");
    let load = control.state().publishes[0].clone();
    assert_eq!(load["kwarg"], json!({"shell": "/bin/sh"}));
    assert_eq!(load["arg"], json!(["uptime"]));
}

#[tokio::test(start_paused = true)]
async fn publish_failure_releases_the_subscription() {
    let (client, bus, control) = test_client(&["a"]);
    control.state().unreachable = true;

    let err = client
        .cmd(&ping(Target::expr("*"), TargetType::Glob))
        .await
        .unwrap_err();
    assert!(matches!(err, MusterError::ControlPlaneUnreachable));
    assert_eq!(bus.subscription_count(), 0);
    assert!(client.in_flight().is_empty());
}

#[tokio::test(start_paused = true)]
async fn overridden_ack_jid_rebinds_the_subscription() {
    // The control plane's jid is authoritative; collection must listen on
    // the jid it acked, not the one requested.
    let (client, _bus, control) = test_client(&["a"]);
    control.state().ack_jid_override = Some("20260824000000999999".to_string());
    control.agent_returns("a", Duration::from_secs(1), json!(true));

    let results = client
        .cmd(&ping(Target::expr("*"), TargetType::Glob))
        .await
        .expect("collection succeeds");
    assert_eq!(results.len(), 1);
    assert!(results.contains_key("a"));
}
