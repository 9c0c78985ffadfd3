//! Publisher behavior: sentinel job ids, key rotation, and empty-target
//! short-circuits.


use std::time::Duration;

use serde_json::json;

use muster::{
    ClientConfig, EventBus, FunctionCall, JobRequest, MusterError, Publisher, Target, TargetType,
};
use test_harness::{test_config, MockControlPlane, RotatingKeys, StaticKeys};

fn ping_request(target: Target, target_type: TargetType) -> JobRequest {
    JobRequest::new(target, target_type, FunctionCall::single("test.ping", vec![]))
}

fn publisher(
    control: MockControlPlane,
    keys: Box<dyn muster::KeySource>,
    config: &ClientConfig,
) -> Publisher<MockControlPlane> {
    Publisher::new(control, keys, config)
}

async fn publish_glob(
    publisher: &Publisher<MockControlPlane>,
) -> muster::Result<muster::JobHandle> {
    let request = ping_request(Target::expr("*"), TargetType::Glob);
    publisher
        .publish(
            &request,
            &request.target,
            request.target_type,
            "20260824000000000001",
            Duration::from_secs(5),
        )
        .await
}

#[tokio::test]
async fn sentinel_jid_zero_means_unreachable() {
    let bus = EventBus::new();
    let control = MockControlPlane::new(bus, &["a"]);
    control.state().ack_jid_override = Some("0".to_string());
    let publisher = publisher(control, Box::new(StaticKeys("k")), &test_config());

    let err = publish_glob(&publisher).await.unwrap_err();
    assert!(matches!(err, MusterError::ControlPlaneUnreachable));
}

#[tokio::test]
async fn transport_failure_surfaces_as_unreachable() {
    let bus = EventBus::new();
    let control = MockControlPlane::new(bus, &["a"]);
    control.state().unreachable = true;
    let publisher = publisher(control, Box::new(StaticKeys("k")), &test_config());

    let err = publish_glob(&publisher).await.unwrap_err();
    assert!(matches!(err, MusterError::ControlPlaneUnreachable));
}

#[tokio::test]
async fn rotated_key_retries_exactly_once() {
    let bus = EventBus::new();
    let control = MockControlPlane::new(bus, &["a"]);
    control.state().accepted_key = Some("new".to_string());
    let keys = RotatingKeys::new(vec!["old", "new"]);
    let publisher = publisher(control.clone(), Box::new(keys), &test_config());

    let handle = publish_glob(&publisher).await.expect("retry succeeds");
    assert!(!handle.is_no_match());
    assert_eq!(control.publish_count(), 2);
    assert_eq!(control.state().publishes[0]["key"], json!("old"));
    assert_eq!(control.state().publishes[1]["key"], json!("new"));
}

#[tokio::test]
async fn unchanged_key_is_authentication_denied() {
    let bus = EventBus::new();
    let control = MockControlPlane::new(bus, &["a"]);
    control.state().accepted_key = Some("something-else".to_string());
    let publisher = publisher(control.clone(), Box::new(StaticKeys("k")), &test_config());

    let err = publish_glob(&publisher).await.unwrap_err();
    assert!(matches!(err, MusterError::AuthenticationDenied));
    // The key never changed, so there was nothing to retry with.
    assert_eq!(control.publish_count(), 1);
}

#[tokio::test]
async fn rejected_retry_is_authentication_denied() {
    let bus = EventBus::new();
    let control = MockControlPlane::new(bus, &["a"]);
    control.state().accepted_key = Some("neither".to_string());
    let keys = RotatingKeys::new(vec!["old", "new"]);
    let publisher = publisher(control.clone(), Box::new(keys), &test_config());

    let err = publish_glob(&publisher).await.unwrap_err();
    assert!(matches!(err, MusterError::AuthenticationDenied));
    assert_eq!(control.publish_count(), 2);
}

#[tokio::test]
async fn empty_list_target_short_circuits_without_publishing() {
    let bus = EventBus::new();
    let control = MockControlPlane::new(bus, &["a"]);
    let publisher = publisher(control.clone(), Box::new(StaticKeys("k")), &test_config());

    let request = ping_request(Target::List(Vec::new()), TargetType::List);
    let handle = publisher
        .publish(
            &request,
            &request.target,
            request.target_type,
            "20260824000000000001",
            Duration::from_secs(5),
        )
        .await
        .expect("empty target is not an error");
    assert!(handle.is_no_match());
    assert_eq!(control.publish_count(), 0);
}

#[tokio::test]
async fn zero_predicted_agents_is_a_no_match_handle() {
    let bus = EventBus::new();
    let control = MockControlPlane::new(bus, &[]);
    let publisher = publisher(control, Box::new(StaticKeys("k")), &test_config());

    let handle = publish_glob(&publisher).await.expect("no agents is not an error");
    assert!(handle.is_no_match());
}

#[tokio::test]
async fn order_masters_proceeds_despite_empty_prediction() {
    // Downstream masters may still match agents the local prediction
    // cannot see, so the publish stands.
    let bus = EventBus::new();
    let control = MockControlPlane::new(bus, &[]);
    let mut config = test_config();
    config.order_masters = true;
    let publisher = publisher(control.clone(), Box::new(StaticKeys("k")), &config);

    let handle = publish_glob(&publisher).await.expect("publish succeeds");
    assert!(!handle.is_no_match());
    assert!(handle.expected_agents.is_empty());
    // The collection timeout rides along for downstream masters.
    assert_eq!(control.state().publishes[0]["to"], json!(5));
}
