//! Integration tests for the provisioning workflow against in-memory fakes.

#[path = "common/harness.rs"]
mod harness;

use botfleet::backend::ProviderError;
use botfleet::orchestrator::{ProvisionError, launch_command};
use botfleet::registry::InstanceRegistry;
use botfleet::state::{ProvisioningStatus, StateStore};
use botfleet::test_support::{CloudCall, FAKE_PUBLIC_IP, FakeArtifactProbe, active_instance};
use chrono::Utc;
use harness::{Harness, identifier, instant_settings, request};
use rstest::rstest;

fn server_error() -> ProviderError {
    ProviderError::Api {
        status: 500,
        code: String::from("server_error"),
        message: String::from("try again"),
    }
}

fn unprocessable() -> ProviderError {
    ProviderError::Api {
        status: 422,
        code: String::from("unprocessable_entity"),
        message: String::from("bad size"),
    }
}

fn timeout() -> ProviderError {
    ProviderError::Timeout {
        action: String::from("create"),
    }
}

fn position(calls: &[CloudCall], predicate: impl Fn(&CloudCall) -> bool) -> usize {
    calls
        .iter()
        .position(predicate)
        .unwrap_or_else(|| panic!("call not found in {calls:?}"))
}

#[tokio::test]
async fn successful_run_walks_every_stage_and_registers_the_instance() {
    let harness = Harness::new(FakeArtifactProbe::ready_after(2));
    harness.cloud.set_activation_polls(2);

    let record = harness
        .orchestrator
        .run(&request())
        .await
        .unwrap_or_else(|err| panic!("run should succeed: {err}"));

    assert_eq!(record.ip, FAKE_PUBLIC_IP.to_string());
    assert_eq!(record.name, "botfleet-5511999998888");

    let history = harness.store.history(&identifier());
    let statuses: Vec<ProvisioningStatus> = history.iter().map(|state| state.status).collect();
    assert_eq!(
        statuses,
        vec![
            ProvisioningStatus::Creating,
            ProvisioningStatus::CreatingDroplet,
            ProvisioningStatus::WaitingForSsh,
            ProvisioningStatus::Configuring,
            ProvisioningStatus::Completed,
        ]
    );
    assert!(
        history
            .windows(2)
            .all(|pair| matches!(pair, [earlier, later] if earlier.progress <= later.progress)),
        "progress must never decrease: {history:?}"
    );

    let last = harness
        .store
        .get(&identifier())
        .unwrap_or_else(|| panic!("state should be published"));
    assert_eq!(last.progress, 100);
    let info = last
        .instance_info
        .unwrap_or_else(|| panic!("completed state carries instance info"));
    assert_eq!(info.ip, record.ip);

    let stored = harness
        .registry
        .get(&identifier())
        .unwrap_or_else(|err| panic!("registry read: {err}"));
    assert_eq!(stored, Some(record));
    assert_eq!(harness.probe.calls(), 3);
}

#[tokio::test]
async fn configuration_runs_in_order_inside_closed_sessions() {
    let harness = Harness::new(FakeArtifactProbe::ready());

    harness
        .orchestrator
        .run(&request())
        .await
        .unwrap_or_else(|err| panic!("run should succeed: {err}"));

    let commands = harness.shell.remote_commands();
    assert_eq!(commands.first().map(String::as_str), Some("whoami"));
    let upserts = commands
        .iter()
        .filter(|command| command.starts_with("touch /opt/bot/.env"))
        .count();
    assert_eq!(upserts, 7);
    let launch = launch_command(&instant_settings().layout);
    let launch_at = commands
        .iter()
        .position(|command| *command == launch)
        .unwrap_or_else(|| panic!("launch command missing from {commands:?}"));
    let runtime_at = commands
        .iter()
        .position(|command| command.starts_with("test -x"))
        .unwrap_or_else(|| panic!("runtime check missing from {commands:?}"));
    assert!(runtime_at < launch_at);
    assert_eq!(harness.shell.opened(), 2);
    assert_eq!(harness.shell.closed(), 2);
}

#[tokio::test]
async fn previous_instance_is_deleted_before_create() {
    let harness = Harness::new(FakeArtifactProbe::ready());
    harness.cloud.seed(active_instance(
        "77",
        "botfleet-5511999998888",
        &["botfleet", "botfleet-5511999998888"],
        Utc::now(),
    ));

    harness
        .orchestrator
        .run(&request())
        .await
        .unwrap_or_else(|err| panic!("run should succeed: {err}"));

    let calls = harness.cloud.calls();
    let listed = position(&calls, |call| {
        *call == CloudCall::ListByTag(String::from("botfleet-5511999998888"))
    });
    let deleted = position(&calls, |call| *call == CloudCall::Delete(String::from("77")));
    let created = position(&calls, |call| matches!(call, CloudCall::Create(_)));
    assert!(listed < deleted && deleted < created, "unexpected order: {calls:?}");
}

#[tokio::test]
async fn retryable_create_failure_is_retried_exactly_once() {
    let harness = Harness::new(FakeArtifactProbe::ready());
    harness.cloud.fail_next_create(server_error());

    harness
        .orchestrator
        .run(&request())
        .await
        .unwrap_or_else(|err| panic!("run should succeed after one retry: {err}"));

    let creates = harness
        .cloud
        .calls()
        .into_iter()
        .filter(|call| matches!(call, CloudCall::Create(_)))
        .count();
    assert_eq!(creates, 2);
}

#[tokio::test]
async fn rejected_create_is_also_retried_once() {
    let harness = Harness::new(FakeArtifactProbe::ready());
    harness.cloud.fail_next_create(unprocessable());

    harness
        .orchestrator
        .run(&request())
        .await
        .unwrap_or_else(|err| panic!("run should succeed after one retry: {err}"));

    let creates = harness
        .cloud
        .calls()
        .into_iter()
        .filter(|call| matches!(call, CloudCall::Create(_)))
        .count();
    assert_eq!(creates, 2);
}

#[rstest]
#[case(server_error(), server_error(), 2)]
#[case(
    ProviderError::Api {
        status: 422,
        code: String::from("unprocessable_entity"),
        message: String::from("bad size"),
    },
    server_error(),
    2
)]
#[tokio::test]
async fn create_failures_end_in_creation_error(
    #[case] first: ProviderError,
    #[case] second: ProviderError,
    #[case] expected_creates: usize,
) {
    let harness = Harness::new(FakeArtifactProbe::ready());
    harness.cloud.fail_next_create(first);
    harness.cloud.fail_next_create(second);

    let err = harness
        .orchestrator
        .run(&request())
        .await
        .expect_err("create should fail");

    assert!(matches!(err, ProvisionError::Creation(_)), "unexpected error: {err}");
    let creates = harness
        .cloud
        .calls()
        .into_iter()
        .filter(|call| matches!(call, CloudCall::Create(_)))
        .count();
    assert_eq!(creates, expected_creates);
    let state = harness
        .store
        .get(&identifier())
        .unwrap_or_else(|| panic!("state should be published"));
    assert_eq!(state.status, ProvisioningStatus::Failed);
    assert_eq!(state.progress, 0);
}

#[tokio::test]
async fn missing_runtime_fails_without_launching() {
    let harness = Harness::new(FakeArtifactProbe::ready());
    harness.shell.respond("test -x", 1, "", "");

    let err = harness
        .orchestrator
        .run(&request())
        .await
        .expect_err("runtime check should fail");

    assert!(matches!(err, ProvisionError::RuntimeMissing { .. }), "unexpected error: {err}");
    let state = harness
        .store
        .get(&identifier())
        .unwrap_or_else(|| panic!("state should be published"));
    assert_eq!(state.status, ProvisioningStatus::Failed);
    assert_eq!(state.progress, 75);
    let message = state.error.unwrap_or_default();
    assert!(message.contains("/usr/bin/node"), "error should name the runtime: {message}");
    assert!(
        !harness
            .shell
            .remote_commands()
            .iter()
            .any(|command| command.contains("setsid")),
        "launch must not be sent"
    );
    assert_eq!(harness.shell.opened(), harness.shell.closed());
}

#[tokio::test]
async fn failed_launch_reports_the_log_tail() {
    let harness = Harness::new(FakeArtifactProbe::ready());
    harness.shell.respond("pgrep", 1, "", "");
    harness
        .shell
        .respond("tail -n 40", 0, "Error: Cannot find module 'baileys'\n", "");

    let err = harness
        .orchestrator
        .run(&request())
        .await
        .expect_err("launch should fail");

    let ProvisionError::LaunchFailed { log_tail } = err else {
        panic!("expected LaunchFailed, got {err}");
    };
    assert_eq!(log_tail, "Error: Cannot find module 'baileys'");
}

#[tokio::test]
async fn qr_timeout_has_its_own_message() {
    let harness = Harness::new(FakeArtifactProbe::never_ready());

    let err = harness
        .orchestrator
        .run(&request())
        .await
        .expect_err("artifact never appears");

    assert!(
        matches!(err, ProvisionError::QrTimeout { attempts: 4, .. }),
        "unexpected error: {err}"
    );
    assert_eq!(harness.probe.calls(), 4);
    let state = harness
        .store
        .get(&identifier())
        .unwrap_or_else(|| panic!("state should be published"));
    let message = state.error.unwrap_or_default();
    assert!(
        message.starts_with("timed out waiting for the pairing QR code after 4 attempts"),
        "unexpected message: {message}"
    );
    assert_eq!(state.progress, 75);
}

#[tokio::test]
async fn unreachable_shell_times_out_after_the_configured_attempts() {
    let harness = Harness::new(FakeArtifactProbe::ready());
    harness.shell.fail_connects(u32::MAX);

    let err = harness
        .orchestrator
        .run(&request())
        .await
        .expect_err("ssh never comes up");

    assert!(
        matches!(err, ProvisionError::ProbeTimeout { probe: "ssh", attempts: 3, .. }),
        "unexpected error: {err}"
    );
    let state = harness
        .store
        .get(&identifier())
        .unwrap_or_else(|| panic!("state should be published"));
    assert_eq!(state.progress, 50);
    assert!(state.instance_info.is_some());
}

#[tokio::test]
async fn missing_public_address_is_fatal() {
    let harness = Harness::new(FakeArtifactProbe::ready());
    harness.cloud.set_public_ip(None);

    let err = harness
        .orchestrator
        .run(&request())
        .await
        .expect_err("no public address");

    assert!(matches!(err, ProvisionError::MissingPublicIp { .. }), "unexpected error: {err}");
    assert_eq!(harness.shell.opened(), 0);
}

#[tokio::test]
async fn failed_run_deletes_the_instance_it_created() {
    let harness = Harness::new(FakeArtifactProbe::never_ready());

    harness
        .orchestrator
        .run(&request())
        .await
        .expect_err("artifact never appears");

    assert!(harness.cloud.instances().is_empty());
    let registered = harness
        .registry
        .get(&identifier())
        .unwrap_or_else(|err| panic!("registry read: {err}"));
    assert_eq!(registered, None);
}

#[tokio::test]
async fn cleanup_can_be_disabled() {
    let settings = botfleet::orchestrator::WorkflowSettings {
        cleanup_on_failure: false,
        ..instant_settings()
    };
    let harness = Harness::with_settings(FakeArtifactProbe::never_ready(), settings);

    harness
        .orchestrator
        .run(&request())
        .await
        .expect_err("artifact never appears");

    assert_eq!(harness.cloud.instances().len(), 1);
}

#[tokio::test]
async fn failed_run_deletes_instances_from_unconfirmed_creates() {
    let harness = Harness::new(FakeArtifactProbe::never_ready());
    harness.cloud.accept_then_fail_next_create(timeout());

    harness
        .orchestrator
        .run(&request())
        .await
        .expect_err("artifact never appears");

    let creates = harness
        .cloud
        .calls()
        .into_iter()
        .filter(|call| matches!(call, CloudCall::Create(_)))
        .count();
    assert_eq!(creates, 2);
    assert!(
        harness.cloud.instances().is_empty(),
        "left behind: {:?}",
        harness.cloud.instances()
    );
}

#[tokio::test]
async fn exhausted_create_still_sweeps_accepted_instances() {
    let harness = Harness::new(FakeArtifactProbe::ready());
    harness.cloud.accept_then_fail_next_create(timeout());
    harness.cloud.accept_then_fail_next_create(timeout());

    let err = harness
        .orchestrator
        .run(&request())
        .await
        .expect_err("both creates time out");

    assert!(matches!(err, ProvisionError::Creation(_)), "unexpected error: {err}");
    assert!(harness.cloud.instances().is_empty());
}
