//! Endpoint setup and teardown through the orchestration facade.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{free_port, node, node_with, FakeNat, FakeWarp};
use proxy_egress::egress::{
    EgressError, EndpointSetupSpec, HealthSettings, JsonOutboundFile, ProxyClientState,
    RoutingRequest, SetupStage, DEFAULT_CHAIN,
};

fn routed_spec() -> EndpointSetupSpec {
    EndpointSetupSpec {
        auto_connect: true,
        setup_traffic_routing: true,
        proxy_port: free_port(),
        interface: Some("eth0".into()),
        bypass_cidrs: vec!["203.0.113.0/24".into()],
        ..EndpointSetupSpec::default()
    }
}

// ── Full setup ──────────────────────────────────────────────────────

#[tokio::test]
async fn setup_from_not_installed_brings_up_routed_proxy() {
    let n = node(FakeWarp::default(), FakeNat::default());
    assert_eq!(
        n.egress.controller().reconcile().await,
        ProxyClientState::NotInstalled
    );

    let report = n.egress.setup_endpoint(&routed_spec()).await;

    assert!(report.success, "{}", report.message);
    assert_eq!(
        n.warp.calls(),
        vec!["install", "configure", "register", "connect", "enable_proxy_mode"]
    );
    assert_eq!(report.client_state, ProxyClientState::ProxyModeEnabled);
    assert!(report.routing_active);
    assert!(n.egress.router().is_routing_active().await);
    // Four private ranges, one caller range, ports 80 and 443.
    assert_eq!(n.nat.rule_count(DEFAULT_CHAIN), 7);
    assert_eq!(
        n.nat.output.lock().clone(),
        vec![format!("-o eth0 -j {DEFAULT_CHAIN}")]
    );
}

#[tokio::test]
async fn repeated_setup_is_idempotent() {
    let n = node(FakeWarp::default(), FakeNat::default());
    let spec = routed_spec();
    assert!(n.egress.setup_endpoint(&spec).await.success);
    let report = n.egress.setup_endpoint(&spec).await;
    assert!(report.success, "{}", report.message);
    assert_eq!(n.nat.hook_count(), 1);
    assert_eq!(n.nat.rule_count(DEFAULT_CHAIN), 7);
    assert_eq!(
        n.warp.calls().iter().filter(|c| **c == "install").count(),
        1
    );
}

// ── Failures ────────────────────────────────────────────────────────

#[tokio::test]
async fn connect_failure_names_stage_and_leaves_firewall_alone() {
    let n = node(
        FakeWarp {
            fail_connect: true,
            ..FakeWarp::default()
        },
        FakeNat::default(),
    );
    let report = n.egress.setup_endpoint(&routed_spec()).await;

    assert!(!report.success);
    assert_eq!(report.failed_stage, Some(SetupStage::Connect));
    assert!(report.message.contains("DNS lookup failed"));
    assert!(!report.rolled_back);
    assert!(!n.egress.router().is_routing_active().await);
    assert!(n.nat.chains.lock().is_empty());
    assert!(!n.warp.calls().contains(&"enable_proxy_mode"));
}

#[tokio::test]
async fn rejected_rule_rolls_back_every_partial_write() {
    let n = node(
        FakeWarp::default(),
        FakeNat {
            reject_rule_containing: Some("--dport 443".into()),
            ..FakeNat::default()
        },
    );
    let report = n.egress.setup_endpoint(&routed_spec()).await;

    assert_eq!(report.failed_stage, Some(SetupStage::Routing));
    assert!(report.rolled_back);
    assert!(report.message.contains("--dport 443"));
    assert!(!n.egress.router().is_routing_active().await);
    assert!(n.nat.chains.lock().is_empty());
    assert_eq!(n.nat.hook_count(), 0);
    // The tunnel itself stays up.
    assert_eq!(report.client_state, ProxyClientState::ProxyModeEnabled);
}

#[tokio::test]
async fn stalled_rule_is_a_rolled_back_routing_failure() {
    let n = node(
        FakeWarp::default(),
        FakeNat {
            stall_rule_containing: Some("REDIRECT".into()),
            ..FakeNat::default()
        },
    );
    let report = n.egress.setup_endpoint(&routed_spec()).await;

    assert_eq!(report.failed_stage, Some(SetupStage::Routing));
    assert_eq!(report.error_kind.as_deref(), Some("routing_error"));
    assert!(report.rolled_back);
    assert!(report.message.contains("--dport 80"), "{}", report.message);
    assert!(!report.routing_active);
    assert!(n.nat.chains.lock().is_empty());
}

#[tokio::test]
async fn empty_port_list_fails_without_rollback() {
    let n = node(FakeWarp::default(), FakeNat::default());
    let spec = EndpointSetupSpec {
        redirect_ports: vec![],
        ..routed_spec()
    };
    let report = n.egress.setup_endpoint(&spec).await;

    assert_eq!(report.failed_stage, Some(SetupStage::Routing));
    assert!(!report.rolled_back);
    assert!(n.nat.chains.lock().is_empty());
}

#[tokio::test]
async fn routing_is_refused_without_a_tunnel() {
    let n = node(FakeWarp::default(), FakeNat::default());
    n.egress.install_client().await.unwrap();

    let err = n
        .egress
        .enable_routing(&RoutingRequest::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EgressError::Routing { .. }));
    assert!(!n.egress.router().is_routing_active().await);
    assert!(n.egress.router().current().is_none());
}

#[tokio::test]
async fn lost_tunnel_with_routing_is_reported_degraded() {
    let n = node(FakeWarp::default(), FakeNat::default());
    assert!(n.egress.setup_endpoint(&routed_spec()).await.success);
    n.warp.cut_tunnel();

    let report = n
        .egress
        .setup_endpoint(&EndpointSetupSpec {
            auto_connect: false,
            enable_proxy_mode: false,
            setup_traffic_routing: false,
            ..EndpointSetupSpec::default()
        })
        .await;
    assert!(!report.success);
    assert!(report.degraded);
    assert_eq!(report.client_state, ProxyClientState::Disconnected);

    let status = n.egress.status().await;
    assert_eq!(status.client.state, ProxyClientState::Disconnected);
    assert!(status.routing_active);
}

// ── Concurrency ─────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_setups_do_not_interleave() {
    let n = node(
        FakeWarp {
            slow_install: Some(Duration::from_millis(250)),
            ..FakeWarp::default()
        },
        FakeNat::default(),
    );
    let spec = routed_spec();

    let first = {
        let egress = Arc::clone(&n.egress);
        let spec = spec.clone();
        tokio::spawn(async move { egress.setup_endpoint(&spec).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = {
        let egress = Arc::clone(&n.egress);
        tokio::spawn(async move { egress.setup_endpoint(&spec).await })
    };

    let (first, second) = (first.await.unwrap(), second.await.unwrap());
    let reports = [&first, &second];
    assert_eq!(reports.iter().filter(|r| r.success).count(), 1);
    let loser = reports.iter().find(|r| !r.success).unwrap();
    assert_eq!(loser.error_kind.as_deref(), Some("operation_in_progress"));
    assert!(loser.completed_stages.is_empty());
    assert_eq!(n.nat.hook_count(), 1);
    assert_eq!(n.warp.calls().iter().filter(|c| **c == "install").count(), 1);
}

// ── Teardown ────────────────────────────────────────────────────────

#[tokio::test]
async fn teardown_runs_every_stage_despite_failures() {
    let n = node(FakeWarp::installed_and_connected(), FakeNat::default());
    n.nat.set_fail_detach(true);
    let report = n.egress.teardown_endpoint(true).await;

    // Nothing is hooked, so losing the tunnel is harmless.
    assert!(!report.success);
    assert!(report.message.contains("disable_routing"));
    let by_stage: Vec<(&str, bool)> = report
        .stages
        .iter()
        .map(|s| (s.stage.as_str(), s.success))
        .collect();
    assert_eq!(
        by_stage,
        vec![
            ("disable_routing", false),
            ("disable_proxy_mode", true),
            ("disconnect", true),
        ]
    );
    assert!(n.warp.calls().contains(&"disconnect"));
}

#[tokio::test]
async fn teardown_never_strands_a_hooked_chain() {
    let n = node(FakeWarp::default(), FakeNat::default());
    assert!(n.egress.setup_endpoint(&routed_spec()).await.success);
    n.nat.set_fail_detach(true);

    let report = n.egress.teardown_endpoint(true).await;

    assert!(!report.success);
    assert!(report.routing_active);
    assert!(report.client_state.is_connected());
    assert!(!report.degraded);
    let disconnect = report
        .stages
        .iter()
        .find(|s| s.stage == "disconnect")
        .unwrap();
    assert!(disconnect.skipped);
    assert!(!n.warp.calls().contains(&"disconnect"));
    assert!(report.message.contains("disconnect skipped"));

    // Once the chain comes off, the same call disconnects.
    n.nat.set_fail_detach(false);
    let report = n.egress.teardown_endpoint(true).await;
    assert!(report.success, "{}", report.message);
    assert_eq!(report.client_state, ProxyClientState::Disconnected);
    assert_eq!(n.nat.hook_count(), 0);
}

#[tokio::test]
async fn outbound_hand_off_follows_setup_and_teardown() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("service.json");
    std::fs::write(&path, r#"{"outbounds":[{"type":"direct","tag":"direct"}]}"#).unwrap();
    let outbound = Arc::new(JsonOutboundFile::new(&path, "warp"));

    let n = node_with(
        FakeWarp::default(),
        FakeNat::default(),
        HealthSettings::default(),
        |e| e.with_outbound(outbound),
    );
    let spec = EndpointSetupSpec {
        configure_outbound: true,
        upload_mbps: Some(50),
        download_mbps: Some(200),
        ..routed_spec()
    };
    let report = n.egress.setup_endpoint(&spec).await;
    assert!(report.success, "{}", report.message);
    assert_eq!(report.completed_stages.last(), Some(&SetupStage::Outbound));

    let doc: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    let warp = doc["outbounds"]
        .as_array()
        .unwrap()
        .iter()
        .find(|o| o["tag"] == "warp")
        .unwrap()
        .clone();
    assert_eq!(warp["server_port"], spec.proxy_port);
    assert_eq!(warp["down_mbps"], 200);

    let report = n.egress.teardown_endpoint(false).await;
    assert!(report.success, "{}", report.message);
    let doc: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(doc["outbounds"].as_array().unwrap().len(), 1);
}
