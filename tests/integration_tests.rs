// tests/integration_tests.rs
//! End-to-end tests of the keeper against the simulated gateway.
//!
//! These drive the public API the way the binary does: config → descriptors
//! → reconciler → scheduler, with drift injected behind the keeper's back.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use portkeeper::nat::{
    ForwardError, ForwardOptions, GatewayMapping, LeaseScheduler, MappingDescriptor, MappingKey,
    MemoryGateway, Protocol, Reconciler, SchedulerState,
};
use portkeeper::KeeperConfig;

fn setup_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

fn key(port: u16, protocol: Protocol) -> MappingKey {
    MappingKey::new(port, protocol, "")
}

fn foreign_row(port: u16) -> GatewayMapping {
    GatewayMapping {
        remote_host: String::new(),
        external_port: port,
        protocol: Protocol::Tcp,
        internal_port: port,
        internal_client: "192.168.1.2".to_string(),
        enabled: true,
        description: "someone else".to_string(),
        lease_seconds: 0,
    }
}

#[tokio::test]
async fn test_partial_failure_keeps_healthy_ports() {
    setup_test_logging();

    let config = KeeperConfig {
        ports: vec!["80:8080".into(), "443:8443".into()],
        ..Default::default()
    };
    let ports = config.descriptors().descriptors;

    let gw = MemoryGateway::default();
    gw.reject_add(8443, true);
    let mut reconciler = Reconciler::new(gw.clone());

    let err = reconciler
        .establish_all(&ports, &config.forward_options())
        .await
        .unwrap_err();

    info!("establish failed as expected: {}", err);
    assert!(err.to_string().contains("8443"));
    assert!(!err.to_string().contains("8080/"));
    assert!(reconciler.get(&key(8080, Protocol::Tcp)).is_some());
    assert!(gw.get(&key(8080, Protocol::Tcp)).is_some());
    assert!(gw.get(&key(8443, Protocol::Tcp)).is_none());
}

#[tokio::test]
async fn test_drift_recreates_exactly_the_missing_mapping() {
    setup_test_logging();

    let gw = MemoryGateway::default();
    gw.insert(foreign_row(22));

    let ports = vec![
        MappingDescriptor::new(80, 8080, Protocol::Tcp),
        MappingDescriptor::new(53, 53, Protocol::Udp),
        MappingDescriptor::new(443, 8443, Protocol::Tcp),
    ];
    let mut reconciler = Reconciler::new(gw.clone());
    reconciler
        .establish_all(&ports, &ForwardOptions::default())
        .await
        .unwrap();

    // router forgot one mapping, shortened another's lease
    gw.remove(&key(53, Protocol::Udp));
    gw.tamper(&key(8080, Protocol::Tcp), |row| row.lease_seconds = 5);
    let before = gw.table();

    reconciler.ensure_all().await.unwrap();

    let after = gw.table();
    assert_eq!(after.len(), before.len() + 1);
    assert!(gw.get(&key(53, Protocol::Udp)).is_some());
    assert_eq!(gw.get(&key(22, Protocol::Tcp)), Some(foreign_row(22)));
    assert_eq!(
        gw.get(&key(8080, Protocol::Tcp)).map(|row| row.lease_seconds),
        Some(5)
    );
    assert_eq!(reconciler.len(), 3);
}

#[tokio::test]
async fn test_teardown_leaves_foreign_rows() {
    setup_test_logging();

    let gw = MemoryGateway::default();
    gw.insert(foreign_row(22));

    let mut reconciler = Reconciler::new(gw.clone());
    reconciler
        .establish_all(
            &[MappingDescriptor::new(80, 8080, Protocol::Tcp)],
            &ForwardOptions::default(),
        )
        .await
        .unwrap();

    reconciler.teardown_all().await.unwrap();

    assert!(reconciler.is_empty());
    assert_eq!(gw.table(), vec![foreign_row(22)]);
}

#[tokio::test]
async fn test_external_address_failure_is_fatal_to_pass() {
    setup_test_logging();

    let gw = MemoryGateway::default();
    gw.fail_external_address(true);
    let mut reconciler = Reconciler::new(gw.clone());

    let err = reconciler
        .establish_all(
            &[MappingDescriptor::new(80, 8080, Protocol::Tcp)],
            &ForwardOptions::default(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, ForwardError::ExternalAddress(_)));
    assert!(gw.table().is_empty());
    assert_eq!(gw.delete_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_keeper_lifecycle() {
    setup_test_logging();

    let config = KeeperConfig::from_json(
        r#"{
            "ports": ["80:8080", "8053:53:udp", "not-a-port"],
            "lease_secs": 120,
            "check_secs": 15,
            "retry_secs": 2
        }"#,
    )
    .unwrap();
    config.validate().unwrap();

    let parsed = config.descriptors();
    assert_eq!(parsed.rejected.len(), 1);

    let gw = MemoryGateway::default();
    let scheduler = LeaseScheduler::new(
        Reconciler::new(gw.clone()),
        parsed.descriptors,
        config.forward_options(),
        config.schedule(),
    );
    let mut state = scheduler.subscribe();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(scheduler.run(cancel.clone()));

    state
        .wait_for(|s| *s == Some(SchedulerState::Running))
        .await
        .unwrap();
    assert_eq!(gw.table().len(), 2);

    // an admin points our port elsewhere, the next drift check repairs it
    gw.tamper(&key(8080, Protocol::Tcp), |row| {
        row.internal_client = "192.168.1.99".into()
    });
    tokio::time::sleep(Duration::from_secs(16)).await;
    assert_eq!(
        gw.get(&key(8080, Protocol::Tcp)).map(|row| row.internal_client),
        Some("192.168.1.10".to_string())
    );

    // renewal fails while the gateway is unreachable, then recovers
    gw.fail_external_address(true);
    tokio::time::sleep(Duration::from_secs(110)).await;
    assert_eq!(*state.borrow(), Some(SchedulerState::Retrying));

    gw.fail_external_address(false);
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(*state.borrow(), Some(SchedulerState::Running));

    cancel.cancel();
    task.await.unwrap().unwrap();
    assert!(gw.table().is_empty());
}
