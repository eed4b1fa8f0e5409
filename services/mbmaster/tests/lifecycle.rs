//! Connection lifecycle and reconnection over the simulated bus

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

mod support;

use mbmaster::core::config::{DataType, DeviceSettings, PointConfig, RegisterKind};
use mbmaster::core::point::PointValue;
use mbmaster::runtime::ReconnectPolicy;
use mbmaster::{ConnectionStatus, DeviceStatus, MasterError};

use support::*;

#[tokio::test(start_paused = true)]
async fn test_connection_waits_for_first_device() {
    let (gateway, bus) = setup();
    gateway.add_connection(tcp("plc1")).await.unwrap();
    settle().await;

    let snap = snapshot(&gateway, "plc1").await;
    assert_eq!(snap.status, ConnectionStatus::SettingUp);
    assert_eq!(snap.status_label, "Setting up connection");
    assert!(!snap.has_handle);
    assert_eq!(bus.opened(), 0);

    bus.set_register(1, RegisterKind::InputRegister, 0, 7);
    gateway
        .add_device("plc1", DeviceSettings::new("meter", 1, 5), vec![input_u16("v", 0)])
        .await
        .unwrap();
    settle().await;

    let snap = snapshot(&gateway, "plc1").await;
    assert_eq!(snap.status, ConnectionStatus::Connected);
    assert!(snap.has_handle);
    assert_eq!(snap.retry_delay_secs, 1);
    let meter = snap.device("meter").unwrap();
    assert_eq!(meter.status, DeviceStatus::Ready);
    assert_eq!(meter.point("v").unwrap().value, Some(PointValue::UInt(7)));
    assert_eq!(pings(&bus, "plc1"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_retry_delay_grows_to_ceiling_and_resets() {
    let (gateway, bus) = setup_with_policy(ReconnectPolicy::from_config(1, 2, 5));
    bus.set_refuse_open(true);
    let mut events = gateway.subscribe();

    gateway.add_connection(tcp("plc1")).await.unwrap();
    gateway
        .add_device("plc1", DeviceSettings::new("meter", 1, 5), Vec::new())
        .await
        .unwrap();

    // Attempts at t = 0, 1, 4, 9, then every 5s
    advance(0.5).await;
    let mut failures = drain_status(&mut events, ConnectionStatus::EstablishmentFailed);
    assert_eq!(failures, 1);
    let snap = snapshot(&gateway, "plc1").await;
    assert_eq!(snap.status_label, "Could not establish connection");
    assert_eq!(snap.retry_delay_secs, 3);
    assert!(!snap.has_handle);

    advance(1.0).await;
    failures += drain_status(&mut events, ConnectionStatus::EstablishmentFailed);
    assert_eq!(failures, 2);
    assert_eq!(snapshot(&gateway, "plc1").await.retry_delay_secs, 5);

    advance(2.0).await;
    failures += drain_status(&mut events, ConnectionStatus::EstablishmentFailed);
    assert_eq!(failures, 2);

    advance(1.0).await;
    failures += drain_status(&mut events, ConnectionStatus::EstablishmentFailed);
    assert_eq!(failures, 3);
    assert_eq!(snapshot(&gateway, "plc1").await.retry_delay_secs, 5);

    advance(4.0).await;
    failures += drain_status(&mut events, ConnectionStatus::EstablishmentFailed);
    assert_eq!(failures, 3);

    advance(1.0).await;
    failures += drain_status(&mut events, ConnectionStatus::EstablishmentFailed);
    assert_eq!(failures, 4);

    bus.set_refuse_open(false);
    advance(5.0).await;
    let snap = snapshot(&gateway, "plc1").await;
    assert_eq!(snap.status, ConnectionStatus::Connected);
    assert_eq!(snap.retry_delay_secs, 1);
    assert_eq!(snap.device("meter").unwrap().status, DeviceStatus::Ready);
    assert_eq!(bus.max_live_handles_for("plc1"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_devices_added_together_share_one_check() {
    let (gateway, bus) = setup();
    bus.set_refuse_open(true);
    gateway.add_connection(tcp("plc1")).await.unwrap();
    gateway
        .add_device("plc1", DeviceSettings::new("meter", 1, 5), Vec::new())
        .await
        .unwrap();
    gateway
        .add_device("plc1", DeviceSettings::new("pump", 2, 5), Vec::new())
        .await
        .unwrap();
    settle().await;

    // One failed attempt: the next one comes after the floor delay
    let snap = snapshot(&gateway, "plc1").await;
    assert_eq!(snap.status, ConnectionStatus::EstablishmentFailed);
    assert_eq!(snap.retry_delay_secs, 3);
    assert_eq!(snap.pending_tasks, 1);

    bus.set_refuse_open(false);
    advance(1.0).await;
    let snap = snapshot(&gateway, "plc1").await;
    assert_eq!(snap.status, ConnectionStatus::Connected);
    assert_eq!(bus.opened(), 1);
    assert_eq!(pings(&bus, "plc1"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_without_devices_waits_for_next_device() {
    let (gateway, bus) = setup();
    bus.set_refuse_open(true);
    gateway.add_connection(tcp("plc1")).await.unwrap();
    gateway
        .add_device("plc1", DeviceSettings::new("meter", 1, 5), Vec::new())
        .await
        .unwrap();
    settle().await;
    assert_eq!(
        snapshot(&gateway, "plc1").await.status,
        ConnectionStatus::EstablishmentFailed
    );

    // The retry at t = 1 finds nothing to ping
    gateway.remove_device("plc1", "meter").await.unwrap();
    advance(1.0).await;
    let snap = snapshot(&gateway, "plc1").await;
    assert_eq!(snap.status, ConnectionStatus::SettingUp);
    assert!(!snap.has_handle);
    assert_eq!(snap.pending_tasks, 0);
    assert_eq!(snap.retry_delay_secs, 1);

    bus.set_refuse_open(false);
    bus.set_register(2, RegisterKind::InputRegister, 0, 9);
    gateway
        .add_device("plc1", DeviceSettings::new("pump", 2, 5), vec![input_u16("v", 0)])
        .await
        .unwrap();
    settle().await;
    let snap = snapshot(&gateway, "plc1").await;
    assert_eq!(snap.status, ConnectionStatus::Connected);
    assert_eq!(
        snap.device("pump").unwrap().point("v").unwrap().value,
        Some(PointValue::UInt(9))
    );
}

#[tokio::test(start_paused = true)]
async fn test_ping_failure_releases_handle_and_recovers() {
    let (gateway, bus) = setup();
    bus.set_register(1, RegisterKind::InputRegister, 0, 7);
    gateway.add_connection(tcp("plc1")).await.unwrap();
    gateway
        .add_device("plc1", DeviceSettings::new("meter", 1, 5), vec![input_u16("v", 0)])
        .await
        .unwrap();
    settle().await;
    assert_eq!(snapshot(&gateway, "plc1").await.status, ConnectionStatus::Connected);

    // The poll at t = 5 fails entirely, the re-check ping fails too
    bus.set_slave_silent(1, true);
    advance(5.0).await;
    let snap = snapshot(&gateway, "plc1").await;
    assert_eq!(snap.status, ConnectionStatus::PingFailed);
    assert_eq!(snap.status_label, "Device ping failed");
    assert!(!snap.has_handle);
    assert_eq!(bus.live_handles_for("plc1"), 0);
    assert_eq!(snap.device("meter").unwrap().status, DeviceStatus::NotReady);

    bus.set_slave_silent(1, false);
    advance(1.0).await;
    let snap = snapshot(&gateway, "plc1").await;
    assert_eq!(snap.status, ConnectionStatus::Connected);
    assert!(snap.has_handle);
    assert_eq!(snap.device("meter").unwrap().status, DeviceStatus::Ready);
    assert_eq!(bus.opened(), 2);
    assert_eq!(bus.max_live_handles_for("plc1"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_cancels_everything_and_restart_reconnects() {
    let (gateway, bus) = setup();
    gateway.add_connection(tcp("plc1")).await.unwrap();
    gateway
        .add_device("plc1", DeviceSettings::new("meter", 1, 5), vec![input_u16("v", 0)])
        .await
        .unwrap();
    settle().await;

    gateway.stop_connection("plc1").await.unwrap();
    let snap = snapshot(&gateway, "plc1").await;
    assert_eq!(snap.status, ConnectionStatus::Stopped);
    assert_eq!(snap.status_label, "Stopped");
    assert!(!snap.has_handle);
    assert_eq!(snap.pending_tasks, 0);
    assert_eq!(snap.device("meter").unwrap().status, DeviceStatus::NotReady);
    assert_eq!(bus.live_handles(), 0);

    bus.clear_requests();
    advance(30.0).await;
    assert!(bus.requests_for("plc1").is_empty());
    assert_eq!(snapshot(&gateway, "plc1").await.status, ConnectionStatus::Stopped);

    gateway.restart_connection("plc1").await.unwrap();
    settle().await;
    let snap = snapshot(&gateway, "plc1").await;
    assert_eq!(snap.status, ConnectionStatus::Connected);
    assert_eq!(snap.pending_tasks, 1);
    assert!(snap.device("meter").unwrap().point("v").is_some());
}

#[tokio::test(start_paused = true)]
async fn test_stop_discards_pending_reconnect() {
    let (gateway, bus) = setup();
    bus.set_refuse_open(true);
    gateway.add_connection(tcp("plc1")).await.unwrap();
    gateway
        .add_device("plc1", DeviceSettings::new("meter", 1, 5), Vec::new())
        .await
        .unwrap();
    settle().await;
    let snap = snapshot(&gateway, "plc1").await;
    assert_eq!(snap.status, ConnectionStatus::EstablishmentFailed);
    assert_eq!(snap.pending_tasks, 1);

    gateway.stop_connection("plc1").await.unwrap();
    bus.set_refuse_open(false);
    advance(10.0).await;
    let snap = snapshot(&gateway, "plc1").await;
    assert_eq!(snap.status, ConnectionStatus::Stopped);
    assert_eq!(bus.opened(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_remove_stops_all_activity() {
    let (gateway, bus) = setup();
    gateway.add_connection(tcp("plc1")).await.unwrap();
    gateway
        .add_device("plc1", DeviceSettings::new("meter", 1, 1), vec![input_u16("v", 0)])
        .await
        .unwrap();
    settle().await;
    assert_eq!(bus.live_handles(), 1);

    gateway.remove_connection("plc1").await.unwrap();
    assert_eq!(bus.live_handles(), 0);
    assert!(matches!(
        gateway.snapshot("plc1").await,
        Err(MasterError::NotFound(_))
    ));
    assert!(matches!(
        gateway.remove_connection("plc1").await,
        Err(MasterError::NotFound(_))
    ));

    bus.clear_requests();
    advance(10.0).await;
    assert!(bus.requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_rename_moves_subtree() {
    let (gateway, bus) = setup();
    gateway.add_connection(tcp("plc1")).await.unwrap();
    gateway
        .add_device(
            "plc1",
            DeviceSettings::new("meter", 3, 5),
            vec![input_u16("v", 0), PointConfig::new("trip", RegisterKind::Coil, 4, DataType::Bool)],
        )
        .await
        .unwrap();
    settle().await;

    let mut renamed = tcp("plc2");
    renamed.tuning.timeout_ms = 1000;
    gateway.edit_connection("plc1", renamed).await.unwrap();
    settle().await;

    assert!(matches!(
        gateway.snapshot("plc1").await,
        Err(MasterError::NotFound(_))
    ));
    assert_eq!(bus.live_handles_for("plc1"), 0);

    let snap = snapshot(&gateway, "plc2").await;
    assert_eq!(snap.status, ConnectionStatus::Connected);
    let meter = snap.device("meter").unwrap();
    assert_eq!(meter.slave_id, 3);
    assert_eq!(meter.points.len(), 2);
    assert!(meter.point("trip").is_some());
    assert_eq!(bus.max_live_handles_for("plc2"), 1);

    let records = gateway.records().await.unwrap();
    assert_eq!(records.connections.len(), 1);
    assert_eq!(records.connections[0].tuning.timeout_ms, 1000);

    gateway.add_connection(tcp("plc3")).await.unwrap();
    assert!(matches!(
        gateway.edit_connection("plc2", tcp("plc3")).await,
        Err(MasterError::AlreadyExists(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_edit_in_place_reacquires_handle() {
    let (gateway, bus) = setup();
    gateway.add_connection(tcp("plc1")).await.unwrap();
    gateway
        .add_device("plc1", DeviceSettings::new("meter", 1, 5), Vec::new())
        .await
        .unwrap();
    settle().await;

    let mut edited = tcp("plc1");
    edited.tuning.retries = 5;
    gateway.edit_connection("plc1", edited).await.unwrap();
    settle().await;

    let snap = snapshot(&gateway, "plc1").await;
    assert_eq!(snap.status, ConnectionStatus::Connected);
    assert_eq!(bus.opened(), 2);
    assert_eq!(bus.closed(), 1);
    assert_eq!(bus.max_live_handles_for("plc1"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_edit_while_stopped_stays_stopped() {
    let (gateway, bus) = setup();
    gateway.add_connection(tcp("plc1")).await.unwrap();
    gateway
        .add_device("plc1", DeviceSettings::new("meter", 1, 5), Vec::new())
        .await
        .unwrap();
    settle().await;
    gateway.stop_connection("plc1").await.unwrap();

    let mut edited = tcp("plc1");
    edited.tuning.retries = 0;
    gateway.edit_connection("plc1", edited).await.unwrap();
    advance(5.0).await;

    assert_eq!(snapshot(&gateway, "plc1").await.status, ConnectionStatus::Stopped);
    assert_eq!(bus.opened(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_points_must_fit_one_read() {
    let (gateway, _bus) = setup();
    let mut narrow = tcp("plc1");
    narrow.tuning.max_read_register_count = 3;
    gateway.add_connection(narrow).await.unwrap();

    let energy = PointConfig::new("energy", RegisterKind::HoldingRegister, 0, DataType::Float64);
    assert!(matches!(
        gateway
            .add_device("plc1", DeviceSettings::new("meter", 1, 5), vec![energy.clone()])
            .await,
        Err(MasterError::Config(_))
    ));
    assert!(gateway.snapshot("plc1").await.unwrap().devices.is_empty());

    gateway
        .add_device("plc1", DeviceSettings::new("meter", 1, 5), Vec::new())
        .await
        .unwrap();
    assert!(matches!(
        gateway.add_point("plc1", "meter", energy).await,
        Err(MasterError::Config(_))
    ));
    let power = PointConfig::new("power", RegisterKind::HoldingRegister, 0, DataType::Float32);
    gateway.add_point("plc1", "meter", power).await.unwrap();

    // Narrowing below an existing point is refused
    let mut narrower = tcp("plc1");
    narrower.tuning.max_read_register_count = 1;
    assert!(matches!(
        gateway.edit_connection("plc1", narrower).await,
        Err(MasterError::Config(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_rejected_configuration() {
    let (gateway, _bus) = setup();
    gateway.add_connection(tcp("plc1")).await.unwrap();

    assert!(matches!(
        gateway.add_connection(tcp("plc1")).await,
        Err(MasterError::AlreadyExists(_))
    ));
    assert!(matches!(
        gateway
            .add_device("plc1", DeviceSettings::new("bad", 0, 5), Vec::new())
            .await,
        Err(MasterError::Config(_))
    ));
    assert!(matches!(
        gateway
            .add_device("plc1", DeviceSettings::new("slow", 1, 0), Vec::new())
            .await,
        Err(MasterError::Config(_))
    ));
    assert!(matches!(
        gateway
            .add_device("nowhere", DeviceSettings::new("meter", 1, 5), Vec::new())
            .await,
        Err(MasterError::NotFound(_))
    ));

    gateway
        .add_device("plc1", DeviceSettings::new("meter", 1, 5), Vec::new())
        .await
        .unwrap();
    assert!(matches!(
        gateway
            .add_device("plc1", DeviceSettings::new("meter", 2, 5), Vec::new())
            .await,
        Err(MasterError::AlreadyExists(_))
    ));
    assert!(matches!(
        gateway
            .add_point(
                "plc1",
                "meter",
                PointConfig::new("x", RegisterKind::Coil, 0, DataType::Float32)
            )
            .await,
        Err(MasterError::Config(_))
    ));

    let mut bad = tcp("plc1");
    bad.tuning.max_read_register_count = 0;
    assert!(matches!(
        gateway.edit_connection("plc1", bad).await,
        Err(MasterError::Config(_))
    ));
}
