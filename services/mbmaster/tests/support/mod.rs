//! Shared helpers for the gateway integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use mbmaster::core::config::{ConnectionConfig, DataType, PointConfig, RegisterKind, TransportConfig};
use mbmaster::core::gateway::Gateway;
use mbmaster::core::transport::{SimulatedBus, SimulatedRequest};
use mbmaster::runtime::ReconnectPolicy;
use mbmaster::{ConnectionSnapshot, ConnectionStatus, GatewayEvent};
use tokio::sync::broadcast;

/// Gateway over a fresh simulated bus with the default reconnect policy
pub fn setup() -> (Gateway, SimulatedBus) {
    setup_with_policy(ReconnectPolicy::default())
}

pub fn setup_with_policy(policy: ReconnectPolicy) -> (Gateway, SimulatedBus) {
    let bus = SimulatedBus::new();
    let gateway = Gateway::new(Arc::new(bus.clone()), policy);
    (gateway, bus)
}

pub fn tcp(name: &str) -> ConnectionConfig {
    ConnectionConfig::new(
        name,
        TransportConfig::Tcp {
            host: "10.0.0.1".to_string(),
            port: 502,
        },
    )
}

pub fn input_u16(name: &str, address: u16) -> PointConfig {
    PointConfig::new(name, RegisterKind::InputRegister, address, DataType::Uint16)
}

pub fn holding_u16(name: &str, address: u16) -> PointConfig {
    PointConfig::new(name, RegisterKind::HoldingRegister, address, DataType::Uint16)
}

/// Let the actors drain their mailboxes without crossing a poll boundary
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

pub async fn advance(secs: f64) {
    tokio::time::sleep(Duration::from_secs_f64(secs)).await;
}

pub async fn snapshot(gateway: &Gateway, name: &str) -> ConnectionSnapshot {
    gateway
        .snapshot(name)
        .await
        .unwrap_or_else(|e| panic!("snapshot of {}: {}", name, e))
}

pub fn reads(bus: &SimulatedBus, connection: &str) -> Vec<SimulatedRequest> {
    bus.requests_for(connection)
        .into_iter()
        .filter(SimulatedRequest::is_read)
        .collect()
}

pub fn pings(bus: &SimulatedBus, connection: &str) -> usize {
    bus.requests_for(connection)
        .iter()
        .filter(|r| matches!(r, SimulatedRequest::Ping { .. }))
        .count()
}

/// Count queued connection status events equal to `status`
pub fn drain_status(events: &mut broadcast::Receiver<GatewayEvent>, status: ConnectionStatus) -> usize {
    let mut count = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, GatewayEvent::ConnectionStatus { status: s, .. } if s == status) {
            count += 1;
        }
    }
    count
}
