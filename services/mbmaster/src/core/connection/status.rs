//! Status values, snapshots and events surfaced to the configuration surface

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::config::{DataType, RegisterKind, TransportKind};
use crate::core::point::PointValue;

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionStatus {
    SettingUp,
    Connecting,
    Connected,
    PingFailed,
    EstablishmentFailed,
    Stopped,
}

impl ConnectionStatus {
    /// Label shown on the connection node
    pub fn label(self) -> &'static str {
        match self {
            ConnectionStatus::SettingUp => "Setting up connection",
            ConnectionStatus::Connecting => "Connecting to device",
            ConnectionStatus::Connected => "Connected",
            ConnectionStatus::PingFailed => "Device ping failed",
            ConnectionStatus::EstablishmentFailed => "Could not establish connection",
            ConnectionStatus::Stopped => "Stopped",
        }
    }

    /// States in which a scheduled reconnection attempt should still act
    pub fn awaits_reconnect(self) -> bool {
        !matches!(
            self,
            ConnectionStatus::Connected | ConnectionStatus::SettingUp | ConnectionStatus::Stopped
        )
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Device reachability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceStatus {
    Ready,
    NotReady,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceStatus::Ready => f.write_str("Ready"),
            DeviceStatus::NotReady => f.write_str("Not Ready"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PointSnapshot {
    pub name: String,
    pub kind: RegisterKind,
    pub address: u16,
    pub data_type: DataType,
    pub value: Option<PointValue>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    pub name: String,
    pub slave_id: u8,
    pub status: DeviceStatus,
    pub polling_interval_secs: u64,
    pub points: Vec<PointSnapshot>,
}

impl DeviceSnapshot {
    pub fn point(&self, name: &str) -> Option<&PointSnapshot> {
        self.points.iter().find(|p| p.name == name)
    }
}

/// Point-in-time view of one connection
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionSnapshot {
    pub name: String,
    pub transport: TransportKind,
    pub status: ConnectionStatus,
    pub status_label: &'static str,
    /// Delay the next reconnection attempt will wait
    pub retry_delay_secs: u64,
    pub has_handle: bool,
    /// Live scheduler timers (reconnect and poll tasks)
    pub pending_tasks: usize,
    pub devices: Vec<DeviceSnapshot>,
}

impl ConnectionSnapshot {
    pub fn device(&self, name: &str) -> Option<&DeviceSnapshot> {
        self.devices.iter().find(|d| d.name == name)
    }
}

/// Change notifications for the configuration surface
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    ConnectionStatus {
        connection: String,
        status: ConnectionStatus,
    },
    DeviceStatus {
        connection: String,
        device: String,
        status: DeviceStatus,
    },
    PointValue {
        connection: String,
        device: String,
        point: String,
        value: PointValue,
    },
    ConnectionRemoved {
        connection: String,
    },
}
