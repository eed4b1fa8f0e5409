//! Configuration management
//!
//! - `app`: process configuration (logging, state location, reconnect policy)
//! - `types`: connection, device and point configuration

pub mod app;
pub mod types;

pub use app::{AppConfig, Overrides};
pub use types::{
    ConnectionConfig, DataType, DeviceSettings, Parity, PointConfig, RegisterKind, SerialParams,
    TransportConfig, TransportKind, TuningParams,
};
