//! Modbus master gateway core
//!
//! Keeps one master handle per configured connection, recovers it with a
//! linear back-off when the link or the slave goes away, and polls every
//! device on its own interval with batched reads.
//!
//! ```text
//! ┌─────────────────┐    ┌─────────────────┐    ┌─────────────────┐
//! │     Gateway     │───►│   Connection    │───►│ TransportFactory│
//! │   (registry)    │    │  (actor task)   │    │  (master handle)│
//! └─────────────────┘    └─────────────────┘    └─────────────────┘
//!          │                      │
//!          ▼                      ▼
//! ┌─────────────────┐    ┌─────────────────┐
//! │   StateStore    │    │ Device polling  │
//! │  (YAML / JSON)  │    │ (batched reads) │
//! └─────────────────┘    └─────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use mbmaster::core::config::{ConnectionConfig, DeviceSettings, TransportConfig};
//! use mbmaster::core::gateway::Gateway;
//! use mbmaster::core::transport::SimulatedBus;
//! use mbmaster::runtime::ReconnectPolicy;
//!
//! # async fn run() -> mbmaster::Result<()> {
//! let gateway = Gateway::new(Arc::new(SimulatedBus::new()), ReconnectPolicy::default());
//! let transport = TransportConfig::Tcp {
//!     host: "192.168.1.10".to_string(),
//!     port: 502,
//! };
//! gateway.add_connection(ConnectionConfig::new("plc1", transport)).await?;
//! gateway
//!     .add_device("plc1", DeviceSettings::new("meter", 1, 5), Vec::new())
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod core;
pub mod error;
pub mod runtime;

pub use crate::core::connection::status::{ConnectionSnapshot, ConnectionStatus, DeviceStatus, GatewayEvent};
pub use crate::core::gateway::Gateway;
pub use crate::core::persistence::{StateDocument, StateStore};
pub use error::{MasterError, Result};
