//! Transport adapter seam
//!
//! The gateway never speaks the Modbus wire format itself. A
//! [`TransportFactory`] opens one master handle per connection from its
//! [`ConnectionConfig`], and the handle executes single read/write requests
//! against a slave. Adapters over blocking libraries should run each call on
//! `tokio::task::spawn_blocking`; the connection actor awaits the call, so
//! only that connection's own work waits on it.

pub mod simulator;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::config::{ConnectionConfig, RegisterKind};

pub use simulator::{SimulatedBus, SimulatedRequest};

/// Transport layer error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Handle could not be opened or is no longer usable
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Read/write on the link failed
    #[error("IO error: {0}")]
    Io(String),

    /// Slave did not answer in time
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Malformed response or exception reply
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Transport result alias
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// One live Modbus master handle
#[async_trait]
pub trait ModbusMaster: Send {
    /// Cheap liveness check of one slave
    async fn ping(&mut self, slave_id: u8) -> bool;

    /// Read coils or discrete inputs
    async fn read_bits(
        &mut self,
        slave_id: u8,
        kind: RegisterKind,
        start: u16,
        count: u16,
    ) -> TransportResult<Vec<bool>>;

    /// Read holding or input registers
    async fn read_registers(
        &mut self,
        slave_id: u8,
        kind: RegisterKind,
        start: u16,
        count: u16,
    ) -> TransportResult<Vec<u16>>;

    /// Write holding registers; `force_multiple` selects function 16 even for one register
    async fn write_registers(
        &mut self,
        slave_id: u8,
        start: u16,
        values: &[u16],
        force_multiple: bool,
    ) -> TransportResult<()>;

    /// Write coils; `force_multiple` selects function 15 even for one coil
    async fn write_coils(
        &mut self,
        slave_id: u8,
        start: u16,
        values: &[bool],
        force_multiple: bool,
    ) -> TransportResult<()>;

    /// Release the underlying link
    async fn close(&mut self) -> TransportResult<()>;
}

/// Owned master handle as held by a connection
pub type MasterHandle = Box<dyn ModbusMaster>;

/// Opens master handles for connection configurations
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(&self, config: &ConnectionConfig) -> TransportResult<MasterHandle>;
}
