//! Acquisition core
//!
//! - `config`: connection, device and point configuration
//! - `transport`: master handle seam and the simulated bus
//! - `connection`: per-connection actor and reconnection state machine
//! - `device` / `batch` / `point`: poll cycle, read planning, value codec
//! - `gateway`: connection registry
//! - `persistence`: persisted tree and file store

pub mod batch;
pub mod config;
pub mod connection;
pub mod device;
pub mod gateway;
pub mod persistence;
pub mod point;
pub mod transport;
