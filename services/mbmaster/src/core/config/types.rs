//! Configuration type definitions
//!
//! Connection, device and point configuration as entered through the
//! configuration surface and stored in the persisted tree.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MasterError, Result};

/// Modbus limit for a single read of coils/discrete inputs
pub const MODBUS_MAX_READ_BITS: u16 = 2000;
/// Modbus limit for a single read of holding/input registers
pub const MODBUS_MAX_READ_REGISTERS: u16 = 125;
/// Modbus limit for a single write-multiple-registers request
pub const MODBUS_MAX_WRITE_REGISTERS: u16 = 123;

// ============================================================================
// Register model
// ============================================================================

/// Modbus register kind, determines opcode and data width
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterKind {
    Coil,
    DiscreteInput,
    HoldingRegister,
    InputRegister,
}

impl RegisterKind {
    /// Coils and discrete inputs are read as bits
    pub fn is_bit(self) -> bool {
        matches!(self, RegisterKind::Coil | RegisterKind::DiscreteInput)
    }

    pub fn is_writable(self) -> bool {
        matches!(self, RegisterKind::Coil | RegisterKind::HoldingRegister)
    }
}

impl fmt::Display for RegisterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterKind::Coil => write!(f, "coil"),
            RegisterKind::DiscreteInput => write!(f, "discrete_input"),
            RegisterKind::HoldingRegister => write!(f, "holding_register"),
            RegisterKind::InputRegister => write!(f, "input_register"),
        }
    }
}

/// Point data type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Bool,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float32,
    Int64,
    Uint64,
    Float64,
}

impl DataType {
    /// Number of 16-bit registers occupied by this type
    pub fn register_count(self) -> u16 {
        match self {
            DataType::Bool | DataType::Int16 | DataType::Uint16 => 1,
            DataType::Int32 | DataType::Uint32 | DataType::Float32 => 2,
            DataType::Int64 | DataType::Uint64 | DataType::Float64 => 4,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataType::Bool => "bool",
            DataType::Int16 => "int16",
            DataType::Uint16 => "uint16",
            DataType::Int32 => "int32",
            DataType::Uint32 => "uint32",
            DataType::Float32 => "float32",
            DataType::Int64 => "int64",
            DataType::Uint64 => "uint64",
            DataType::Float64 => "float64",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Transport configuration
// ============================================================================

/// Closed set of transport kinds accepted by Add/Edit Connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Tcp,
    Udp,
    SerialRtu,
    SerialAscii,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Tcp => write!(f, "TCP"),
            TransportKind::Udp => write!(f, "UDP"),
            TransportKind::SerialRtu => write!(f, "RTU"),
            TransportKind::SerialAscii => write!(f, "ASCII"),
        }
    }
}

impl Serialize for TransportKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl FromStr for TransportKind {
    type Err = MasterError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "TCP" => Ok(TransportKind::Tcp),
            "UDP" => Ok(TransportKind::Udp),
            "RTU" | "SERIAL_RTU" => Ok(TransportKind::SerialRtu),
            "ASCII" | "SERIAL_ASCII" => Ok(TransportKind::SerialAscii),
            _ => Err(MasterError::config(format!("Unknown transport type: {s}"))),
        }
    }
}

/// Serial line parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
    Mark,
    Space,
}

impl FromStr for Parity {
    type Err = MasterError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "NONE" => Ok(Parity::None),
            "ODD" => Ok(Parity::Odd),
            "EVEN" => Ok(Parity::Even),
            "MARK" => Ok(Parity::Mark),
            "SPACE" => Ok(Parity::Space),
            _ => Err(MasterError::config(format!("Unknown parity: {s}"))),
        }
    }
}

/// Serial port parameters shared by RTU and ASCII
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialParams {
    /// Serial port identifier, e.g. `/dev/ttyUSB0` or `COM3`
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default)]
    pub parity: Parity,
    /// Write every pending request before reading any response
    #[serde(default)]
    pub send_requests_all_at_once: bool,
    /// Custom inter-character spacing in microseconds (RTU only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub char_spacing_us: Option<u32>,
    /// Custom inter-frame spacing in microseconds (RTU only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_spacing_us: Option<u32>,
}

fn default_baud_rate() -> u32 {
    9600
}
fn default_data_bits() -> u8 {
    8
}
fn default_stop_bits() -> u8 {
    1
}
fn default_port() -> u16 {
    502
}

impl SerialParams {
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
            parity: Parity::None,
            send_requests_all_at_once: false,
            char_spacing_us: None,
            frame_spacing_us: None,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.port.trim().is_empty() {
            return Err(MasterError::config("Serial port cannot be empty"));
        }
        if self.baud_rate == 0 {
            return Err(MasterError::config("Baud rate must be greater than 0"));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(MasterError::config(format!(
                "Data bits must be 5-8, got {}",
                self.data_bits
            )));
        }
        if !(1..=2).contains(&self.stop_bits) {
            return Err(MasterError::config(format!(
                "Stop bits must be 1 or 2, got {}",
                self.stop_bits
            )));
        }
        Ok(())
    }
}

/// Transport-specific parameters, one variant per transport kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    Tcp {
        host: String,
        #[serde(default = "default_port")]
        port: u16,
    },
    Udp {
        host: String,
        #[serde(default = "default_port")]
        port: u16,
    },
    SerialRtu(SerialParams),
    SerialAscii(SerialParams),
}

impl TransportConfig {
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportConfig::Tcp { .. } => TransportKind::Tcp,
            TransportConfig::Udp { .. } => TransportKind::Udp,
            TransportConfig::SerialRtu(_) => TransportKind::SerialRtu,
            TransportConfig::SerialAscii(_) => TransportKind::SerialAscii,
        }
    }

    /// Human readable endpoint for logs
    pub fn endpoint(&self) -> String {
        match self {
            TransportConfig::Tcp { host, port } | TransportConfig::Udp { host, port } => {
                format!("{}:{}", host, port)
            },
            TransportConfig::SerialRtu(p) | TransportConfig::SerialAscii(p) => p.port.clone(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            TransportConfig::Tcp { host, port } | TransportConfig::Udp { host, port } => {
                if host.trim().is_empty() {
                    return Err(MasterError::config("Host cannot be empty"));
                }
                if *port == 0 {
                    return Err(MasterError::config("Port must be greater than 0"));
                }
                Ok(())
            },
            TransportConfig::SerialRtu(p) | TransportConfig::SerialAscii(p) => p.validate(),
        }
    }
}

// ============================================================================
// Tuning parameters
// ============================================================================

/// Tuning shared by every transport kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningParams {
    /// Response timeout in milliseconds
    pub timeout_ms: u64,
    pub retries: u32,
    pub max_read_bit_count: u16,
    pub max_read_register_count: u16,
    pub max_write_register_count: u16,
    /// Delay after a write before incoming data is trusted again
    pub discard_data_delay_ms: u64,
    /// Issue every write as a multiple-write request
    pub multiple_writes_only: bool,
}

impl Default for TuningParams {
    fn default() -> Self {
        Self {
            timeout_ms: 500,
            retries: 2,
            max_read_bit_count: MODBUS_MAX_READ_BITS,
            max_read_register_count: MODBUS_MAX_READ_REGISTERS,
            max_write_register_count: 120,
            discard_data_delay_ms: 0,
            multiple_writes_only: false,
        }
    }
}

impl TuningParams {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        check_count("max read bit count", self.max_read_bit_count, MODBUS_MAX_READ_BITS)?;
        check_count(
            "max read register count",
            self.max_read_register_count,
            MODBUS_MAX_READ_REGISTERS,
        )?;
        check_count(
            "max write register count",
            self.max_write_register_count,
            MODBUS_MAX_WRITE_REGISTERS,
        )
    }
}

fn check_count(what: &str, value: u16, limit: u16) -> Result<()> {
    if value == 0 || value > limit {
        return Err(MasterError::config(format!(
            "{what} must be within 1..={limit}, got {value}"
        )));
    }
    Ok(())
}

// ============================================================================
// Connection / device / point configuration
// ============================================================================

/// Full configuration of one connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub name: String,
    pub transport: TransportConfig,
    #[serde(default)]
    pub tuning: TuningParams,
}

impl ConnectionConfig {
    pub fn new(name: impl Into<String>, transport: TransportConfig) -> Self {
        Self {
            name: name.into(),
            transport,
            tuning: TuningParams::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_name("Connection", &self.name)?;
        self.transport.validate()?;
        self.tuning.validate()
    }
}

/// Device (slave) settings exposed by Add/Edit Device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSettings {
    pub name: String,
    pub slave_id: u8,
    pub polling_interval_secs: u64,
    #[serde(default)]
    pub zero_on_failed_poll: bool,
    #[serde(default = "default_true")]
    pub use_batch_polling: bool,
    #[serde(default)]
    pub contiguous_batch_only: bool,
}

fn default_true() -> bool {
    true
}

impl DeviceSettings {
    /// Settings with the Add Device defaults
    pub fn new(name: impl Into<String>, slave_id: u8, polling_interval_secs: u64) -> Self {
        Self {
            name: name.into(),
            slave_id,
            polling_interval_secs,
            zero_on_failed_poll: false,
            use_batch_polling: true,
            contiguous_batch_only: false,
        }
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_secs)
    }

    pub fn validate(&self) -> Result<()> {
        validate_name("Device", &self.name)?;
        if !(1..=247).contains(&self.slave_id) {
            return Err(MasterError::config(format!(
                "Slave id must be within 1..=247, got {}",
                self.slave_id
            )));
        }
        if self.polling_interval_secs == 0 {
            return Err(MasterError::config(
                "Polling interval must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// One register-backed point of a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointConfig {
    pub name: String,
    pub kind: RegisterKind,
    pub address: u16,
    pub data_type: DataType,
}

impl PointConfig {
    pub fn new(name: impl Into<String>, kind: RegisterKind, address: u16, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            kind,
            address,
            data_type,
        }
    }

    /// Width in units of the register kind (bits or 16-bit registers)
    pub fn width(&self) -> u16 {
        if self.kind.is_bit() {
            1
        } else {
            self.data_type.register_count()
        }
    }

    /// Last address covered by this point
    pub fn end_address(&self) -> u16 {
        self.address.saturating_add(self.width() - 1)
    }

    pub fn validate(&self) -> Result<()> {
        validate_name("Point", &self.name)?;
        if self.kind.is_bit() && self.data_type != DataType::Bool {
            return Err(MasterError::config(format!(
                "Point '{}': {} points must be bool, got {}",
                self.name, self.kind, self.data_type
            )));
        }
        if u32::from(self.address) + u32::from(self.width()) > 0x1_0000 {
            return Err(MasterError::config(format!(
                "Point '{}': {} at address {} exceeds the register space",
                self.name, self.data_type, self.address
            )));
        }
        Ok(())
    }
}

fn validate_name(what: &str, name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(MasterError::config(format!("{what} name cannot be empty")));
    }
    Ok(())
}
