//! In-memory Modbus bus
//!
//! Implements the transport seam without any I/O. Register and coil tables
//! are shared by every handle opened from the same bus; faults (refused
//! opens, silent slaves, failing address ranges) can be injected at runtime.
//! Every request is recorded, together with open/close counters, so callers
//! can assert exactly what went over the "wire".

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::{ModbusMaster, TransportError, TransportFactory, TransportResult};
use crate::core::config::types::{MODBUS_MAX_READ_BITS, MODBUS_MAX_READ_REGISTERS};
use crate::core::config::{ConnectionConfig, RegisterKind};

/// A request as it would have been sent by a master
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimulatedRequest {
    Ping {
        slave_id: u8,
    },
    ReadBits {
        slave_id: u8,
        kind: RegisterKind,
        start: u16,
        count: u16,
    },
    ReadRegisters {
        slave_id: u8,
        kind: RegisterKind,
        start: u16,
        count: u16,
    },
    WriteSingleRegister {
        slave_id: u8,
        address: u16,
        value: u16,
    },
    WriteMultipleRegisters {
        slave_id: u8,
        start: u16,
        values: Vec<u16>,
    },
    WriteSingleCoil {
        slave_id: u8,
        address: u16,
        value: bool,
    },
    WriteMultipleCoils {
        slave_id: u8,
        start: u16,
        values: Vec<bool>,
    },
}

impl SimulatedRequest {
    pub fn is_read(&self) -> bool {
        matches!(
            self,
            SimulatedRequest::ReadBits { .. } | SimulatedRequest::ReadRegisters { .. }
        )
    }
}

#[derive(Debug, Clone, Copy)]
struct FailingRange {
    slave_id: u8,
    kind: RegisterKind,
    start: u16,
    end: u16,
}

#[derive(Debug, Default)]
struct BusState {
    refuse_open: bool,
    silent_slaves: HashSet<u8>,
    failing_ranges: Vec<FailingRange>,
    registers: HashMap<(u8, RegisterKind, u16), u16>,
    bits: HashMap<(u8, RegisterKind, u16), bool>,
    latency: Duration,
    requests: Vec<(String, SimulatedRequest)>,
    opened: usize,
    closed: usize,
    live: usize,
    max_live: usize,
    live_by_connection: HashMap<String, usize>,
    max_live_by_connection: HashMap<String, usize>,
}

/// Shared in-memory bus, doubling as the transport factory
#[derive(Debug, Clone, Default)]
pub struct SimulatedBus {
    state: Arc<Mutex<BusState>>,
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self::default()
    }

    // ========== Fault injection ==========

    /// Refuse (or accept again) every subsequent open
    pub fn set_refuse_open(&self, refuse: bool) {
        self.state.lock().refuse_open = refuse;
    }

    /// A silent slave fails pings and times out on every request
    pub fn set_slave_silent(&self, slave_id: u8, silent: bool) {
        let mut state = self.state.lock();
        if silent {
            state.silent_slaves.insert(slave_id);
        } else {
            state.silent_slaves.remove(&slave_id);
        }
    }

    /// Reads overlapping `[start, end]` answer with an exception
    pub fn fail_range(&self, slave_id: u8, kind: RegisterKind, start: u16, end: u16) {
        self.state.lock().failing_ranges.push(FailingRange {
            slave_id,
            kind,
            start,
            end,
        });
    }

    pub fn clear_failing_ranges(&self) {
        self.state.lock().failing_ranges.clear();
    }

    /// Delay applied to every open and request
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    // ========== Data tables ==========

    pub fn set_register(&self, slave_id: u8, kind: RegisterKind, address: u16, value: u16) {
        self.state
            .lock()
            .registers
            .insert((slave_id, kind, address), value);
    }

    pub fn set_registers(&self, slave_id: u8, kind: RegisterKind, start: u16, values: &[u16]) {
        let mut state = self.state.lock();
        for (offset, value) in values.iter().enumerate() {
            state
                .registers
                .insert((slave_id, kind, start.wrapping_add(offset as u16)), *value);
        }
    }

    pub fn set_bit(&self, slave_id: u8, kind: RegisterKind, address: u16, value: bool) {
        self.state.lock().bits.insert((slave_id, kind, address), value);
    }

    pub fn register(&self, slave_id: u8, kind: RegisterKind, address: u16) -> u16 {
        self.state
            .lock()
            .registers
            .get(&(slave_id, kind, address))
            .copied()
            .unwrap_or(0)
    }

    pub fn bit(&self, slave_id: u8, kind: RegisterKind, address: u16) -> bool {
        self.state
            .lock()
            .bits
            .get(&(slave_id, kind, address))
            .copied()
            .unwrap_or(false)
    }

    // ========== Observation ==========

    pub fn requests(&self) -> Vec<SimulatedRequest> {
        self.state
            .lock()
            .requests
            .iter()
            .map(|(_, r)| r.clone())
            .collect()
    }

    /// Requests issued through handles of one connection
    pub fn requests_for(&self, connection: &str) -> Vec<SimulatedRequest> {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|(c, _)| c == connection)
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub fn clear_requests(&self) {
        self.state.lock().requests.clear();
    }

    pub fn opened(&self) -> usize {
        self.state.lock().opened
    }

    pub fn closed(&self) -> usize {
        self.state.lock().closed
    }

    /// Handles currently open across all connections
    pub fn live_handles(&self) -> usize {
        self.state.lock().live
    }

    pub fn max_live_handles(&self) -> usize {
        self.state.lock().max_live
    }

    pub fn live_handles_for(&self, connection: &str) -> usize {
        self.state
            .lock()
            .live_by_connection
            .get(connection)
            .copied()
            .unwrap_or(0)
    }

    /// Peak number of simultaneously open handles for one connection
    pub fn max_live_handles_for(&self, connection: &str) -> usize {
        self.state
            .lock()
            .max_live_by_connection
            .get(connection)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl TransportFactory for SimulatedBus {
    async fn open(&self, config: &ConnectionConfig) -> TransportResult<Box<dyn ModbusMaster>> {
        let latency = {
            let mut state = self.state.lock();
            if state.refuse_open {
                return Err(TransportError::Connection(format!(
                    "{} refused ({})",
                    config.transport.endpoint(),
                    config.transport.kind()
                )));
            }
            state.opened += 1;
            state.live += 1;
            state.max_live = state.max_live.max(state.live);
            let live = {
                let entry = state
                    .live_by_connection
                    .entry(config.name.clone())
                    .or_insert(0);
                *entry += 1;
                *entry
            };
            let peak = state
                .max_live_by_connection
                .entry(config.name.clone())
                .or_insert(0);
            *peak = (*peak).max(live);
            state.latency
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        debug!(
            "Simulated {} handle opened for {}",
            config.transport.kind(),
            config.name
        );

        Ok(Box::new(SimulatedMaster {
            bus: self.clone(),
            connection: config.name.clone(),
            open: true,
        }))
    }
}

/// Handle onto a [`SimulatedBus`]
#[derive(Debug)]
pub struct SimulatedMaster {
    bus: SimulatedBus,
    connection: String,
    open: bool,
}

impl SimulatedMaster {
    /// Record the request, apply latency and check that the slave answers
    async fn exchange(&self, slave_id: u8, request: SimulatedRequest) -> TransportResult<()> {
        if !self.open {
            return Err(TransportError::Connection("handle closed".to_string()));
        }
        let (latency, silent) = {
            let mut state = self.bus.state.lock();
            state.requests.push((self.connection.clone(), request));
            (state.latency, state.silent_slaves.contains(&slave_id))
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if silent {
            return Err(TransportError::Timeout(format!(
                "slave {} did not respond",
                slave_id
            )));
        }
        Ok(())
    }

    fn check_range(&self, slave_id: u8, kind: RegisterKind, start: u16, count: u16) -> TransportResult<()> {
        let limit = if kind.is_bit() {
            MODBUS_MAX_READ_BITS
        } else {
            MODBUS_MAX_READ_REGISTERS
        };
        if count == 0 || count > limit {
            return Err(TransportError::Protocol(format!(
                "illegal quantity {} for {}",
                count, kind
            )));
        }
        let end = u32::from(start) + u32::from(count) - 1;
        let state = self.bus.state.lock();
        let failing = state.failing_ranges.iter().any(|r| {
            r.slave_id == slave_id
                && r.kind == kind
                && u32::from(r.start) <= end
                && u32::from(start) <= u32::from(r.end)
        });
        if failing {
            return Err(TransportError::Protocol(format!(
                "exception reply for {} {}..={} on slave {}",
                kind, start, end, slave_id
            )));
        }
        Ok(())
    }

    fn release(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        let mut state = self.bus.state.lock();
        state.closed += 1;
        state.live = state.live.saturating_sub(1);
        if let Some(live) = state.live_by_connection.get_mut(&self.connection) {
            *live = live.saturating_sub(1);
        }
    }
}

#[async_trait]
impl ModbusMaster for SimulatedMaster {
    async fn ping(&mut self, slave_id: u8) -> bool {
        self.exchange(slave_id, SimulatedRequest::Ping { slave_id })
            .await
            .is_ok()
    }

    async fn read_bits(
        &mut self,
        slave_id: u8,
        kind: RegisterKind,
        start: u16,
        count: u16,
    ) -> TransportResult<Vec<bool>> {
        if !kind.is_bit() {
            return Err(TransportError::Protocol(format!("{} is not a bit table", kind)));
        }
        self.exchange(
            slave_id,
            SimulatedRequest::ReadBits {
                slave_id,
                kind,
                start,
                count,
            },
        )
        .await?;
        self.check_range(slave_id, kind, start, count)?;

        let state = self.bus.state.lock();
        Ok((0..count)
            .map(|offset| {
                state
                    .bits
                    .get(&(slave_id, kind, start.wrapping_add(offset)))
                    .copied()
                    .unwrap_or(false)
            })
            .collect())
    }

    async fn read_registers(
        &mut self,
        slave_id: u8,
        kind: RegisterKind,
        start: u16,
        count: u16,
    ) -> TransportResult<Vec<u16>> {
        if kind.is_bit() {
            return Err(TransportError::Protocol(format!(
                "{} is not a register table",
                kind
            )));
        }
        self.exchange(
            slave_id,
            SimulatedRequest::ReadRegisters {
                slave_id,
                kind,
                start,
                count,
            },
        )
        .await?;
        self.check_range(slave_id, kind, start, count)?;

        let state = self.bus.state.lock();
        Ok((0..count)
            .map(|offset| {
                state
                    .registers
                    .get(&(slave_id, kind, start.wrapping_add(offset)))
                    .copied()
                    .unwrap_or(0)
            })
            .collect())
    }

    async fn write_registers(
        &mut self,
        slave_id: u8,
        start: u16,
        values: &[u16],
        force_multiple: bool,
    ) -> TransportResult<()> {
        let request = match values {
            [value] if !force_multiple => SimulatedRequest::WriteSingleRegister {
                slave_id,
                address: start,
                value: *value,
            },
            _ => SimulatedRequest::WriteMultipleRegisters {
                slave_id,
                start,
                values: values.to_vec(),
            },
        };
        self.exchange(slave_id, request).await?;

        let mut state = self.bus.state.lock();
        for (offset, value) in values.iter().enumerate() {
            state.registers.insert(
                (
                    slave_id,
                    RegisterKind::HoldingRegister,
                    start.wrapping_add(offset as u16),
                ),
                *value,
            );
        }
        Ok(())
    }

    async fn write_coils(
        &mut self,
        slave_id: u8,
        start: u16,
        values: &[bool],
        force_multiple: bool,
    ) -> TransportResult<()> {
        let request = match values {
            [value] if !force_multiple => SimulatedRequest::WriteSingleCoil {
                slave_id,
                address: start,
                value: *value,
            },
            _ => SimulatedRequest::WriteMultipleCoils {
                slave_id,
                start,
                values: values.to_vec(),
            },
        };
        self.exchange(slave_id, request).await?;

        let mut state = self.bus.state.lock();
        for (offset, value) in values.iter().enumerate() {
            state.bits.insert(
                (slave_id, RegisterKind::Coil, start.wrapping_add(offset as u16)),
                *value,
            );
        }
        Ok(())
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.release();
        Ok(())
    }
}

impl Drop for SimulatedMaster {
    fn drop(&mut self) {
        self.release();
    }
}
