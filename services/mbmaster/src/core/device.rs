//! Device (slave) runtime state and the poll cycle

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use crate::core::batch::{self, ReadLimits, ReadRequest};
use crate::core::config::{DeviceSettings, PointConfig, RegisterKind, TuningParams};
use crate::core::connection::status::{DeviceSnapshot, DeviceStatus, PointSnapshot};
use crate::core::point::{self, PointValue};
use crate::core::transport::{MasterHandle, TransportError};
use crate::error::{MasterError, Result};
use crate::runtime::TaskId;

/// Runtime state of one point
#[derive(Debug, Clone)]
pub struct PointState {
    pub config: PointConfig,
    pub value: Option<PointValue>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl PointState {
    fn new(config: PointConfig) -> Self {
        Self {
            config,
            value: None,
            updated_at: None,
        }
    }

    fn set(&mut self, value: PointValue, now: DateTime<Utc>) -> bool {
        let changed = self.value != Some(value);
        self.value = Some(value);
        self.updated_at = Some(now);
        changed
    }
}

/// Result of one poll cycle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollOutcome {
    /// Read requests planned for the cycle
    pub requests: usize,
    /// Requests that failed (all of them when there was no handle)
    pub failed: usize,
    /// The cycle failed fast because the connection had no live handle
    pub no_handle: bool,
    /// Points whose value changed, in point order
    pub changed: Vec<(String, PointValue)>,
}

impl PollOutcome {
    pub fn succeeded(&self) -> bool {
        !self.no_handle && self.failed == 0
    }

    /// Every planned request failed
    pub fn all_failed(&self) -> bool {
        self.no_handle || (self.requests > 0 && self.failed == self.requests)
    }
}

/// A slave device owned by a connection
#[derive(Debug)]
pub struct Device {
    settings: DeviceSettings,
    points: Vec<PointState>,
    status: DeviceStatus,
    pub(crate) poll_task: Option<TaskId>,
}

impl Device {
    pub fn new(settings: DeviceSettings) -> Self {
        Self {
            settings,
            points: Vec::new(),
            status: DeviceStatus::NotReady,
            poll_task: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn slave_id(&self) -> u8 {
        self.settings.slave_id
    }

    pub fn settings(&self) -> &DeviceSettings {
        &self.settings
    }

    pub fn status(&self) -> DeviceStatus {
        self.status
    }

    pub fn point_configs(&self) -> Vec<PointConfig> {
        self.points.iter().map(|p| p.config.clone()).collect()
    }

    pub fn point(&self, name: &str) -> Option<&PointState> {
        self.points.iter().find(|p| p.config.name == name)
    }

    /// Set the status, returning whether it changed
    pub fn set_status(&mut self, status: DeviceStatus) -> bool {
        let changed = self.status != status;
        self.status = status;
        changed
    }

    /// Replace settings; the caller reschedules polling if the interval changed
    pub fn apply_settings(&mut self, settings: DeviceSettings) {
        self.settings = settings;
    }

    pub fn add_point(&mut self, config: PointConfig) -> Result<()> {
        config.validate()?;
        if self.point(&config.name).is_some() {
            return Err(MasterError::already_exists("point", &config.name));
        }
        self.points.push(PointState::new(config));
        Ok(())
    }

    pub fn remove_point(&mut self, name: &str) -> Result<PointConfig> {
        let idx = self
            .points
            .iter()
            .position(|p| p.config.name == name)
            .ok_or_else(|| MasterError::point_not_found(name))?;
        Ok(self.points.remove(idx).config)
    }

    /// Run one poll cycle
    ///
    /// Without a handle the cycle fails immediately and the transport is not
    /// touched. Points of failed requests are zeroed when
    /// `zero_on_failed_poll` is set and keep their last value otherwise.
    pub async fn poll(
        &mut self,
        handle: Option<&mut MasterHandle>,
        limits: ReadLimits,
    ) -> PollOutcome {
        let configs = self.point_configs();
        let requests = batch::plan(
            &configs,
            limits,
            self.settings.use_batch_polling,
            self.settings.contiguous_batch_only,
        );
        let now = Utc::now();
        let mut outcome = PollOutcome {
            requests: requests.len(),
            ..PollOutcome::default()
        };
        let mut changed = vec![false; self.points.len()];

        match handle {
            None => {
                debug!(device = %self.settings.name, "Poll skipped: no live handle");
                outcome.no_handle = true;
                outcome.failed = requests.len();
                for request in &requests {
                    self.fail_request(request, now, &mut changed);
                }
            },
            Some(handle) => {
                for request in &requests {
                    match self.execute(handle, request, now, &mut changed).await {
                        Ok(()) => {},
                        Err(e) => {
                            debug!(
                                device = %self.settings.name,
                                "Read {} {}..={} failed: {}",
                                request.kind,
                                request.start,
                                request.end(),
                                e
                            );
                            outcome.failed += 1;
                            self.fail_request(request, now, &mut changed);
                        },
                    }
                }
            },
        }

        outcome.changed = self
            .points
            .iter()
            .zip(changed)
            .filter(|(_, c)| *c)
            .filter_map(|(p, _)| p.value.map(|v| (p.config.name.clone(), v)))
            .collect();

        self.status = if outcome.succeeded() {
            DeviceStatus::Ready
        } else {
            DeviceStatus::NotReady
        };
        trace!(
            device = %self.settings.name,
            "Poll cycle: {} requests, {} failed, {} changed",
            outcome.requests,
            outcome.failed,
            outcome.changed.len()
        );
        outcome
    }

    async fn execute(
        &mut self,
        handle: &mut MasterHandle,
        request: &ReadRequest,
        now: DateTime<Utc>,
        changed: &mut [bool],
    ) -> std::result::Result<(), TransportError> {
        let slave_id = self.settings.slave_id;

        if request.kind.is_bit() {
            let bits = handle
                .read_bits(slave_id, request.kind, request.start, request.count)
                .await?;
            for &idx in &request.points {
                let offset = usize::from(self.points[idx].config.address - request.start);
                let bit = bits.get(offset).copied().ok_or_else(|| {
                    TransportError::Protocol(format!("short response: {} bits", bits.len()))
                })?;
                changed[idx] |= self.points[idx].set(PointValue::Bool(bit), now);
            }
        } else {
            let registers = handle
                .read_registers(slave_id, request.kind, request.start, request.count)
                .await?;
            for &idx in &request.points {
                let config = &self.points[idx].config;
                let offset = usize::from(config.address - request.start);
                let width = usize::from(config.width());
                let words = registers.get(offset..offset + width).ok_or_else(|| {
                    TransportError::Protocol(format!(
                        "short response: {} registers",
                        registers.len()
                    ))
                })?;
                let value = point::decode_registers(config.data_type, words)
                    .map_err(|e| TransportError::Protocol(e.to_string()))?;
                changed[idx] |= self.points[idx].set(value, now);
            }
        }
        Ok(())
    }

    fn fail_request(&mut self, request: &ReadRequest, now: DateTime<Utc>, changed: &mut [bool]) {
        if !self.settings.zero_on_failed_poll {
            return;
        }
        for &idx in &request.points {
            let zero = PointValue::zero(self.points[idx].config.data_type);
            changed[idx] |= self.points[idx].set(zero, now);
        }
    }

    /// Write a point immediately, outside the poll cycle
    pub async fn write_point(
        &mut self,
        handle: &mut MasterHandle,
        name: &str,
        value: PointValue,
        tuning: &TuningParams,
    ) -> Result<PointValue> {
        let slave_id = self.settings.slave_id;
        let idx = self
            .points
            .iter()
            .position(|p| p.config.name == name)
            .ok_or_else(|| MasterError::point_not_found(name))?;
        let config = self.points[idx].config.clone();

        let stored = match config.kind {
            RegisterKind::Coil => {
                let bit = value.as_bool().ok_or_else(|| {
                    MasterError::config(format!("Coil '{}' needs a boolean, got {}", name, value))
                })?;
                handle
                    .write_coils(slave_id, config.address, &[bit], tuning.multiple_writes_only)
                    .await?;
                PointValue::Bool(bit)
            },
            RegisterKind::HoldingRegister => {
                let registers = point::encode_registers(config.data_type, &value)?;
                if registers.len() > usize::from(tuning.max_write_register_count) {
                    return Err(MasterError::config(format!(
                        "Point '{}' needs {} registers, max write register count is {}",
                        name,
                        registers.len(),
                        tuning.max_write_register_count
                    )));
                }
                handle
                    .write_registers(
                        slave_id,
                        config.address,
                        &registers,
                        tuning.multiple_writes_only,
                    )
                    .await?;
                point::decode_registers(config.data_type, &registers)?
            },
            kind => {
                return Err(MasterError::config(format!(
                    "Point '{}' is a read-only {}",
                    name, kind
                )))
            },
        };

        self.points[idx].set(stored, Utc::now());
        Ok(stored)
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            name: self.settings.name.clone(),
            slave_id: self.settings.slave_id,
            status: self.status,
            polling_interval_secs: self.settings.polling_interval_secs,
            points: self
                .points
                .iter()
                .map(|p| PointSnapshot {
                    name: p.config.name.clone(),
                    kind: p.config.kind,
                    address: p.config.address,
                    data_type: p.config.data_type,
                    value: p.value,
                    updated_at: p.updated_at,
                })
                .collect(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::core::config::{ConnectionConfig, DataType, TransportConfig};
    use crate::core::transport::{SimulatedBus, SimulatedRequest, TransportFactory};

    fn limits() -> ReadLimits {
        ReadLimits::from(&TuningParams::default())
    }

    fn device(zero_on_failed_poll: bool) -> Device {
        let mut settings = DeviceSettings::new("meter", 3, 5);
        settings.zero_on_failed_poll = zero_on_failed_poll;
        let mut device = Device::new(settings);
        device
            .add_point(PointConfig::new(
                "power",
                RegisterKind::HoldingRegister,
                10,
                DataType::Uint16,
            ))
            .unwrap();
        device
            .add_point(PointConfig::new(
                "breaker",
                RegisterKind::Coil,
                4,
                DataType::Bool,
            ))
            .unwrap();
        device
    }

    async fn open(bus: &SimulatedBus) -> MasterHandle {
        let config = ConnectionConfig::new(
            "plc1",
            TransportConfig::Tcp {
                host: "127.0.0.1".to_string(),
                port: 502,
            },
        );
        bus.open(&config).await.unwrap()
    }

    #[tokio::test]
    async fn test_poll_updates_values_and_status() {
        let bus = SimulatedBus::new();
        bus.set_register(3, RegisterKind::HoldingRegister, 10, 42);
        bus.set_bit(3, RegisterKind::Coil, 4, true);
        let mut handle = open(&bus).await;
        let mut device = device(false);

        let outcome = device.poll(Some(&mut handle), limits()).await;
        assert_eq!(outcome.requests, 2);
        assert!(outcome.succeeded());
        assert_eq!(device.status(), DeviceStatus::Ready);
        assert_eq!(device.point("power").unwrap().value, Some(PointValue::UInt(42)));
        assert_eq!(device.point("breaker").unwrap().value, Some(PointValue::Bool(true)));
        assert_eq!(outcome.changed.len(), 2);

        // Unchanged values are not reported twice
        let outcome = device.poll(Some(&mut handle), limits()).await;
        assert!(outcome.changed.is_empty());
    }

    #[tokio::test]
    async fn test_zero_on_failed_poll() {
        for (zero, expected) in [(true, PointValue::UInt(0)), (false, PointValue::UInt(42))] {
            let bus = SimulatedBus::new();
            bus.set_register(3, RegisterKind::HoldingRegister, 10, 42);
            let mut handle = open(&bus).await;
            let mut device = device(zero);

            device.poll(Some(&mut handle), limits()).await;
            assert_eq!(device.point("power").unwrap().value, Some(PointValue::UInt(42)));

            bus.fail_range(3, RegisterKind::HoldingRegister, 10, 10);
            let outcome = device.poll(Some(&mut handle), limits()).await;
            assert_eq!(outcome.failed, 1);
            assert!(!outcome.all_failed());
            assert_eq!(device.status(), DeviceStatus::NotReady);
            assert_eq!(device.point("power").unwrap().value, Some(expected));
        }
    }

    #[tokio::test]
    async fn test_poll_without_handle_fails_fast() {
        let bus = SimulatedBus::new();
        let mut device = device(true);
        device.set_status(DeviceStatus::Ready);

        let outcome = device.poll(None, limits()).await;
        assert!(outcome.all_failed());
        assert_eq!(device.status(), DeviceStatus::NotReady);
        assert_eq!(device.point("breaker").unwrap().value, Some(PointValue::Bool(false)));
        assert!(bus.requests().is_empty());
    }

    #[tokio::test]
    async fn test_write_point_modes() {
        let bus = SimulatedBus::new();
        let mut handle = open(&bus).await;
        let mut device = device(false);
        device
            .add_point(PointConfig::new(
                "status",
                RegisterKind::InputRegister,
                1,
                DataType::Uint16,
            ))
            .unwrap();

        let mut tuning = TuningParams::default();
        device
            .write_point(&mut handle, "power", PointValue::UInt(7), &tuning)
            .await
            .unwrap();
        tuning.multiple_writes_only = true;
        device
            .write_point(&mut handle, "power", PointValue::UInt(8), &tuning)
            .await
            .unwrap();

        assert_eq!(
            bus.requests(),
            vec![
                SimulatedRequest::WriteSingleRegister {
                    slave_id: 3,
                    address: 10,
                    value: 7
                },
                SimulatedRequest::WriteMultipleRegisters {
                    slave_id: 3,
                    start: 10,
                    values: vec![8]
                },
            ]
        );
        assert_eq!(device.point("power").unwrap().value, Some(PointValue::UInt(8)));

        let read_only = device
            .write_point(&mut handle, "status", PointValue::UInt(1), &tuning)
            .await;
        assert!(matches!(read_only, Err(MasterError::Config(_))));
        let missing = device
            .write_point(&mut handle, "nope", PointValue::UInt(1), &tuning)
            .await;
        assert!(matches!(missing, Err(MasterError::NotFound(_))));
    }

    #[test]
    fn test_point_names_unique() {
        let mut device = device(false);
        let dup = device.add_point(PointConfig::new(
            "power",
            RegisterKind::InputRegister,
            0,
            DataType::Int16,
        ));
        assert!(matches!(dup, Err(MasterError::AlreadyExists(_))));
        assert!(device.remove_point("power").is_ok());
        assert!(device.remove_point("power").is_err());
    }
}
