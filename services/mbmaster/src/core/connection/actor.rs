//! Connection actor
//!
//! One tokio task per connection owns the transport handle, the status, the
//! retry delay and every device. External commands and scheduled jobs arrive
//! on two mailboxes and are handled one at a time, so a reconnection attempt,
//! a poll and an operator action never interleave on the handle.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use super::status::{ConnectionSnapshot, ConnectionStatus, DeviceStatus, GatewayEvent};
use crate::core::batch::ReadLimits;
use crate::core::config::{ConnectionConfig, DeviceSettings, PointConfig};
use crate::core::device::Device;
use crate::core::persistence::{ConnectionRecord, DeviceRecord};
use crate::core::point::PointValue;
use crate::core::transport::{MasterHandle, TransportFactory};
use crate::error::{MasterError, Result};
use crate::runtime::{Delivery, ReconnectPolicy, RetryBackoff, Scheduler, TaskId};

pub(crate) type Reply<T> = oneshot::Sender<Result<T>>;

/// Operator actions routed through the actor
pub(crate) enum Command {
    Snapshot(oneshot::Sender<ConnectionSnapshot>),
    Record(oneshot::Sender<ConnectionRecord>),
    Edit {
        config: ConnectionConfig,
        reply: Reply<()>,
    },
    Stop(Reply<()>),
    Restart(Reply<()>),
    Remove(Reply<()>),
    AddDevice {
        settings: DeviceSettings,
        points: Vec<PointConfig>,
        reply: Reply<()>,
    },
    EditDevice {
        name: String,
        settings: DeviceSettings,
        reply: Reply<()>,
    },
    RemoveDevice {
        name: String,
        reply: Reply<()>,
    },
    AddPoint {
        device: String,
        point: PointConfig,
        reply: Reply<()>,
    },
    RemovePoint {
        device: String,
        point: String,
        reply: Reply<()>,
    },
    WritePoint {
        device: String,
        point: String,
        value: PointValue,
        reply: Reply<PointValue>,
    },
}

/// Work items run by the connection scheduler
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Job {
    Check,
    Reconnect,
    Poll(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckKind {
    /// Initial check, reconnection or manual action: propagates device status
    Full,
    /// Triggered by a fully failed poll while connected
    Recheck,
}

pub(crate) struct ConnectionActor {
    config: ConnectionConfig,
    factory: Arc<dyn TransportFactory>,
    handle: Option<MasterHandle>,
    status: ConnectionStatus,
    backoff: RetryBackoff,
    reconnect_task: Option<TaskId>,
    /// A `Job::Check` is queued and not yet run
    check_queued: bool,
    devices: BTreeMap<String, Device>,
    scheduler: Scheduler<Job>,
    events: broadcast::Sender<GatewayEvent>,
}

impl ConnectionActor {
    pub(crate) fn new(
        config: ConnectionConfig,
        devices: Vec<(DeviceSettings, Vec<PointConfig>)>,
        factory: Arc<dyn TransportFactory>,
        policy: ReconnectPolicy,
        events: broadcast::Sender<GatewayEvent>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Delivery<Job>>)> {
        let (scheduler, deliveries) = Scheduler::new();
        let mut actor = Self {
            config,
            factory,
            handle: None,
            status: ConnectionStatus::SettingUp,
            backoff: RetryBackoff::new(policy),
            reconnect_task: None,
            check_queued: false,
            devices: BTreeMap::new(),
            scheduler,
            events,
        };
        actor.rebuild_devices(devices)?;
        Ok((actor, deliveries))
    }

    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut deliveries: mpsc::UnboundedReceiver<Delivery<Job>>,
    ) {
        info!(
            connection = %self.config.name,
            "Connection started ({} {})",
            self.config.transport.kind(),
            self.config.transport.endpoint()
        );
        if !self.devices.is_empty() {
            self.queue_check();
        }

        loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(Command::Remove(reply)) => {
                        self.stop().await;
                        let _ = self.events.send(GatewayEvent::ConnectionRemoved {
                            connection: self.config.name.clone(),
                        });
                        let _ = reply.send(Ok(()));
                        break;
                    },
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.stop().await;
                        break;
                    },
                },
                Some(delivery) = deliveries.recv() => {
                    if let Some((job, _guard)) = self.scheduler.accept(delivery) {
                        self.run_job(job).await;
                    }
                },
            }
        }
        info!(connection = %self.config.name, "Connection removed");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            },
            Command::Record(reply) => {
                let _ = reply.send(self.record());
            },
            Command::Edit { config, reply } => {
                let _ = reply.send(self.edit(config).await);
            },
            Command::Stop(reply) => {
                self.stop().await;
                let _ = reply.send(Ok(()));
            },
            Command::Restart(reply) => {
                let _ = reply.send(self.restart().await);
            },
            Command::Remove(reply) => {
                // Handled by the run loop
                let _ = reply.send(Err(MasterError::internal("remove routed to handler")));
            },
            Command::AddDevice {
                settings,
                points,
                reply,
            } => {
                let _ = reply.send(self.add_device(settings, points));
            },
            Command::EditDevice {
                name,
                settings,
                reply,
            } => {
                let _ = reply.send(self.edit_device(&name, settings));
            },
            Command::RemoveDevice { name, reply } => {
                let _ = reply.send(self.remove_device(&name));
            },
            Command::AddPoint {
                device,
                point,
                reply,
            } => {
                let result = self
                    .check_points([&point])
                    .and_then(|_| self.device_mut(&device))
                    .and_then(|d| d.add_point(point));
                let _ = reply.send(result);
            },
            Command::RemovePoint {
                device,
                point,
                reply,
            } => {
                let result = self
                    .device_mut(&device)
                    .and_then(|d| d.remove_point(&point))
                    .map(|_| ());
                let _ = reply.send(result);
            },
            Command::WritePoint {
                device,
                point,
                value,
                reply,
            } => {
                let _ = reply.send(self.write_point(&device, &point, value).await);
            },
        }
    }

    async fn run_job(&mut self, job: Job) {
        match job {
            Job::Check => {
                self.check_queued = false;
                self.check(CheckKind::Full).await
            },
            Job::Reconnect => self.reconnect().await,
            Job::Poll(device) => self.poll(&device).await,
        }
    }

    // ========== Connectivity state machine ==========

    /// Ping the representative device, acquiring a handle first if needed
    async fn check(&mut self, kind: CheckKind) {
        let Some(slave_id) = self.devices.values().next().map(Device::slave_id) else {
            debug!(connection = %self.config.name, "No devices, waiting for one");
            self.release_handle().await;
            if let Some(id) = self.reconnect_task.take() {
                self.scheduler.cancel(id);
            }
            self.backoff.reset();
            self.set_status(ConnectionStatus::SettingUp);
            return;
        };

        if self.handle.is_none() {
            match self.factory.open(&self.config).await {
                Ok(handle) => self.handle = Some(handle),
                Err(e) => {
                    warn!(
                        connection = %self.config.name,
                        "Could not open {}: {}",
                        self.config.transport.endpoint(),
                        e
                    );
                    self.on_check_failed(ConnectionStatus::EstablishmentFailed)
                        .await;
                    return;
                },
            }
        }

        let alive = match self.handle.as_mut() {
            Some(handle) => handle.ping(slave_id).await,
            None => false,
        };

        if alive {
            self.on_connected(kind);
        } else {
            debug!(connection = %self.config.name, "Ping of slave {} failed", slave_id);
            self.on_check_failed(ConnectionStatus::PingFailed).await;
        }
    }

    fn on_connected(&mut self, kind: CheckKind) {
        self.backoff.reset();
        if let Some(id) = self.reconnect_task.take() {
            self.scheduler.cancel(id);
        }
        self.set_status(ConnectionStatus::Connected);

        if kind == CheckKind::Full {
            let names: Vec<String> = self.devices.keys().cloned().collect();
            for name in names {
                self.set_device_status(&name, DeviceStatus::Ready);
            }
        }
        self.start_polling();
    }

    async fn on_check_failed(&mut self, status: ConnectionStatus) {
        self.release_handle().await;
        self.set_status(status);

        let names: Vec<String> = self.devices.keys().cloned().collect();
        for name in names {
            self.set_device_status(&name, DeviceStatus::NotReady);
        }

        if let Some(id) = self.reconnect_task.take() {
            self.scheduler.cancel(id);
        }
        let delay = self.backoff.advance();
        self.reconnect_task = Some(self.scheduler.run_after(delay, Job::Reconnect));
        info!(
            connection = %self.config.name,
            "{}, retrying in {}s",
            status,
            delay.as_secs()
        );
    }

    async fn reconnect(&mut self) {
        self.reconnect_task = None;
        if !self.status.awaits_reconnect() {
            debug!(
                connection = %self.config.name,
                "Reconnection attempt superseded ({})",
                self.status
            );
            return;
        }
        self.set_status(ConnectionStatus::Connecting);
        self.release_handle().await;
        self.check(CheckKind::Full).await;
    }

    async fn release_handle(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            if let Err(e) = handle.close().await {
                debug!(connection = %self.config.name, "Error closing handle: {}", e);
            }
        }
    }

    // ========== Polling ==========

    fn start_polling(&mut self) {
        for (name, device) in self.devices.iter_mut() {
            if device.poll_task.is_none() {
                let period = device.settings().polling_interval();
                device.poll_task =
                    Some(self.scheduler.run_every(Duration::ZERO, period, Job::Poll(name.clone())));
            }
        }
    }

    async fn poll(&mut self, name: &str) {
        let limits = ReadLimits::from(&self.config.tuning);
        let Some(device) = self.devices.get_mut(name) else {
            return;
        };
        let before = device.status();
        let outcome = device.poll(self.handle.as_mut(), limits).await;
        let after = device.status();
        let recheck = outcome.all_failed() && !outcome.no_handle;

        for (point, value) in outcome.changed {
            let _ = self.events.send(GatewayEvent::PointValue {
                connection: self.config.name.clone(),
                device: name.to_string(),
                point,
                value,
            });
        }
        if before != after {
            self.emit_device_status(name, after);
        }

        if recheck && self.status == ConnectionStatus::Connected {
            debug!(
                connection = %self.config.name,
                device = %name,
                "Every read failed, re-checking connectivity"
            );
            self.check(CheckKind::Recheck).await;
        }
    }

    // ========== Operator actions ==========

    async fn stop(&mut self) {
        self.scheduler.reset();
        self.reconnect_task = None;
        self.check_queued = false;
        for device in self.devices.values_mut() {
            device.poll_task = None;
        }
        self.release_handle().await;
        self.set_status(ConnectionStatus::Stopped);

        let names: Vec<String> = self.devices.keys().cloned().collect();
        for name in names {
            self.set_device_status(&name, DeviceStatus::NotReady);
        }
    }

    async fn restart(&mut self) -> Result<()> {
        let record = self.record();
        self.stop().await;
        self.rebuild_devices(record.device_configs())?;
        self.backoff.reset();
        self.set_status(ConnectionStatus::SettingUp);
        if !self.devices.is_empty() {
            self.queue_check();
        }
        Ok(())
    }

    async fn edit(&mut self, config: ConnectionConfig) -> Result<()> {
        config.validate()?;
        if config.name != self.config.name {
            return Err(MasterError::internal(format!(
                "edit of '{}' carries name '{}'",
                self.config.name, config.name
            )));
        }
        let limits = ReadLimits::from(&config.tuning);
        for device in self.devices.values() {
            for point in device.point_configs() {
                limits.check_point(&point)?;
            }
        }
        self.config = config;
        self.release_handle().await;
        info!(connection = %self.config.name, "Configuration updated");

        if self.status == ConnectionStatus::Stopped {
            return Ok(());
        }
        if let Some(id) = self.reconnect_task.take() {
            self.scheduler.cancel(id);
        }
        if self.devices.is_empty() {
            self.set_status(ConnectionStatus::SettingUp);
        } else {
            self.set_status(ConnectionStatus::Connecting);
            self.queue_check();
        }
        Ok(())
    }

    fn add_device(&mut self, settings: DeviceSettings, points: Vec<PointConfig>) -> Result<()> {
        settings.validate()?;
        if self.devices.contains_key(&settings.name) {
            return Err(MasterError::already_exists("device", &settings.name));
        }
        self.check_points(&points)?;
        let mut device = Device::new(settings);
        for point in points {
            device.add_point(point)?;
        }
        let name = device.name().to_string();
        info!(
            connection = %self.config.name,
            device = %name,
            "Device added (slave {})",
            device.slave_id()
        );
        self.devices.insert(name, device);

        match self.status {
            ConnectionStatus::Connected => self.start_polling(),
            ConnectionStatus::Stopped => {},
            // A pending reconnection attempt will pick the device up
            _ if self.reconnect_task.is_none() => self.queue_check(),
            _ => {},
        }
        Ok(())
    }

    fn edit_device(&mut self, name: &str, settings: DeviceSettings) -> Result<()> {
        settings.validate()?;
        if settings.name != name && self.devices.contains_key(&settings.name) {
            return Err(MasterError::already_exists("device", &settings.name));
        }
        let mut device = self
            .devices
            .remove(name)
            .ok_or_else(|| MasterError::device_not_found(name))?;

        let was_polling = device.poll_task.take().map(|id| self.scheduler.cancel(id)).is_some();
        device.apply_settings(settings);
        let new_name = device.name().to_string();
        self.devices.insert(new_name.clone(), device);
        info!(connection = %self.config.name, device = %new_name, "Device updated");

        if was_polling {
            self.start_polling();
        }
        Ok(())
    }

    fn remove_device(&mut self, name: &str) -> Result<()> {
        let device = self
            .devices
            .remove(name)
            .ok_or_else(|| MasterError::device_not_found(name))?;
        if let Some(id) = device.poll_task {
            self.scheduler.cancel(id);
        }
        info!(connection = %self.config.name, device = %name, "Device removed");
        Ok(())
    }

    async fn write_point(&mut self, device: &str, point: &str, value: PointValue) -> Result<PointValue> {
        let tuning = self.config.tuning.clone();
        let connection = self.config.name.clone();
        let target = self
            .devices
            .get_mut(device)
            .ok_or_else(|| MasterError::device_not_found(device))?;
        let handle = self
            .handle
            .as_mut()
            .ok_or_else(|| MasterError::not_connected(&connection))?;

        let stored = target.write_point(handle, point, value, &tuning).await?;
        debug!(connection = %connection, device = %device, "Wrote {} = {}", point, stored);
        let _ = self.events.send(GatewayEvent::PointValue {
            connection,
            device: device.to_string(),
            point: point.to_string(),
            value: stored,
        });
        Ok(stored)
    }

    // ========== State helpers ==========

    /// Queue a full check unless one is already waiting
    fn queue_check(&mut self) {
        if !self.check_queued {
            self.check_queued = true;
            self.scheduler.run_now(Job::Check);
        }
    }

    fn rebuild_devices(&mut self, devices: Vec<(DeviceSettings, Vec<PointConfig>)>) -> Result<()> {
        self.devices.clear();
        for (settings, points) in devices {
            settings.validate()?;
            self.check_points(&points)?;
            let mut device = Device::new(settings);
            for point in points {
                device.add_point(point)?;
            }
            self.devices.insert(device.name().to_string(), device);
        }
        Ok(())
    }

    fn check_points<'a>(&self, points: impl IntoIterator<Item = &'a PointConfig>) -> Result<()> {
        let limits = ReadLimits::from(&self.config.tuning);
        points.into_iter().try_for_each(|p| limits.check_point(p))
    }

    fn device_mut(&mut self, name: &str) -> Result<&mut Device> {
        self.devices
            .get_mut(name)
            .ok_or_else(|| MasterError::device_not_found(name))
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if self.status == status {
            return;
        }
        self.status = status;
        info!(connection = %self.config.name, "Status: {}", status);
        let _ = self.events.send(GatewayEvent::ConnectionStatus {
            connection: self.config.name.clone(),
            status,
        });
    }

    fn set_device_status(&mut self, name: &str, status: DeviceStatus) {
        let changed = self
            .devices
            .get_mut(name)
            .is_some_and(|d| d.set_status(status));
        if changed {
            self.emit_device_status(name, status);
        }
    }

    fn emit_device_status(&self, name: &str, status: DeviceStatus) {
        debug!(connection = %self.config.name, device = %name, "Device status: {}", status);
        let _ = self.events.send(GatewayEvent::DeviceStatus {
            connection: self.config.name.clone(),
            device: name.to_string(),
            status,
        });
    }

    fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            name: self.config.name.clone(),
            transport: self.config.transport.kind(),
            status: self.status,
            status_label: self.status.label(),
            retry_delay_secs: self.backoff.current_secs(),
            has_handle: self.handle.is_some(),
            pending_tasks: self.scheduler.pending(),
            devices: self.devices.values().map(Device::snapshot).collect(),
        }
    }

    fn record(&self) -> ConnectionRecord {
        ConnectionRecord {
            name: self.config.name.clone(),
            transport: self.config.transport.clone(),
            tuning: self.config.tuning.clone(),
            devices: self
                .devices
                .values()
                .map(|d| DeviceRecord::from_settings(d.settings(), d.point_configs()))
                .collect(),
        }
    }
}
