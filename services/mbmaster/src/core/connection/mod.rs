//! Connection lifecycle
//!
//! [`Connection`] owns the actor task and is kept by the gateway; the state
//! lives in the actor. [`ConnectionClient`] is a cloneable sender to it. Every
//! operation is a message with a oneshot reply, so operator actions are
//! serialized with the connection's own scheduled work.
//!
//! ```text
//!   SettingUp ──check ok──► Connected ◄──────────────┐
//!       │                      │ ping fails          │ check ok
//!       │ open/ping fails      ▼                     │
//!       └───────────────► PingFailed / EstablishmentFailed
//!                              │ after retry delay   │
//!                              └──► Connecting ──────┘
//!   Connecting ──no devices left──► SettingUp
//!   Stop: any ──► Stopped      Restart: Stopped ──► SettingUp
//! ```

mod actor;
pub mod status;

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::warn;

use actor::{Command, ConnectionActor, Reply};
use status::{ConnectionSnapshot, GatewayEvent};

use crate::core::config::{ConnectionConfig, DeviceSettings, PointConfig};
use crate::core::persistence::ConnectionRecord;
use crate::core::point::PointValue;
use crate::core::transport::TransportFactory;
use crate::error::{MasterError, Result};
use crate::runtime::ReconnectPolicy;

const MAILBOX_CAPACITY: usize = 64;

/// Owner of a running connection actor
#[derive(Debug)]
pub struct Connection {
    client: ConnectionClient,
    task: JoinHandle<()>,
}

/// Cloneable mailbox of a connection actor
///
/// Calls wait for the actor to finish whatever job it is running, so callers
/// should not hold shared locks across them.
#[derive(Debug, Clone)]
pub struct ConnectionClient {
    name: String,
    tx: mpsc::Sender<Command>,
}

impl Connection {
    /// Validate the configuration and start the actor
    ///
    /// The actor begins in `SettingUp`, with a connectivity check queued when
    /// devices were given.
    pub fn spawn(
        config: ConnectionConfig,
        devices: Vec<(DeviceSettings, Vec<PointConfig>)>,
        factory: Arc<dyn TransportFactory>,
        policy: ReconnectPolicy,
        events: broadcast::Sender<GatewayEvent>,
    ) -> Result<Self> {
        config.validate()?;
        let name = config.name.clone();
        let (actor, deliveries) = ConnectionActor::new(config, devices, factory, policy, events)?;
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let task = tokio::spawn(actor.run(rx, deliveries));
        Ok(Self {
            client: ConnectionClient { name, tx },
            task,
        })
    }

    pub fn name(&self) -> &str {
        &self.client.name
    }

    pub fn client(&self) -> ConnectionClient {
        self.client.clone()
    }

    /// Stop, release the handle and wait for the actor to exit
    pub async fn remove(self) -> Result<()> {
        let result = self.client.call_result(Command::Remove).await;
        if let Err(e) = self.task.await {
            warn!(connection = %self.client.name, "Connection task ended abnormally: {}", e);
        }
        result
    }
}

impl ConnectionClient {
    pub fn name(&self) -> &str {
        &self.name
    }

    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| MasterError::connection_closed(&self.name))?;
        reply_rx
            .await
            .map_err(|_| MasterError::connection_closed(&self.name))
    }

    async fn call_result<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        self.call(build).await?
    }

    pub async fn snapshot(&self) -> Result<ConnectionSnapshot> {
        self.call(Command::Snapshot).await
    }

    /// Deep copy of the configuration subtree
    pub async fn record(&self) -> Result<ConnectionRecord> {
        self.call(Command::Record).await
    }

    /// Apply new configuration values under the same name
    pub async fn edit(&self, config: ConnectionConfig) -> Result<()> {
        self.call_result(|reply| Command::Edit { config, reply }).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.call_result(Command::Stop).await
    }

    pub async fn restart(&self) -> Result<()> {
        self.call_result(Command::Restart).await
    }

    pub async fn add_device(&self, settings: DeviceSettings, points: Vec<PointConfig>) -> Result<()> {
        self.call_result(|reply| Command::AddDevice {
            settings,
            points,
            reply,
        })
        .await
    }

    pub async fn edit_device(&self, name: &str, settings: DeviceSettings) -> Result<()> {
        let name = name.to_string();
        self.call_result(|reply| Command::EditDevice {
            name,
            settings,
            reply,
        })
        .await
    }

    pub async fn remove_device(&self, name: &str) -> Result<()> {
        let name = name.to_string();
        self.call_result(|reply| Command::RemoveDevice { name, reply })
            .await
    }

    pub async fn add_point(&self, device: &str, point: PointConfig) -> Result<()> {
        let device = device.to_string();
        self.call_result(|reply| Command::AddPoint {
            device,
            point,
            reply,
        })
        .await
    }

    pub async fn remove_point(&self, device: &str, point: &str) -> Result<()> {
        let device = device.to_string();
        let point = point.to_string();
        self.call_result(|reply| Command::RemovePoint {
            device,
            point,
            reply,
        })
        .await
    }

    /// Write a point immediately; returns the value as stored
    pub async fn write_point(&self, device: &str, point: &str, value: PointValue) -> Result<PointValue> {
        let device = device.to_string();
        let point = point.to_string();
        self.call_result(|reply| Command::WritePoint {
            device,
            point,
            value,
            reply,
        })
        .await
    }
}
