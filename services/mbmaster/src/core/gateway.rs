//! Connection registry
//!
//! The gateway owns every [`Connection`] by name and exposes the tree
//! operations used by the configuration surface. The registry lock only
//! guards the name map: calls into a connection actor are made on a cloned
//! client after the lock is released. Status and value changes are published
//! on a broadcast channel shared by all connections.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tracing::{error, info, warn};

use crate::core::config::{ConnectionConfig, DeviceSettings, PointConfig};
use crate::core::connection::status::{ConnectionSnapshot, GatewayEvent};
use crate::core::connection::{Connection, ConnectionClient};
use crate::core::persistence::{ConnectionRecord, StateDocument};
use crate::core::point::PointValue;
use crate::core::transport::TransportFactory;
use crate::error::{MasterError, Result};
use crate::runtime::ReconnectPolicy;

const EVENT_CAPACITY: usize = 1024;

pub struct Gateway {
    connections: Mutex<BTreeMap<String, Connection>>,
    factory: Arc<dyn TransportFactory>,
    policy: ReconnectPolicy,
    events: broadcast::Sender<GatewayEvent>,
}

impl Gateway {
    pub fn new(factory: Arc<dyn TransportFactory>, policy: ReconnectPolicy) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            connections: Mutex::new(BTreeMap::new()),
            factory,
            policy,
            events,
        }
    }

    /// Receive status and value updates from every connection
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }

    fn spawn(
        &self,
        config: ConnectionConfig,
        devices: Vec<(DeviceSettings, Vec<PointConfig>)>,
    ) -> Result<Connection> {
        Connection::spawn(
            config,
            devices,
            Arc::clone(&self.factory),
            self.policy,
            self.events.clone(),
        )
    }

    /// Add Connection; starts in `SettingUp` until a device is added
    pub async fn add_connection(&self, config: ConnectionConfig) -> Result<()> {
        let mut connections = self.connections.lock().await;
        if connections.contains_key(&config.name) {
            return Err(MasterError::already_exists("connection", &config.name));
        }
        let name = config.name.clone();
        let connection = self.spawn(config, Vec::new())?;
        connections.insert(name.clone(), connection);
        info!(connection = %name, "Connection added");
        Ok(())
    }

    /// Edit Connection
    ///
    /// A changed name moves the whole subtree to a new connection: the old
    /// connection is detached from the registry, its record captured, the old
    /// actor removed, and the copy spawned under the new name with the edited
    /// values. The old name reads as not found while the move is in flight.
    pub async fn edit_connection(&self, name: &str, config: ConnectionConfig) -> Result<()> {
        config.validate()?;
        if config.name == name {
            return self.client(name).await?.edit(config).await;
        }

        let connection = {
            let mut connections = self.connections.lock().await;
            if connections.contains_key(&config.name) {
                return Err(MasterError::already_exists("connection", &config.name));
            }
            connections
                .remove(name)
                .ok_or_else(|| MasterError::connection_not_found(name))?
        };

        let record = match connection.client().record().await {
            Ok(record) => record,
            Err(e) => {
                self.connections
                    .lock()
                    .await
                    .insert(name.to_string(), connection);
                return Err(e);
            },
        };
        if let Err(e) = connection.remove().await {
            warn!(connection = %name, "Removing renamed connection: {}", e);
        }
        let new_name = config.name.clone();
        let renamed = self.spawn(config, record.device_configs())?;

        let mut connections = self.connections.lock().await;
        if connections.contains_key(&new_name) {
            // Taken while the move was in flight; put the old subtree back
            match self.spawn_record(&record) {
                Ok(old) => {
                    connections.entry(record.name.clone()).or_insert(old);
                },
                Err(e) => error!(connection = %name, "Restoring after failed rename: {}", e),
            }
            drop(connections);
            if let Err(e) = renamed.remove().await {
                warn!(connection = %new_name, "Discarding renamed copy: {}", e);
            }
            return Err(MasterError::already_exists("connection", &new_name));
        }
        connections.insert(new_name.clone(), renamed);
        info!(connection = %new_name, "Connection renamed from {}", name);
        Ok(())
    }

    pub async fn stop_connection(&self, name: &str) -> Result<()> {
        self.client(name).await?.stop().await
    }

    pub async fn restart_connection(&self, name: &str) -> Result<()> {
        self.client(name).await?.restart().await
    }

    /// Remove Connection: stop, release the handle and forget the subtree
    pub async fn remove_connection(&self, name: &str) -> Result<()> {
        let connection = self
            .connections
            .lock()
            .await
            .remove(name)
            .ok_or_else(|| MasterError::connection_not_found(name))?;
        connection.remove().await?;
        info!(connection = %name, "Connection removed");
        Ok(())
    }

    pub async fn add_device(
        &self,
        connection: &str,
        settings: DeviceSettings,
        points: Vec<PointConfig>,
    ) -> Result<()> {
        self.client(connection)
            .await?
            .add_device(settings, points)
            .await
    }

    pub async fn edit_device(&self, connection: &str, device: &str, settings: DeviceSettings) -> Result<()> {
        self.client(connection)
            .await?
            .edit_device(device, settings)
            .await
    }

    pub async fn remove_device(&self, connection: &str, device: &str) -> Result<()> {
        self.client(connection)
            .await?
            .remove_device(device)
            .await
    }

    pub async fn add_point(&self, connection: &str, device: &str, point: PointConfig) -> Result<()> {
        self.client(connection)
            .await?
            .add_point(device, point)
            .await
    }

    pub async fn remove_point(&self, connection: &str, device: &str, point: &str) -> Result<()> {
        self.client(connection)
            .await?
            .remove_point(device, point)
            .await
    }

    pub async fn write_point(
        &self,
        connection: &str,
        device: &str,
        point: &str,
        value: PointValue,
    ) -> Result<PointValue> {
        self.client(connection)
            .await?
            .write_point(device, point, value)
            .await
    }

    pub async fn snapshot(&self, name: &str) -> Result<ConnectionSnapshot> {
        self.client(name).await?.snapshot().await
    }

    /// Snapshots of all connections, ordered by name
    pub async fn snapshots(&self) -> Vec<ConnectionSnapshot> {
        let clients = self.clients().await;
        let mut snapshots = Vec::with_capacity(clients.len());
        for client in clients {
            match client.snapshot().await {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => warn!(connection = %client.name(), "Snapshot failed: {}", e),
            }
        }
        snapshots
    }

    pub async fn connection_names(&self) -> Vec<String> {
        self.connections.lock().await.keys().cloned().collect()
    }

    /// Persistable copy of the whole tree
    pub async fn records(&self) -> Result<StateDocument> {
        let clients = self.clients().await;
        let mut records = Vec::with_capacity(clients.len());
        for client in clients {
            records.push(client.record().await?);
        }
        Ok(StateDocument {
            connections: records,
        })
    }

    /// Instantiate every persisted connection; returns how many started
    ///
    /// Records that fail validation or collide with an existing name are
    /// logged and skipped so one bad entry does not block the rest.
    pub async fn restore(&self, document: StateDocument) -> usize {
        let mut connections = self.connections.lock().await;
        let mut restored = 0;
        for record in document.connections {
            if connections.contains_key(&record.name) {
                warn!(connection = %record.name, "Skipping duplicate connection record");
                continue;
            }
            match self.spawn_record(&record) {
                Ok(connection) => {
                    connections.insert(record.name.clone(), connection);
                    restored += 1;
                },
                Err(e) => error!(connection = %record.name, "Restore failed: {}", e),
            }
        }
        info!("Restored {} connections", restored);
        restored
    }

    fn spawn_record(&self, record: &ConnectionRecord) -> Result<Connection> {
        self.spawn(record.config(), record.device_configs())
    }

    /// Stop and remove every connection
    pub async fn shutdown(&self) {
        let drained: Vec<Connection> = {
            let mut connections = self.connections.lock().await;
            std::mem::take(&mut *connections).into_values().collect()
        };
        let count = drained.len();
        let results = futures::future::join_all(drained.into_iter().map(|c| {
            let name = c.name().to_string();
            async move { (name, c.remove().await) }
        }))
        .await;
        for (name, result) in results {
            if let Err(e) = result {
                warn!(connection = %name, "Shutdown: {}", e);
            }
        }
        info!("Gateway stopped ({} connections)", count);
    }

    async fn client(&self, name: &str) -> Result<ConnectionClient> {
        self.connections
            .lock()
            .await
            .get(name)
            .map(Connection::client)
            .ok_or_else(|| MasterError::connection_not_found(name))
    }

    async fn clients(&self) -> Vec<ConnectionClient> {
        self.connections
            .lock()
            .await
            .values()
            .map(Connection::client)
            .collect()
    }
}
