//! Persisted connection tree
//!
//! One record per connection holding its configuration, with nested device
//! and point records. Older files may lack attributes added later; those
//! take their defaults on load. Device records without a slave id or a
//! polling interval cannot be restored and are dropped with a warning.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::config::{ConnectionConfig, DeviceSettings, PointConfig, TransportConfig, TuningParams};
use crate::error::{MasterError, Result};

/// Whole persisted tree
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDocument {
    #[serde(default)]
    pub connections: Vec<ConnectionRecord>,
}

impl StateDocument {
    /// Check every record the way Add Connection / Add Device would
    pub fn validate(&self) -> Result<()> {
        let mut names = std::collections::BTreeSet::new();
        for record in &self.connections {
            if !names.insert(record.name.as_str()) {
                return Err(MasterError::already_exists("connection", &record.name));
            }
            record.config().validate()?;
            let mut devices = std::collections::BTreeSet::new();
            for (settings, points) in record.device_configs() {
                settings.validate()?;
                if !devices.insert(settings.name.clone()) {
                    return Err(MasterError::already_exists("device", &settings.name));
                }
                let mut point_names = std::collections::BTreeSet::new();
                for point in &points {
                    point.validate()?;
                    if !point_names.insert(point.name.as_str()) {
                        return Err(MasterError::already_exists("point", &point.name));
                    }
                }
            }
        }
        Ok(())
    }
}

/// One connection with its devices and points
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub name: String,
    pub transport: TransportConfig,
    #[serde(default)]
    pub tuning: TuningParams,
    #[serde(default)]
    pub devices: Vec<DeviceRecord>,
}

impl ConnectionRecord {
    pub fn config(&self) -> ConnectionConfig {
        ConnectionConfig {
            name: self.name.clone(),
            transport: self.transport.clone(),
            tuning: self.tuning.clone(),
        }
    }

    /// Restorable devices; incomplete records are skipped
    pub fn device_configs(&self) -> Vec<(DeviceSettings, Vec<PointConfig>)> {
        self.devices
            .iter()
            .filter_map(|d| match d.settings() {
                Some(settings) => Some((settings, d.points.clone())),
                None => {
                    warn!(
                        connection = %self.name,
                        device = %d.name,
                        "Dropping device record without slave id or polling interval"
                    );
                    None
                },
            })
            .collect()
    }
}

/// Device record; attributes absent in older files take defaults
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub name: String,
    #[serde(default)]
    pub slave_id: Option<u8>,
    #[serde(default)]
    pub polling_interval_secs: Option<u64>,
    #[serde(default)]
    pub zero_on_failed_poll: bool,
    #[serde(default = "default_true")]
    pub use_batch_polling: bool,
    #[serde(default = "default_true")]
    pub contiguous_batch_only: bool,
    #[serde(default)]
    pub points: Vec<PointConfig>,
}

fn default_true() -> bool {
    true
}

impl DeviceRecord {
    pub fn from_settings(settings: &DeviceSettings, points: Vec<PointConfig>) -> Self {
        Self {
            name: settings.name.clone(),
            slave_id: Some(settings.slave_id),
            polling_interval_secs: Some(settings.polling_interval_secs),
            zero_on_failed_poll: settings.zero_on_failed_poll,
            use_batch_polling: settings.use_batch_polling,
            contiguous_batch_only: settings.contiguous_batch_only,
            points,
        }
    }

    pub fn settings(&self) -> Option<DeviceSettings> {
        Some(DeviceSettings {
            name: self.name.clone(),
            slave_id: self.slave_id?,
            polling_interval_secs: self.polling_interval_secs?,
            zero_on_failed_poll: self.zero_on_failed_poll,
            use_batch_polling: self.use_batch_polling,
            contiguous_batch_only: self.contiguous_batch_only,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Yaml,
    Json,
}

/// File-backed store for the connection tree
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn format(&self) -> Result<Format> {
        match self.path.extension().and_then(|e| e.to_str()) {
            Some("yaml" | "yml") => Ok(Format::Yaml),
            Some("json") => Ok(Format::Json),
            _ => Err(MasterError::config(format!(
                "Unsupported state file format: {}",
                self.path.display()
            ))),
        }
    }

    /// Load the tree; a missing file is an empty tree
    pub fn load(&self) -> Result<StateDocument> {
        let format = self.format()?;
        if !self.path.exists() {
            info!("State file {} not found, starting empty", self.path.display());
            return Ok(StateDocument::default());
        }
        let content = fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(StateDocument::default());
        }
        let document: StateDocument = match format {
            Format::Yaml => serde_yaml::from_str(&content)?,
            Format::Json => serde_json::from_str(&content)?,
        };
        debug!(
            "Loaded {} connections from {}",
            document.connections.len(),
            self.path.display()
        );
        Ok(document)
    }

    /// Write the tree atomically (temp file in the same directory, then rename)
    pub fn save(&self, document: &StateDocument) -> Result<()> {
        let content = match self.format()? {
            Format::Yaml => serde_yaml::to_string(document)?,
            Format::Json => serde_json::to_string_pretty(document)?,
        };

        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;

        let file_name = self
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| MasterError::persistence("state path has no file name"))?;
        let tmp_path = dir.join(format!(".{}.tmp", file_name));
        {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(content.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        info!(
            "Saved {} connections to {}",
            document.connections.len(),
            self.path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::core::config::{DataType, RegisterKind};

    const OLD_RECORD: &str = r#"
connections:
  - name: plc1
    transport:
      kind: tcp
      host: 10.0.0.7
    devices:
      - name: meter
        slave_id: 4
        polling_interval_secs: 10
        points:
          - name: voltage
            kind: input_register
            address: 0
            data_type: float32
      - name: half-configured
        slave_id: 5
"#;

    #[test]
    fn test_missing_attributes_take_defaults() {
        let document: StateDocument = serde_yaml::from_str(OLD_RECORD).unwrap();
        let record = &document.connections[0];
        assert_eq!(record.tuning, TuningParams::default());

        let devices = record.device_configs();
        assert_eq!(devices.len(), 1);
        let (settings, points) = &devices[0];
        assert_eq!(settings.slave_id, 4);
        assert!(!settings.zero_on_failed_poll);
        assert!(settings.use_batch_polling);
        assert!(settings.contiguous_batch_only);
        assert_eq!(points[0].data_type, DataType::Float32);
    }

    #[test]
    fn test_save_and_load_both_formats() {
        let dir = tempfile::tempdir().unwrap();
        let mut document: StateDocument = serde_yaml::from_str(OLD_RECORD).unwrap();
        document.connections[0].devices[0]
            .points
            .push(PointConfig::new("trip", RegisterKind::Coil, 3, DataType::Bool));

        for file in ["tree.yaml", "nested/tree.json"] {
            let store = StateStore::new(dir.path().join(file));
            store.save(&document).unwrap();
            assert_eq!(store.load().unwrap(), document);
        }
    }

    #[test]
    fn test_missing_file_is_empty_and_unknown_extension_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("absent.yaml"));
        assert!(store.load().unwrap().connections.is_empty());

        let store = StateStore::new(dir.path().join("tree.ini"));
        assert!(matches!(store.load(), Err(MasterError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_duplicates_and_bad_points() {
        let mut document: StateDocument = serde_yaml::from_str(OLD_RECORD).unwrap();
        document.validate().unwrap();

        let copy = document.connections[0].clone();
        document.connections.push(copy);
        assert!(matches!(document.validate(), Err(MasterError::AlreadyExists(_))));

        document.connections.pop();
        document.connections[0].devices[0]
            .points
            .push(PointConfig::new("bad", RegisterKind::Coil, 0, DataType::Float32));
        assert!(matches!(document.validate(), Err(MasterError::Config(_))));
    }
}
