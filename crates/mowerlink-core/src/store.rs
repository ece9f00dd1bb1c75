use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::stream::StreamCredentials;
use crate::transport::TransportKind;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state io: {0}")]
    Io(#[from] io::Error),
    #[error("state encoding: {0}")]
    Json(#[from] serde_json::Error),
}

/// Per-device state kept across runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub device_id: String,
    pub preference: TransportKind,
    #[serde(default)]
    pub last_credentials: Option<StreamCredentials>,
}

pub trait StateStore: Send + Sync {
    fn load(&self, device_id: &str) -> Result<Option<DeviceRecord>, StoreError>;
    /// Replaces the whole record.
    fn save(&self, record: &DeviceRecord) -> Result<(), StoreError>;
}

/// One JSON file per device under a state directory.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, device_id: &str) -> PathBuf {
        let safe: String = device_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }
}

impl StateStore for JsonFileStore {
    fn load(&self, device_id: &str) -> Result<Option<DeviceRecord>, StoreError> {
        let path = self.path_for(device_id);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(serde_json::from_slice(&raw)?))
    }

    fn save(&self, record: &DeviceRecord) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(&record.device_id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(record)?)?;
        fs::rename(&tmp, &path)?;
        debug!(path=%path.display(), "device state saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::env;
    use std::time::SystemTime;

    fn temp_store(name: &str) -> JsonFileStore {
        let uniq = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .expect("unix epoch")
            .as_nanos();
        JsonFileStore::new(env::temp_dir().join(format!("mowerlink-store-{name}-{uniq}")))
    }

    #[test]
    fn missing_record_loads_as_none() {
        let store = temp_store("missing");

        assert!(store.load("Luba-VS0001").expect("load").is_none());
    }

    #[test]
    fn save_replaces_whole_record() {
        // Arrange
        let store = temp_store("replace");
        let mut record = DeviceRecord {
            device_id: "Luba/VS 0001".into(),
            preference: TransportKind::Ble,
            last_credentials: Some(StreamCredentials {
                app_id: "app".into(),
                channel_name: "chan".into(),
                token: "tok".into(),
                uid: 9,
                expires_at: Utc::now(),
            }),
        };
        store.save(&record).expect("first save");

        // Act
        record.preference = TransportKind::Mqtt;
        record.last_credentials = None;
        store.save(&record).expect("second save");
        let loaded = store.load("Luba/VS 0001").expect("load");

        // Assert
        assert_eq!(loaded, Some(record));
        assert!(store.dir().join("Luba_VS_0001.json").exists());

        let _ = fs::remove_dir_all(store.dir());
    }
}
