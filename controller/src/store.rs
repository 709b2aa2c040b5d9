use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

use serde::{de::DeserializeOwned, Serialize};

use agronode_common::{ports::SettingsStore, RuntimeConfig, Schedule, Settings, StoreError};

/// JSON files in the data directory: `runtime.json` holds the device layout
/// and settings, `schedule.json` the last synced schedule.
#[derive(Clone)]
pub struct AppStore {
    runtime_path: Arc<PathBuf>,
    schedule_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

impl AppStore {
    pub fn from_env() -> Self {
        let data_dir = std::env::var("AGRONODE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.agronode"));
        Self::in_dir(&data_dir)
    }

    pub fn in_dir(data_dir: &Path) -> Self {
        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            schedule_path: Arc::new(data_dir.join("schedule.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn load_runtime_config(&self) -> Result<RuntimeConfig, StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        read_json(&self.runtime_path)
    }

    pub fn save_runtime_config(&self, runtime: &RuntimeConfig) -> Result<(), StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        write_json(&self.runtime_path, runtime)
    }
}

impl SettingsStore for AppStore {
    fn load(&self) -> Result<Settings, StoreError> {
        Ok(self.load_runtime_config()?.settings)
    }

    fn save(&self, settings: &Settings) -> Result<(), StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut runtime: RuntimeConfig = read_json(&self.runtime_path)?;
        runtime.settings = settings.clone();
        write_json(&self.runtime_path, &runtime)
    }

    fn load_schedule(&self) -> Result<Schedule, StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        read_json(&self.schedule_path)
    }

    fn save_schedule(&self, schedule: &Schedule) -> Result<(), StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        write_json(&self.schedule_path, schedule)
    }
}

fn read_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T, StoreError> {
    match std::fs::read(path) {
        Ok(raw) => Ok(serde_json::from_slice(&raw)?),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(T::default()),
        Err(err) => Err(err.into()),
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let payload = serde_json::to_vec_pretty(value)?;
    // Replaced atomically.
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, payload)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn missing_files_load_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = AppStore::in_dir(dir.path());

        assert_eq!(store.load_runtime_config().unwrap(), RuntimeConfig::default());
        assert_eq!(store.load_schedule().unwrap(), Schedule::default());
    }

    #[test]
    fn saving_settings_keeps_device_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = AppStore::in_dir(dir.path());
        let runtime: RuntimeConfig = serde_json::from_str(
            r#"{"device": {"controllers": [{"kind": "relay_switch", "name": "light", "line": 4}]}}"#,
        )
        .unwrap();
        store.save_runtime_config(&runtime).unwrap();

        let settings = Settings {
            mode: Some("laying".to_string()),
            ..Settings::default()
        };
        store.save(&settings).unwrap();

        let loaded = store.load_runtime_config().unwrap();
        assert_eq!(loaded.device, runtime.device);
        assert_eq!(store.load().unwrap(), settings);
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("schedule.json"), b"{not json").unwrap();
        let store = AppStore::in_dir(dir.path());

        assert!(matches!(store.load_schedule(), Err(StoreError::Json(_))));
    }
}
