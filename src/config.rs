use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::transport::mac::MacSettings;
use crate::transport::TransportKind;

const MAC_SETTINGS_FILE: &str = "loramac.json";

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub node_id: String,
    pub transport: TransportKind,
    pub broker_port: u16,
    pub strict_subscriptions: bool,
    pub config_dir: PathBuf,
    pub mac_uplink_interval_ms: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let node_id = env::var("NODE_ID").unwrap_or_else(|_| Uuid::new_v4().to_string());
        let transport = match env::var("TRANSPORT").as_deref() {
            Err(_) | Ok("broker") => TransportKind::Broker,
            Ok("mac") => TransportKind::Mac,
            Ok(other) => bail!("unknown TRANSPORT '{other}', expected 'broker' or 'mac'"),
        };
        let broker_port = get_env_var_u16("BROKER_PORT", 1883);
        let strict_subscriptions = get_env_var_bool("STRICT_SUBSCRIPTIONS", false);
        let config_dir = PathBuf::from(env::var("CONFIG_DIR").unwrap_or_else(|_| ".".to_string()));
        let mac_uplink_interval_ms = get_env_var_u64("MAC_UPLINK_INTERVAL_MS", 1000);

        Ok(Config {
            node_id,
            transport,
            broker_port,
            strict_subscriptions,
            config_dir,
            mac_uplink_interval_ms,
        })
    }

    pub fn mac_settings_path(&self) -> PathBuf {
        mac_settings_path(&self.config_dir)
    }
}

fn mac_settings_path(dir: &Path) -> PathBuf {
    dir.join(MAC_SETTINGS_FILE)
}

impl MacSettings {
    /// Settings saved by an earlier `loramac save`, if any.
    pub fn load_from_dir(dir: &Path) -> Result<Option<Self>> {
        let path = mac_settings_path(dir);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let settings: MacSettings = serde_json::from_str(&contents)?;
        Ok(Some(settings))
    }

    pub fn save_to_dir(&self, dir: &Path) -> Result<PathBuf> {
        let path = mac_settings_path(dir);
        // Ensure the directory exists
        fs::create_dir_all(dir)?;
        let contents = serde_json::to_string_pretty(self)?;
        let mut file = fs::File::create(&path)?;
        file.write_all(contents.as_bytes())?;
        Ok(path)
    }

    /// Returns whether a saved file existed.
    pub fn erase_in_dir(dir: &Path) -> Result<bool> {
        match fs::remove_file(mac_settings_path(dir)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

fn get_env_var_u16(key: &str, default: u16) -> u16 {
    env::var(key)
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(default)
}

fn get_env_var_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(default)
}

fn get_env_var_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .and_then(|val| match val.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::transport::mac::DeviceClass;

    pub(crate) fn scratch_dir() -> PathBuf {
        env::temp_dir().join(format!("weather-node-{}", Uuid::new_v4()))
    }

    #[test]
    fn mac_settings_survive_save_and_load() {
        let dir = scratch_dir();
        assert_eq!(MacSettings::load_from_dir(&dir).unwrap(), None);

        let settings = MacSettings {
            dev_eui: [0xAB; 8],
            class: DeviceClass::C,
            rx2_freq: 868_100_000,
            ..MacSettings::default()
        };
        let path = settings.save_to_dir(&dir).unwrap();
        assert!(path.ends_with(MAC_SETTINGS_FILE));
        assert_eq!(MacSettings::load_from_dir(&dir).unwrap(), Some(settings));

        assert!(MacSettings::erase_in_dir(&dir).unwrap());
        assert!(!MacSettings::erase_in_dir(&dir).unwrap());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn corrupt_settings_file_is_an_error() {
        let dir = scratch_dir();
        fs::create_dir_all(&dir).unwrap();
        fs::write(mac_settings_path(&dir), "{not json").unwrap();
        assert!(MacSettings::load_from_dir(&dir).is_err());
        fs::remove_dir_all(&dir).unwrap();
    }
}
