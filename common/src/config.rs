use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_EXPIRATION_SECS: u64 = 60;
pub const MIN_EXPIRATION_SECS: u64 = 5;
pub const DEFAULT_DEVICE_NAME: &str = "Energy";

/// What the user types in when adding a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInput {
    pub ip_address: String,
    pub pin: String,
    #[serde(default = "default_device_name")]
    pub device_name: String,
}

fn default_device_name() -> String {
    DEFAULT_DEVICE_NAME.to_string()
}

impl UserInput {
    pub fn sanitize(&mut self) {
        self.ip_address = self.ip_address.trim().to_string();
        self.device_name = self.device_name.trim().to_string();
        if self.device_name.is_empty() {
            self.device_name = default_device_name();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryData {
    pub ip_address: String,
    pub pin: String,
    pub device_name: String,
    pub devid: String,
    pub devtype: String,
}

impl EntryData {
    pub fn from_input(input: UserInput, devid: String, devtype: String) -> Self {
        Self {
            ip_address: input.ip_address,
            pin: input.pin,
            device_name: input.device_name,
            devid,
            devtype,
        }
    }

    pub fn configuration_url(&self) -> String {
        format!("http://{}", self.ip_address)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryOptions {
    #[serde(default)]
    pub expiration_secs: Option<u64>,
}

impl EntryOptions {
    pub fn expiration(&self) -> Duration {
        Duration::from_secs(self.expiration_secs.unwrap_or(DEFAULT_EXPIRATION_SECS))
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        match self.expiration_secs {
            Some(secs) if secs < MIN_EXPIRATION_SECS => {
                Err("expiration must be at least 5 seconds")
            }
            _ => Ok(()),
        }
    }
}

/// A configured device: setup data plus user-editable options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub title: String,
    pub data: EntryData,
    #[serde(default)]
    pub options: EntryOptions,
}

impl ConfigEntry {
    pub fn entry_id(&self) -> &str {
        &self.data.devid
    }
}
