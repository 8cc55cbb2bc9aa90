use std::{sync::Arc, time::Duration};

use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};

use smart_maic_common::{
    config::DEFAULT_EXPIRATION_SECS, ConfigEntry, EntryData, EntryOptions, UserInput,
};

use crate::{
    coordinator::{CommandError, Coordinator},
    gateway::DeviceApi,
};

pub const DEVICE_ID: &str = "devid";
pub const DEVICE_TYPE: &str = "devtype";

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("cannot connect to device")]
    CannotConnect(#[source] CommandError),
    #[error("flow aborted: {0}")]
    Abort(&'static str),
    #[error("unexpected error: {0}")]
    Unknown(String),
}

impl FlowError {
    /// Reason code shown next to the form.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::CannotConnect(_) => "cannot_connect",
            Self::Abort(reason) => *reason,
            Self::Unknown(_) => "unknown",
        }
    }
}

impl From<CommandError> for FlowError {
    fn from(err: CommandError) -> Self {
        if err.is_connectivity() {
            Self::CannotConnect(err)
        } else {
            Self::Unknown(err.to_string())
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowResult {
    CreateEntry { entry: ConfigEntry },
    ShowForm { errors: FormErrors, suggested: UserInput },
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct FormErrors {
    pub base: &'static str,
}

/// Checks the device is reachable and relaying to MQTT, switches the relay
/// to our topic prefix, and reads the device identity.
pub async fn validate_input(
    api: Arc<dyn DeviceApi>,
    mqtt_connected: bool,
    input: &UserInput,
) -> Result<ConfigEntry, FlowError> {
    if !mqtt_connected {
        return Err(FlowError::Abort("mqtt_unavailable"));
    }

    let coordinator = Coordinator::new(api, Duration::from_secs(DEFAULT_EXPIRATION_SECS));
    let config = coordinator.get_config().await?;
    if !config.mqtt_configured() {
        return Err(FlowError::Abort("mqtt_unconfigured"));
    }

    let config = coordinator.set_mqtt_config().await?;
    let devid = config
        .about_value(DEVICE_ID)
        .ok_or_else(|| FlowError::Unknown("device did not report its id".to_string()))?;
    let devtype = config
        .about_value(DEVICE_TYPE)
        .ok_or_else(|| FlowError::Unknown("device did not report its type".to_string()))?;

    Ok(ConfigEntry {
        title: input.device_name.clone(),
        data: EntryData::from_input(input.clone(), devid, devtype),
        options: EntryOptions::default(),
    })
}

/// The user step: validate, reject duplicates, or send the form back with
/// a reason code.
pub async fn step_user(
    api: Arc<dyn DeviceApi>,
    mqtt_connected: bool,
    mut input: UserInput,
    existing: &[ConfigEntry],
) -> FlowResult {
    input.sanitize();

    let result = validate_input(api, mqtt_connected, &input)
        .await
        .and_then(|entry| {
            if existing
                .iter()
                .any(|other| other.entry_id() == entry.entry_id())
            {
                return Err(FlowError::Abort("already_configured"));
            }
            Ok(entry)
        });

    match result {
        Ok(entry) => {
            info!(devid = entry.entry_id(), "created config entry");
            FlowResult::CreateEntry { entry }
        }
        Err(err) => {
            if let FlowError::Unknown(message) = &err {
                error!("unexpected exception {message}");
            }
            FlowResult::ShowForm {
                errors: FormErrors { base: err.reason() },
                suggested: input,
            }
        }
    }
}

/// The options step.
pub fn step_options(options: EntryOptions) -> Result<EntryOptions, &'static str> {
    options.validate()?;
    Ok(options)
}
