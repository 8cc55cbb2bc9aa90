use std::{collections::HashMap, time::Duration};

use reqwest::{blocking::Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use smart_maic_common::PREFIX;

pub const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("device request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("device answered with HTTP {0}")]
    Status(u16),
    #[error("device sent malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl GatewayError {
    /// Network, timeout and HTTP status failures. Everything else is a
    /// device answer we could not make sense of.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Status(_))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AboutField {
    #[serde(default)]
    pub value: Value,
}

/// The subset of `page=webinit` the bridge relies on.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub serv: Option<String>,
    #[serde(default)]
    pub port: Value,
    #[serde(default)]
    pub uname: Option<String>,
    #[serde(default, rename = "pass")]
    pub password: Option<String>,
    #[serde(default)]
    pub about: HashMap<String, AboutField>,
}

impl DeviceConfig {
    /// The device only relays to MQTT once a broker address is set.
    pub fn mqtt_configured(&self) -> bool {
        self.serv
            .as_deref()
            .is_some_and(|serv| !serv.trim().is_empty())
    }

    pub fn about_value(&self, name: &str) -> Option<String> {
        self.about
            .get(name)
            .map(|field| query_value(&field.value))
            .filter(|value| !value.is_empty())
    }
}

/// Blocking access to the device's HTTP API. Callers on the async runtime
/// go through [`crate::coordinator::Coordinator`], which moves calls onto
/// the blocking pool.
pub trait DeviceApi: Send + Sync + 'static {
    fn read_config(&self) -> Result<DeviceConfig, GatewayError>;
    fn read_wdata(&self) -> Result<Value, GatewayError>;
    /// Points the device's MQTT relay at its configured broker and returns
    /// the config as re-read afterwards.
    fn enable_mqtt_relay(&self) -> Result<DeviceConfig, GatewayError>;
    fn write_consumption(&self, key: &str, value: f64) -> Result<(), GatewayError>;
    fn write_dry_switch(&self, value: u8) -> Result<(), GatewayError>;
}

#[derive(Debug, Clone)]
pub struct HttpGateway {
    ip_address: String,
    pin: String,
    devid: String,
}

impl HttpGateway {
    pub fn new(
        ip_address: impl Into<String>,
        pin: impl Into<String>,
        devid: impl Into<String>,
    ) -> Self {
        Self {
            ip_address: ip_address.into(),
            pin: pin.into(),
            devid: devid.into(),
        }
    }

    fn login(&self) -> Result<(), GatewayError> {
        self.get(&[
            ("page", "devlogin".to_string()),
            ("devpass", self.pin.clone()),
        ])?;
        Ok(())
    }

    fn get(&self, params: &[(&str, String)]) -> Result<String, GatewayError> {
        let url = format!("http://{}/", self.ip_address);
        let page = params
            .iter()
            .find(|(name, _)| *name == "page")
            .map(|(_, page)| page.as_str())
            .unwrap_or_default();
        debug!(%url, page, "smart maic request");

        // A client per call keeps the gateway free of runtime-bound state.
        let client = Client::builder().timeout(HTTP_TIMEOUT).build()?;
        let response = client.get(&url).query(params).send()?;
        let status = response.status();
        let body = response.text()?;
        debug!(status = status.as_u16(), %body, "smart maic response");

        accept_response(status, body)
    }

    fn get_json<T: for<'de> Deserialize<'de>>(&self, page: &str) -> Result<T, GatewayError> {
        let body = self.get(&[("page", page.to_string())])?;
        Ok(serde_json::from_str(&body)?)
    }
}

/// HTTP 400 is what the firmware answers to several valid requests, so its
/// body is passed through like a success.
pub fn accept_response(status: StatusCode, body: String) -> Result<String, GatewayError> {
    if status.is_success() || status == StatusCode::BAD_REQUEST {
        return Ok(body);
    }
    if status.is_client_error() || status.is_server_error() {
        return Err(GatewayError::Status(status.as_u16()));
    }
    Ok(body)
}

impl DeviceApi for HttpGateway {
    fn read_config(&self) -> Result<DeviceConfig, GatewayError> {
        self.login()?;
        self.get_json("webinit")
    }

    fn read_wdata(&self) -> Result<Value, GatewayError> {
        self.login()?;
        self.get_json("getwdata")
    }

    fn enable_mqtt_relay(&self) -> Result<DeviceConfig, GatewayError> {
        let config = self.read_config()?;

        self.get(&[
            ("page", "mqtt".to_string()),
            ("serv", config.serv.clone().unwrap_or_default()),
            ("port", query_value(&config.port)),
            ("uname", config.uname.clone().unwrap_or_default()),
            ("pass", config.password.clone().unwrap_or_default()),
            ("mqtt_on", "1".to_string()),
            ("mqttint", "60".to_string()),
            ("separat", "2".to_string()),
            ("prefix", format!("{PREFIX}/")),
        ])?;

        self.read_config()
    }

    fn write_consumption(&self, key: &str, value: f64) -> Result<(), GatewayError> {
        self.login()?;
        self.get(&[("page", "initval".to_string()), (key, value.to_string())])?;
        Ok(())
    }

    fn write_dry_switch(&self, value: u8) -> Result<(), GatewayError> {
        self.get(&[
            ("page", "getdata".to_string()),
            ("devid", self.devid.clone()),
            ("devpass", self.pin.clone()),
            ("pout", value.to_string()),
        ])?;
        Ok(())
    }
}

fn query_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
