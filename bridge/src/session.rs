use std::{sync::Arc, time::Duration};

use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle, time::timeout};
use tracing::{debug, info, warn};

use smart_maic_common::{
    build_entities, device_topics, ConfigEntry, Descriptions, Entity, EntityKind, EntryOptions,
    Snapshot,
};

use crate::{
    coordinator::{CommandError, Coordinator},
    gateway::DeviceApi,
    mqtt::MqttHub,
};

pub const FIRST_PAYLOAD_TIMEOUT: Duration = Duration::from_secs(90);
const MQTT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("setup not ready: {0}")]
    NotReady(String),
    #[error("mqtt subscribe failed: {0}")]
    Subscribe(#[from] rumqttc::ClientError),
}

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("no {platform} entity for key {key:?}")]
    UnknownEntity { platform: &'static str, key: String },
    #[error("value {0} is outside the allowed range")]
    OutOfRange(f64),
    #[error(transparent)]
    Command(#[from] CommandError),
}

/// Everything that belongs to one loaded config entry. Dropped on unload.
pub struct Session {
    entry: ConfigEntry,
    coordinator: Coordinator,
    entities: Vec<Entity>,
    topics: Vec<String>,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    /// Subscribes to the device topics, waits for the first payload and
    /// instantiates entities for the keys it carries.
    pub async fn setup(
        entry: ConfigEntry,
        api: Arc<dyn DeviceApi>,
        mqtt: &MqttHub,
        descriptions: &Descriptions,
        first_payload_timeout: Duration,
    ) -> Result<Self, SetupError> {
        if !mqtt.wait_connected(MQTT_CONNECT_TIMEOUT).await {
            return Err(SetupError::NotReady("MQTT is not available".to_string()));
        }

        let coordinator = Coordinator::new(api, entry.options.expiration());
        let mut updates = coordinator.subscribe();

        let topics = device_topics(entry.entry_id()).to_vec();
        let queue = mqtt.subscribe(&topics).await?;
        let update_task = spawn_update_task(coordinator.clone(), queue);

        if !matches!(timeout(first_payload_timeout, updates.changed()).await, Ok(Ok(()))) {
            update_task.abort();
            mqtt.unsubscribe(&topics).await;
            return Err(SetupError::NotReady(format!(
                "Timeout waiting for MQTT topic {}",
                topics[0]
            )));
        }
        debug!(devid = entry.entry_id(), "first device payload received");

        let snapshot = coordinator.data().await;
        let entities = build_entities(descriptions, &entry.data, &snapshot);
        info!(
            devid = entry.entry_id(),
            entities = entities.len(),
            "device set up"
        );

        let poll_task = spawn_poll_task(coordinator.clone());

        Ok(Self {
            entry,
            coordinator,
            entities,
            topics,
            tasks: vec![update_task, poll_task],
        })
    }

    pub fn entry(&self) -> &ConfigEntry {
        &self.entry
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    /// Options-flow update listener.
    pub async fn apply_options(&self, options: &EntryOptions) {
        self.coordinator
            .set_update_interval(options.expiration())
            .await;
    }

    pub async fn set_number(&self, key: &str, value: f64) -> Result<(), PlatformError> {
        let Some(description) = self.entities.iter().find_map(|entity| match &entity.kind {
            EntityKind::Number(description) if entity.key.to_string() == key => Some(description),
            _ => None,
        }) else {
            return Err(PlatformError::UnknownEntity {
                platform: "number",
                key: key.to_string(),
            });
        };

        if !value.is_finite() || value < description.min_value || value > description.max_value {
            return Err(PlatformError::OutOfRange(value));
        }

        self.coordinator
            .set_consumption(key.to_string(), value)
            .await?;
        Ok(())
    }

    pub async fn turn_on(&self, key: &str) -> Result<(), PlatformError> {
        self.set_dry_switch(key, 1).await
    }

    pub async fn turn_off(&self, key: &str) -> Result<(), PlatformError> {
        self.set_dry_switch(key, 0).await
    }

    // The device only reports the new relay state with its next push, so the
    // written value goes into the snapshot right away.
    async fn set_dry_switch(&self, key: &str, value: u8) -> Result<(), PlatformError> {
        let known = self.entities.iter().any(|entity| {
            matches!(entity.kind, EntityKind::Switch(_)) && entity.key.to_string() == key
        });
        if !known {
            return Err(PlatformError::UnknownEntity {
                platform: "switch",
                key: key.to_string(),
            });
        }

        self.coordinator.set_dry_switch(value).await?;
        self.coordinator
            .update(|data| data.insert(key, f64::from(value)))
            .await;
        Ok(())
    }

    pub async fn unload(&self, mqtt: &MqttHub) {
        for task in &self.tasks {
            task.abort();
        }
        mqtt.unsubscribe(&self.topics).await;
        info!(devid = self.entry.entry_id(), "device unloaded");
    }
}

fn spawn_update_task(
    coordinator: Coordinator,
    mut queue: mpsc::Receiver<Vec<u8>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(payload) = queue.recv().await {
            match Snapshot::from_json(&payload) {
                Ok(data) => {
                    debug!(keys = data.len(), "mqtt data");
                    coordinator.set_updated_data(data).await;
                }
                Err(err) => warn!("ignoring mqtt payload: {err}"),
            }
        }
    })
}

fn spawn_poll_task(coordinator: Coordinator) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let interval = coordinator.update_interval().await;
            tokio::time::sleep(interval).await;
            coordinator.data().await;
        }
    })
}
