use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tokio::{
    sync::{watch, Mutex},
    task::JoinError,
    time::Instant,
};
use tracing::debug;

use smart_maic_common::{Snapshot, SnapshotStore};

use crate::gateway::{DeviceApi, DeviceConfig, GatewayError};

#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("device worker failed: {0}")]
    Worker(#[from] JoinError),
}

impl CommandError {
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Gateway(err) if err.is_connectivity())
    }
}

struct State {
    store: SnapshotStore,
    updated_at: Option<DateTime<Utc>>,
}

/// Owns the latest device snapshot and forwards writes to the device.
///
/// Snapshot reads and writes are serialized by one lock, so an expiry check
/// always sees the newest update time.
#[derive(Clone)]
pub struct Coordinator {
    api: Arc<dyn DeviceApi>,
    state: Arc<Mutex<State>>,
    updates: Arc<watch::Sender<Snapshot>>,
    epoch: Instant,
}

impl Coordinator {
    pub fn new(api: Arc<dyn DeviceApi>, update_interval: Duration) -> Self {
        let (updates, _) = watch::channel(Snapshot::new());
        Self {
            api,
            state: Arc::new(Mutex::new(State {
                store: SnapshotStore::new(duration_ms(update_interval)),
                updated_at: None,
            })),
            updates: Arc::new(updates),
            epoch: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        duration_ms(self.epoch.elapsed())
    }

    /// Notified on every snapshot replacement, including expiry.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.updates.subscribe()
    }

    pub async fn update_interval(&self) -> Duration {
        Duration::from_millis(self.state.lock().await.store.interval_ms())
    }

    pub async fn set_update_interval(&self, interval: Duration) {
        self.state
            .lock()
            .await
            .store
            .set_interval_ms(duration_ms(interval));
        debug!(?interval, "update interval changed");
    }

    pub async fn set_updated_data(&self, data: Snapshot) {
        let now_ms = self.now_ms();
        let mut state = self.state.lock().await;
        self.replace(&mut state, data, now_ms);
    }

    /// Applies `patch` to the current snapshot and stores the result as a
    /// fresh update, all under one lock.
    pub async fn update<F>(&self, patch: F) -> Snapshot
    where
        F: FnOnce(&mut Snapshot),
    {
        let now_ms = self.now_ms();
        let mut state = self.state.lock().await;
        state.store.expire(now_ms);
        let mut data = state.store.peek().clone();
        patch(&mut data);
        self.replace(&mut state, data.clone(), now_ms);
        data
    }

    /// Current snapshot, cleared first if it has gone stale.
    pub async fn data(&self) -> Snapshot {
        let now_ms = self.now_ms();
        let mut state = self.state.lock().await;
        debug!(last_update = ?state.updated_at, "checking data age");
        if state.store.expire(now_ms) {
            debug!("data expired");
            self.updates.send_replace(Snapshot::new());
        }
        state.store.peek().clone()
    }

    // Caller holds the state lock; watchers see updates in store order.
    fn replace(&self, state: &mut State, data: Snapshot, now_ms: u64) {
        state.store.set_updated_data(data.clone(), now_ms);
        state.updated_at = Some(Utc::now());
        self.updates.send_replace(data);
    }

    pub async fn last_updated_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().await.updated_at
    }

    pub async fn get_config(&self) -> Result<DeviceConfig, CommandError> {
        self.run_blocking(|api| api.read_config()).await
    }

    pub async fn get_wdata(&self) -> Result<Value, CommandError> {
        self.run_blocking(|api| api.read_wdata()).await
    }

    pub async fn set_mqtt_config(&self) -> Result<DeviceConfig, CommandError> {
        self.run_blocking(|api| api.enable_mqtt_relay()).await
    }

    pub async fn set_consumption(&self, key: String, value: f64) -> Result<(), CommandError> {
        self.run_blocking(move |api| api.write_consumption(&key, value))
            .await
    }

    pub async fn set_dry_switch(&self, value: u8) -> Result<(), CommandError> {
        self.run_blocking(move |api| api.write_dry_switch(value)).await
    }

    async fn run_blocking<T, F>(&self, call: F) -> Result<T, CommandError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn DeviceApi) -> Result<T, GatewayError> + Send + 'static,
    {
        let api = Arc::clone(&self.api);
        Ok(tokio::task::spawn_blocking(move || call(api.as_ref())).await??)
    }
}

fn duration_ms(duration: Duration) -> u64 {
    duration.as_millis().try_into().unwrap_or(u64::MAX)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;

    /// Records device calls and fails the ones it is told to.
    #[derive(Default)]
    pub(crate) struct FakeDevice {
        pub calls: StdMutex<Vec<String>>,
        pub fail_writes: bool,
        pub config: DeviceConfig,
    }

    impl FakeDevice {
        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) -> Result<(), GatewayError> {
            self.calls.lock().unwrap().push(call);
            if self.fail_writes {
                return Err(GatewayError::Status(500));
            }
            Ok(())
        }
    }

    impl DeviceApi for FakeDevice {
        fn read_config(&self) -> Result<DeviceConfig, GatewayError> {
            self.calls.lock().unwrap().push("read_config".to_string());
            Ok(self.config.clone())
        }

        fn read_wdata(&self) -> Result<Value, GatewayError> {
            Ok(Value::Null)
        }

        fn enable_mqtt_relay(&self) -> Result<DeviceConfig, GatewayError> {
            self.calls.lock().unwrap().push("enable_mqtt_relay".to_string());
            Ok(self.config.clone())
        }

        fn write_consumption(&self, key: &str, value: f64) -> Result<(), GatewayError> {
            self.record(format!("consumption {key}={value}"))
        }

        fn write_dry_switch(&self, value: u8) -> Result<(), GatewayError> {
            self.record(format!("dry_switch {value}"))
        }
    }

    fn coordinator(interval: Duration) -> Coordinator {
        Coordinator::new(Arc::new(FakeDevice::default()), interval)
    }

    fn sample() -> Snapshot {
        [("V1", 229.0), ("A1", 2.0), ("OUT", 0.0)].into_iter().collect()
    }

    #[tokio::test(start_paused = true)]
    async fn data_is_returned_until_interval_elapses() {
        let coordinator = coordinator(Duration::from_secs(60));
        coordinator.set_updated_data(sample()).await;

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(coordinator.data().await, sample());
        assert!(coordinator.last_updated_at().await.is_some());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(coordinator.data().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn push_between_polls_keeps_data_fresh() {
        let coordinator = coordinator(Duration::from_secs(5));
        coordinator.set_updated_data(sample()).await;

        tokio::time::advance(Duration::from_secs(4)).await;
        coordinator.set_updated_data(sample()).await;
        tokio::time::advance(Duration::from_secs(4)).await;

        assert_eq!(coordinator.data().await, sample());
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_notifies_subscribers() {
        let coordinator = coordinator(Duration::from_secs(5));
        let mut updates = coordinator.subscribe();

        coordinator.set_updated_data(sample()).await;
        assert!(updates.has_changed().unwrap());
        assert_eq!(*updates.borrow_and_update(), sample());

        tokio::time::advance(Duration::from_secs(5)).await;
        coordinator.data().await;
        assert!(updates.has_changed().unwrap());
        assert!(updates.borrow_and_update().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn interval_change_applies_to_current_data() {
        let coordinator = coordinator(Duration::from_secs(60));
        coordinator.set_updated_data(sample()).await;
        coordinator.set_update_interval(Duration::from_secs(10)).await;

        assert_eq!(coordinator.update_interval().await, Duration::from_secs(10));
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(coordinator.data().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn update_patches_current_data_and_refreshes_it() {
        let coordinator = coordinator(Duration::from_secs(5));
        let mut updates = coordinator.subscribe();
        coordinator.set_updated_data(sample()).await;
        tokio::time::advance(Duration::from_secs(4)).await;

        let patched = coordinator.update(|data| data.insert("OUT", 1.0)).await;

        assert_eq!(patched.get("OUT"), Some(1.0));
        assert_eq!(patched.get("V1"), Some(229.0));
        assert_eq!(*updates.borrow_and_update(), patched);
        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(coordinator.data().await, patched);
    }

    #[tokio::test(start_paused = true)]
    async fn update_on_stale_data_starts_from_empty() {
        let coordinator = coordinator(Duration::from_secs(5));
        coordinator.set_updated_data(sample()).await;
        tokio::time::advance(Duration::from_secs(5)).await;

        let patched = coordinator.update(|data| data.insert("OUT", 0.0)).await;

        let expected: Snapshot = [("OUT", 0.0)].into_iter().collect();
        assert_eq!(patched, expected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn watch_follows_store_under_concurrent_pushes() {
        let coordinator = coordinator(Duration::from_secs(60));
        let mut tasks = Vec::new();
        for value in 0..32 {
            let coordinator = coordinator.clone();
            tasks.push(tokio::spawn(async move {
                let data: Snapshot = [("W", f64::from(value))].into_iter().collect();
                coordinator.set_updated_data(data).await;
                coordinator.update(|data| data.insert("OUT", 1.0)).await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let latest = coordinator.subscribe().borrow().clone();
        assert_eq!(coordinator.data().await, latest);
    }

    #[tokio::test]
    async fn writes_are_delegated_to_the_device() {
        let device = Arc::new(FakeDevice::default());
        let coordinator = Coordinator::new(device.clone(), Duration::from_secs(60));

        coordinator.set_consumption("Wh1".to_string(), 1500.0).await.unwrap();
        coordinator.set_dry_switch(1).await.unwrap();
        coordinator.get_config().await.unwrap();

        assert_eq!(
            device.calls(),
            vec!["consumption Wh1=1500", "dry_switch 1", "read_config"]
        );
    }

    #[tokio::test]
    async fn failed_writes_report_connectivity() {
        let device = Arc::new(FakeDevice {
            fail_writes: true,
            ..FakeDevice::default()
        });
        let coordinator = Coordinator::new(device, Duration::from_secs(60));

        let err = coordinator.set_dry_switch(0).await.unwrap_err();
        assert!(err.is_connectivity());
    }
}
