use std::{io::ErrorKind, path::PathBuf, sync::Arc};

use anyhow::Context;
use tokio::sync::Mutex;

use smart_maic_common::{ConfigEntry, EntryOptions};

/// Config entries persisted as JSON under the data directory.
#[derive(Clone)]
pub struct EntryStore {
    entries_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

impl EntryStore {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            entries_path: Arc::new(data_dir.join("entries.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn from_env() -> Self {
        let data_dir = std::env::var("SMART_MAIC_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.smart-maic"));
        Self::new(data_dir)
    }

    pub async fn load_entries(&self) -> anyhow::Result<Vec<ConfigEntry>> {
        let _guard = self.lock.lock().await;
        self.read().await
    }

    /// Adds `entry`, replacing any entry for the same device.
    pub async fn upsert(&self, entry: ConfigEntry) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let mut entries = self.read().await?;
        entries.retain(|other| other.entry_id() != entry.entry_id());
        entries.push(entry);
        self.write(&entries).await
    }

    pub async fn update_options(
        &self,
        entry_id: &str,
        options: EntryOptions,
    ) -> anyhow::Result<Option<ConfigEntry>> {
        let _guard = self.lock.lock().await;
        let mut entries = self.read().await?;
        let Some(entry) = entries.iter_mut().find(|entry| entry.entry_id() == entry_id) else {
            return Ok(None);
        };
        entry.options = options;
        let updated = entry.clone();
        self.write(&entries).await?;
        Ok(Some(updated))
    }

    pub async fn remove(&self, entry_id: &str) -> anyhow::Result<bool> {
        let _guard = self.lock.lock().await;
        let mut entries = self.read().await?;
        let before = entries.len();
        entries.retain(|entry| entry.entry_id() != entry_id);
        if entries.len() == before {
            return Ok(false);
        }
        self.write(&entries).await?;
        Ok(true)
    }

    async fn read(&self) -> anyhow::Result<Vec<ConfigEntry>> {
        match tokio::fs::read(self.entries_path.as_ref()).await {
            Ok(raw) => serde_json::from_slice::<Vec<ConfigEntry>>(&raw)
                .with_context(|| format!("invalid entries file {}", self.entries_path.display())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    async fn write(&self, entries: &[ConfigEntry]) -> anyhow::Result<()> {
        let path = self.entries_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(entries)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }
}
