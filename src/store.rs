use std::{collections::BTreeSet, io, io::Write, path::PathBuf};

use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use log::debug;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tempfile::NamedTempFile;
use tokio::{fs, task};

use crate::cfg::StorageConfig;

pub const MIN_INTERVAL_MINUTES: i64 = 1;
pub const MAX_INTERVAL_MINUTES: i64 = 60;
pub const DEFAULT_INTERVAL_MINUTES: i64 = 2;

/// Small JSON documents addressed by key. Writes replace the whole document;
/// the last write wins.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, anyhow::Error>;
    async fn set(&self, key: &str, value: Value) -> Result<(), anyhow::Error>;
}

/// A typed document living under a fixed key.
pub trait Document: Serialize + DeserializeOwned + Send + Sync {
    const KEY: &'static str;
}

pub async fn load<T: Document>(store: &dyn DocumentStore) -> Result<Option<T>, anyhow::Error> {
    match store.get(T::KEY).await? {
        Some(value) => Ok(Some(
            serde_json::from_value(value)
                .with_context(|| format!("malformed document `{}`", T::KEY))?,
        )),
        None => Ok(None),
    }
}

pub async fn save<T: Document>(store: &dyn DocumentStore, document: &T) -> Result<(), anyhow::Error> {
    let value = serde_json::to_value(document)
        .with_context(|| format!("failed to serialize document `{}`", T::KEY))?;
    store.set(T::KEY, value).await
}

fn default_interval() -> i64 {
    DEFAULT_INTERVAL_MINUTES
}

/// The single recipient of availability notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipient {
    pub id: String,
    pub updated_at: DateTime<Utc>,
}

impl Document for Recipient {
    const KEY: &'static str = "target-recipient";
}

/// What to watch. Only commands write it; the watch loop reads it fresh on
/// every cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_interval")]
    pub interval_minutes: i64,
    /// Dates to watch. Empty means any date on the calendar.
    #[serde(default)]
    pub target_dates: BTreeSet<NaiveDate>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_minutes: DEFAULT_INTERVAL_MINUTES,
            target_dates: BTreeSet::new(),
        }
    }
}

impl WatchConfig {
    /// Polling interval in minutes, clamped to the supported range.
    pub fn interval(&self) -> i64 {
        self.interval_minutes
            .clamp(MIN_INTERVAL_MINUTES, MAX_INTERVAL_MINUTES)
    }
}

impl Document for WatchConfig {
    const KEY: &'static str = "watch-config";
}

/// Outcome of the last completed watch cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchState {
    pub has_availability: bool,
    pub checked_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_notified_at: Option<DateTime<Utc>>,
    /// The date set `has_availability` was computed from.
    #[serde(default)]
    pub checked_target_dates: BTreeSet<NaiveDate>,
}

impl Document for WatchState {
    const KEY: &'static str = "watch-state";
}

/// Stores each document as `<key>.json` inside a directory.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(config: &StorageConfig) -> Self {
        let path = shellexpand::full_with_context_no_errors(
            &config.path,
            || dirs::home_dir().and_then(|p| p.to_str().map(|s| s.to_string())),
            |f| std::env::var(f).ok(),
        )
        .to_string();

        Self::at(path)
    }

    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.json", key))
    }
}

#[async_trait]
impl DocumentStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, anyhow::Error> {
        let path = self.path(key);
        match fs::read(&path).await {
            Ok(data) => Ok(Some(
                serde_json::from_slice(&data)
                    .with_context(|| format!("invalid json in {}", path.display()))?,
            )),
            Err(err) => match err.kind() {
                // a document that was never written
                io::ErrorKind::NotFound => Ok(None),
                _ => bail!(err),
            },
        }
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), anyhow::Error> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("failed to create {}", self.root.display()))?;

        let root = self.root.clone();
        let path = self.path(key);
        let data = serde_json::to_vec_pretty(&value)?;

        // readers never see a half written document, and each writer gets
        // its own temporary file so concurrent writes of a key cannot collide
        task::spawn_blocking(move || -> Result<(), anyhow::Error> {
            let mut temp = NamedTempFile::new_in(&root)
                .with_context(|| format!("failed to create a temporary file in {}", root.display()))?;
            temp.write_all(&data)
                .with_context(|| format!("failed to write {}", temp.path().display()))?;
            temp.persist(&path)
                .with_context(|| format!("failed to replace {}", path.display()))?;
            Ok(())
        })
        .await
        .context("the store write task panicked")??;

        debug!("stored {}", key);
        Ok(())
    }
}

#[cfg(test)]
pub use memory::MemoryStore;
