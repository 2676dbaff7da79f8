//! Config stores with optimistic version checks.
//!
//! `update` reads the latest snapshot, applies the pure update function and
//! installs the result only if nobody changed the config meanwhile; otherwise
//! it retries against the newer version. `replace` never retries: a stale
//! version token is a conflict.

use async_trait::async_trait;
use gantry_core::config::{ConfigDocument, ConfigSnapshot, ConfigVersion};
use gantry_core::ports::ConfigStore;
use gantry_core::{Error, Result};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

const DEFAULT_ATTEMPTS: u32 = 5;
const DEFAULT_BACKOFF: Duration = Duration::from_millis(50);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Write `contents` to a fresh temp file beside `path`, then rename it over `path`.
fn replace_file(path: &Path, contents: &str) -> std::io::Result<()> {
    let dir = path
        .parent()
        .filter(|d| !d.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let mut temp = tempfile::Builder::new()
        .prefix(".gantry-config")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    temp.write_all(contents.as_bytes())?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn conflict(expected: &ConfigVersion, actual: &ConfigVersion) -> Error {
    Error::ConfigConflict {
        expected: expected.to_string(),
        actual: actual.to_string(),
    }
}

/// Config held in memory.
pub struct InMemoryConfigStore {
    current: RwLock<ConfigSnapshot>,
    attempts: u32,
}

impl InMemoryConfigStore {
    pub fn new(document: ConfigDocument) -> Result<Self> {
        Ok(Self {
            current: RwLock::new(ConfigSnapshot::new(document)?),
            attempts: DEFAULT_ATTEMPTS,
        })
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }
}

#[async_trait]
impl ConfigStore for InMemoryConfigStore {
    async fn current(&self) -> Result<ConfigSnapshot> {
        Ok(self.current.read().await.clone())
    }

    async fn update(
        &self,
        update: &(dyn for<'d> Fn(&'d mut ConfigDocument) -> Result<()> + Send + Sync),
    ) -> Result<ConfigSnapshot> {
        for attempt in 1..=self.attempts {
            let base = self.current().await?;
            let mut document = base.document().clone();
            update(&mut document)?;
            let next = ConfigSnapshot::new(document)?;

            let mut current = self.current.write().await;
            if current.version() == base.version() {
                debug!(version = %next.version(), attempt, "Config updated");
                *current = next.clone();
                return Ok(next);
            }
            debug!(
                base = %base.version(),
                latest = %current.version(),
                attempt,
                "Config changed underneath update, retrying"
            );
        }
        Err(Error::ConfigWriteExhausted {
            attempts: self.attempts,
            message: "config kept changing during update".to_string(),
        })
    }

    async fn replace(
        &self,
        expected: &ConfigVersion,
        document: ConfigDocument,
    ) -> Result<ConfigSnapshot> {
        let next = ConfigSnapshot::new(document)?;
        let mut current = self.current.write().await;
        if current.version() != expected {
            return Err(conflict(expected, current.version()));
        }
        *current = next.clone();
        Ok(next)
    }
}

/// Config kept in a YAML file.
///
/// Every read goes to disk, so rewrites by other processes are picked up and
/// show as a version change. Each write goes to its own uniquely named temp
/// file in the same directory, which is then renamed over the original; I/O
/// failures are retried with exponential backoff.
pub struct FileConfigStore {
    path: PathBuf,
    attempts: u32,
    backoff: Duration,
    writer: Mutex<()>,
}

impl FileConfigStore {
    /// Open an existing config file. The file must already hold a valid document.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let store = Self {
            path: path.into(),
            attempts: DEFAULT_ATTEMPTS,
            backoff: DEFAULT_BACKOFF,
            writer: Mutex::new(()),
        };
        let snapshot = store.read().await?;
        info!(path = %store.path.display(), version = %snapshot.version(), "Config loaded");
        Ok(store)
    }

    /// Create the file with `document`, replacing whatever was there.
    pub async fn create(path: impl Into<PathBuf>, document: ConfigDocument) -> Result<Self> {
        let store = Self {
            path: path.into(),
            attempts: DEFAULT_ATTEMPTS,
            backoff: DEFAULT_BACKOFF,
            writer: Mutex::new(()),
        };
        let snapshot = ConfigSnapshot::new(document)?;
        store.write(snapshot.document()).await?;
        Ok(store)
    }

    pub fn with_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.backoff = backoff;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<ConfigSnapshot> {
        let contents = tokio::fs::read_to_string(&self.path).await?;
        ConfigSnapshot::new(ConfigDocument::from_yaml(&contents)?)
    }

    async fn write(&self, document: &ConfigDocument) -> Result<()> {
        let contents: Arc<str> = document.to_yaml()?.into();
        let mut delay = self.backoff;
        let mut attempt = 1;
        loop {
            let path = self.path.clone();
            let contents = contents.clone();
            let result = tokio::task::spawn_blocking(move || replace_file(&path, &contents))
                .await
                .unwrap_or_else(|e| Err(std::io::Error::other(e)));
            match result {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.attempts => {
                    warn!(
                        path = %self.path.display(),
                        attempt,
                        error = %e,
                        "Config write failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(MAX_BACKOFF);
                    attempt += 1;
                }
                Err(e) => {
                    return Err(Error::ConfigWriteExhausted {
                        attempts: self.attempts,
                        message: e.to_string(),
                    });
                }
            }
        }
    }
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn current(&self) -> Result<ConfigSnapshot> {
        self.read().await
    }

    async fn update(
        &self,
        update: &(dyn for<'d> Fn(&'d mut ConfigDocument) -> Result<()> + Send + Sync),
    ) -> Result<ConfigSnapshot> {
        let mut delay = self.backoff;
        for attempt in 1..=self.attempts {
            let base = self.read().await?;
            let mut document = base.document().clone();
            update(&mut document)?;
            let next = ConfigSnapshot::new(document)?;

            {
                let _writer = self.writer.lock().await;
                let latest = self.read().await?;
                if latest.version() == base.version() {
                    self.write(next.document()).await?;
                    debug!(version = %next.version(), attempt, "Config file updated");
                    return Ok(next);
                }
                debug!(
                    base = %base.version(),
                    latest = %latest.version(),
                    attempt,
                    "Config file changed underneath update, retrying"
                );
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(MAX_BACKOFF);
        }
        Err(Error::ConfigWriteExhausted {
            attempts: self.attempts,
            message: format!("{} kept changing during update", self.path.display()),
        })
    }

    async fn replace(
        &self,
        expected: &ConfigVersion,
        document: ConfigDocument,
    ) -> Result<ConfigSnapshot> {
        let next = ConfigSnapshot::new(document)?;
        let _writer = self.writer.lock().await;
        let latest = self.read().await?;
        if latest.version() != expected {
            return Err(conflict(expected, latest.version()));
        }
        self.write(next.document()).await?;
        Ok(next)
    }
}
