// =============================================================================
// Settings Store — durable per-account settings
// =============================================================================
//
// `JsonSettingsStore` keeps every account in one JSON array. Writes go to a
// `.tmp` sibling and are renamed over the original, so a crash mid-write
// leaves the previous file intact. File I/O runs on the blocking pool.
// =============================================================================

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::{BotError, Result};
use crate::settings::AccountSettings;

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn load_all(&self) -> Result<Vec<AccountSettings>>;

    /// Insert or replace the settings of `settings.account_id`.
    async fn save(&self, settings: &AccountSettings) -> Result<()>;
}

pub struct JsonSettingsStore {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl JsonSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_accounts(path: &Path) -> Result<Vec<AccountSettings>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(BotError::Persistence(format!(
                "failed to read {}: {e}",
                path.display()
            )))
        }
    };
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&content)
        .map_err(|e| BotError::Persistence(format!("failed to parse {}: {e}", path.display())))
}

fn write_accounts(path: &Path, accounts: &[AccountSettings]) -> Result<()> {
    let content = serde_json::to_string_pretty(accounts)
        .map_err(|e| BotError::Persistence(format!("failed to serialise settings: {e}")))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, content)
        .map_err(|e| BotError::Persistence(format!("failed to write {}: {e}", tmp.display())))?;
    std::fs::rename(&tmp, path)
        .map_err(|e| BotError::Persistence(format!("failed to rename to {}: {e}", path.display())))
}

#[async_trait]
impl SettingsStore for JsonSettingsStore {
    async fn load_all(&self) -> Result<Vec<AccountSettings>> {
        let path = self.path.clone();
        let accounts = tokio::task::spawn_blocking(move || read_accounts(&path))
            .await
            .map_err(|e| BotError::Persistence(format!("settings load task failed: {e}")))??;
        info!(path = %self.path.display(), count = accounts.len(), "account settings loaded");
        Ok(accounts)
    }

    async fn save(&self, settings: &AccountSettings) -> Result<()> {
        let path = self.path.clone();
        let lock = self.write_lock.clone();
        let settings = settings.clone();
        let account_id = settings.account_id.clone();

        tokio::task::spawn_blocking(move || {
            let _guard = lock.lock();
            let mut accounts = read_accounts(&path)?;
            match accounts
                .iter_mut()
                .find(|a| a.account_id == settings.account_id)
            {
                Some(slot) => *slot = settings,
                None => accounts.push(settings),
            }
            write_accounts(&path, &accounts)
        })
        .await
        .map_err(|e| BotError::Persistence(format!("settings save task failed: {e}")))??;

        debug!(account = %account_id, path = %self.path.display(), "account settings saved");
        Ok(())
    }
}
