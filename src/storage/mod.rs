//! Endpoint configuration persistence.
//!
//! [`ConfigStore`] is the capability the registry loads from: a flat list of
//! [`ProviderConfig`] records, replaced transactionally by the admin surface.
//! [`ConfigDb`] backs it with redb (embedded ACID key-value store);
//! [`MemoryStore`] backs it with a plain Vec for tests and file-seeded runs.

use crate::clients::ProviderKind;
use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const CONFIG_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("provider_configs");

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Validation(String),
}

/// One LLM endpoint configuration. Persisted by a [`ConfigStore`]; the
/// registry builds one runtime endpoint per enabled record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub id: i64,

    /// Operator-facing name ("primary-openai", "backup-gemini").
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub provider: ProviderKind,

    #[serde(default)]
    pub api_key: String,

    /// Custom base URL, e.g. an OpenAI-compatible gateway.
    #[serde(default)]
    pub base_url: String,

    #[serde(default)]
    pub model: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Smaller value = preferred tier.
    #[serde(default = "default_priority")]
    pub priority: i32,

    /// Traffic share within the same priority tier.
    #[serde(default = "default_weight")]
    pub weight: i32,

    #[serde(default = "default_timeout")]
    pub timeout_seconds: i64,

    /// Failure cooldown base; grows exponentially with the failure streak.
    #[serde(default = "default_timeout")]
    pub cooldown_seconds: i64,

    #[serde(default)]
    pub anthropic_version: String,

    #[serde(default)]
    pub gemini_endpoint: String,

    /// USD per 1k tokens. Opaque to dispatch; forwarded on success.
    #[serde(default)]
    pub input_price_per_1k: f64,
    #[serde(default)]
    pub output_price_per_1k: f64,

    /// Empty = never probed.
    #[serde(default)]
    pub health_ping_url: String,

    #[serde(default = "default_health_timeout")]
    pub health_timeout_seconds: i64,

    /// Consecutive failures that open the breaker.
    #[serde(default = "default_max_error_streak")]
    pub max_error_streak: u32,

    /// Consecutive successes that close it again.
    #[serde(default = "default_recovery_successes")]
    pub recovery_successes: u32,

    /// 0 = unlimited.
    #[serde(default)]
    pub rate_limit_per_min: i32,

    #[serde(default)]
    pub rate_limit_burst: i32,
}

fn default_true() -> bool {
    true
}
fn default_priority() -> i32 {
    100
}
fn default_weight() -> i32 {
    100
}
fn default_timeout() -> i64 {
    30
}
fn default_health_timeout() -> i64 {
    5
}
fn default_max_error_streak() -> u32 {
    3
}
fn default_recovery_successes() -> u32 {
    2
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            provider: ProviderKind::default(),
            api_key: String::new(),
            base_url: String::new(),
            model: String::new(),
            enabled: true,
            priority: default_priority(),
            weight: default_weight(),
            timeout_seconds: default_timeout(),
            cooldown_seconds: default_timeout(),
            anthropic_version: String::new(),
            gemini_endpoint: String::new(),
            input_price_per_1k: 0.0,
            output_price_per_1k: 0.0,
            health_ping_url: String::new(),
            health_timeout_seconds: default_health_timeout(),
            max_error_streak: default_max_error_streak(),
            recovery_successes: default_recovery_successes(),
            rate_limit_per_min: 0,
            rate_limit_burst: 0,
        }
    }
}

impl ProviderConfig {
    /// Copy with the API key reduced to `****` plus at most the trailing
    /// four characters. Empty keys stay empty.
    pub fn masked(&self) -> Self {
        let mut copy = self.clone();
        if !copy.api_key.is_empty() {
            let tail: String = if copy.api_key.len() > 4 {
                copy.api_key[copy.api_key.len() - 4..].to_string()
            } else {
                String::new()
            };
            copy.api_key = format!("****{tail}");
        }
        copy
    }
}

/// Partial pricing update, keyed by config id. Kept separate from
/// [`ProviderConfig`] so the admin pricing route cannot touch credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderPricing {
    pub id: i64,
    pub input_price_per_1k: f64,
    pub output_price_per_1k: f64,
}

/// Persistence capability the registry depends on.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// All records including disabled ones, ordered by priority asc, id asc.
    async fn list_all(&self) -> Result<Vec<ProviderConfig>, StoreError>;

    /// Replace the whole set transactionally. Records with `id == 0` get a
    /// fresh id.
    async fn replace_all(&self, configs: Vec<ProviderConfig>) -> Result<(), StoreError>;

    /// Transactional partial pricing update. Prices must be in `[0, 100]`.
    async fn update_pricing(&self, updates: &[ProviderPricing]) -> Result<(), StoreError>;
}

fn validate_pricing(update: &ProviderPricing) -> Result<(), StoreError> {
    if update.id <= 0 {
        return Err(StoreError::Validation("pricing id must be positive".to_string()));
    }
    if update.input_price_per_1k < 0.0 || update.output_price_per_1k < 0.0 {
        return Err(StoreError::Validation("price must not be negative".to_string()));
    }
    if update.input_price_per_1k > 100.0 || update.output_price_per_1k > 100.0 {
        return Err(StoreError::Validation(
            "price looks wrong (>100 USD per 1k tokens)".to_string(),
        ));
    }
    Ok(())
}

fn sort_records(configs: &mut [ProviderConfig]) {
    configs.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.id.cmp(&b.id)));
}

/// redb-backed [`ConfigStore`].
pub struct ConfigDb {
    db: Database,
    path: PathBuf,
}

impl std::fmt::Debug for ConfigDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigDb").field("path", &self.path).finish()
    }
}

impl ConfigDb {
    /// Open or create the database at the given path.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;
        {
            let write_txn = db.begin_write()?;
            write_txn.open_table(CONFIG_TABLE)?;
            write_txn.commit()?;
        }
        Ok(Self {
            db,
            path: path.to_path_buf(),
        })
    }

    /// Default path: ~/.switchboard/switchboard.db
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".switchboard")
            .join("switchboard.db")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ConfigStore for ConfigDb {
    async fn list_all(&self) -> Result<Vec<ProviderConfig>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(CONFIG_TABLE)?;
        let mut configs = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            configs.push(serde_json::from_slice::<ProviderConfig>(value.value())?);
        }
        sort_records(&mut configs);
        Ok(configs)
    }

    async fn replace_all(&self, configs: Vec<ProviderConfig>) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(CONFIG_TABLE)?;

            let existing: Vec<u64> = table
                .iter()?
                .map(|entry| entry.map(|(k, _)| k.value()))
                .collect::<Result<_, _>>()?;
            for key in existing {
                table.remove(key)?;
            }

            let mut next_id = configs.iter().map(|c| c.id).max().unwrap_or(0).max(0) + 1;
            for mut cfg in configs {
                if cfg.id <= 0 {
                    cfg.id = next_id;
                    next_id += 1;
                }
                let bytes = serde_json::to_vec(&cfg)?;
                table.insert(cfg.id as u64, bytes.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    async fn update_pricing(&self, updates: &[ProviderPricing]) -> Result<(), StoreError> {
        if updates.is_empty() {
            return Ok(());
        }
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(CONFIG_TABLE)?;
            for update in updates {
                validate_pricing(update)?;
                let mut cfg: ProviderConfig = match table.get(update.id as u64)? {
                    Some(value) => serde_json::from_slice(value.value())?,
                    None => {
                        return Err(StoreError::Validation(format!(
                            "unknown config id {}",
                            update.id
                        )))
                    }
                };
                cfg.input_price_per_1k = update.input_price_per_1k;
                cfg.output_price_per_1k = update.output_price_per_1k;
                let bytes = serde_json::to_vec(&cfg)?;
                table.insert(cfg.id as u64, bytes.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }
}

/// In-memory [`ConfigStore`] for tests and file-seeded deployments.
#[derive(Debug, Default)]
pub struct MemoryStore {
    configs: Mutex<Vec<ProviderConfig>>,
}

impl MemoryStore {
    pub fn new(configs: Vec<ProviderConfig>) -> Self {
        let store = Self::default();
        store.seed(configs);
        store
    }

    fn seed(&self, configs: Vec<ProviderConfig>) {
        let mut guard = self.configs.lock().unwrap_or_else(|e| e.into_inner());
        let mut next_id = configs.iter().map(|c| c.id).max().unwrap_or(0).max(0) + 1;
        *guard = configs
            .into_iter()
            .map(|mut cfg| {
                if cfg.id <= 0 {
                    cfg.id = next_id;
                    next_id += 1;
                }
                cfg
            })
            .collect();
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn list_all(&self) -> Result<Vec<ProviderConfig>, StoreError> {
        let mut configs = self
            .configs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        sort_records(&mut configs);
        Ok(configs)
    }

    async fn replace_all(&self, configs: Vec<ProviderConfig>) -> Result<(), StoreError> {
        self.seed(configs);
        Ok(())
    }

    async fn update_pricing(&self, updates: &[ProviderPricing]) -> Result<(), StoreError> {
        let mut guard = self.configs.lock().unwrap_or_else(|e| e.into_inner());
        for update in updates {
            validate_pricing(update)?;
            let cfg = guard
                .iter_mut()
                .find(|c| c.id == update.id)
                .ok_or_else(|| {
                    StoreError::Validation(format!("unknown config id {}", update.id))
                })?;
            cfg.input_price_per_1k = update.input_price_per_1k;
            cfg.output_price_per_1k = update.output_price_per_1k;
        }
        Ok(())
    }
}
