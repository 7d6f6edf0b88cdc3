use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

/// Default configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "chive.toml";

/// Prefix for environment variable overrides, e.g. `CHIVE__ARCHIVE__RECORD_LIMIT`.
pub const ENV_PREFIX: &str = "CHIVE__";

/// Live document store the archiver drains.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Connection string (`sqlite://path/to/db` or `memory://`)
    pub dsn: String,
    /// Logical database name, used to build remote object keys
    pub database: String,
    /// Collection holding the documents to archive
    pub collection: String,
    /// Field carrying the unique, ordered record identifier
    #[serde(default = "default_id_field")]
    pub id_field: String,
    /// Timestamp field compared against the age threshold
    pub age_field: String,
}

fn default_id_field() -> String {
    "_id".to_string()
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            dsn: String::new(),
            database: String::new(),
            collection: String::new(),
            id_field: default_id_field(),
            age_field: String::new(),
        }
    }
}

impl SourceConfig {
    /// Identity of the source used in bundle keys: `<database>.<collection>`,
    /// or just the collection when no database name is configured.
    pub fn identity(&self) -> String {
        if self.database.is_empty() {
            self.collection.clone()
        } else {
            format!("{}.{}", self.database, self.collection)
        }
    }
}

/// Cold storage destination for uploaded bundles.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    /// Object store DSN (`s3://[key:secret@]host[:port]/bucket`, `file:///path`, `memory://`)
    pub dsn: String,
    /// Key prefix inside the bucket
    #[serde(default)]
    pub prefix: String,
}

/// Sort order used to page through the source collection.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Ordering {
    /// Keyset on `(age_field, id)`; tolerates identifiers that are not
    /// correlated with the age field.
    #[default]
    AgeThenIdentifier,
    /// Keyset on the identifier alone; requires identifiers that grow with time.
    Identifier,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Records whose age field is older than this are archived
    #[serde(with = "humantime_serde")]
    pub age_threshold: Duration,
    /// Period of the extraction tick
    #[serde(with = "humantime_serde")]
    pub extract_interval: Duration,
    /// Period of the flush (package, upload, reconcile) tick
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
    /// Maximum records fetched per extraction
    pub record_limit: usize,
    /// Ceiling for `record_limit * (flush_interval / extract_interval)`
    pub max_pending_records: usize,
    /// Directory holding staged batches and transient bundles
    pub staging_dir: PathBuf,
    /// Append-only log of deleted record identifiers
    pub deletion_log: PathBuf,
    /// Paging order through the source
    #[serde(default)]
    pub ordering: Ordering,
    /// Number of concurrent source deletions during reconciliation
    pub delete_concurrency: usize,
    /// Verify only this many deleted identifiers per flush (all when unset)
    #[serde(default)]
    pub verify_sample: Option<usize>,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            age_threshold: Duration::from_secs(45 * 24 * 3600), // 45 days
            extract_interval: Duration::from_secs(60),
            flush_interval: Duration::from_secs(120),
            record_limit: 100,
            max_pending_records: 100_000,
            staging_dir: PathBuf::from(".data/staging"),
            deletion_log: PathBuf::from(".data/deletion_log.jsonl"),
            ordering: Ordering::default(),
            delete_concurrency: 16,
            verify_sample: None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    MissingSetting(&'static str),

    #[error("{name} must be greater than zero")]
    NotPositive { name: &'static str },

    #[error(
        "flush_interval ({flush:?}) must be strictly greater than extract_interval ({extract:?})"
    )]
    FlushNotLongerThanExtract { extract: Duration, flush: Duration },

    #[error(
        "record_limit * (flush_interval / extract_interval) must be less than {ceiling}, got {pending}"
    )]
    PendingCeilingExceeded { pending: u128, ceiling: usize },
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Configuration {
    /// Document store to drain
    pub source: SourceConfig,
    /// Cold storage destination
    pub storage: StorageConfig,
    /// Pipeline cadence and limits
    pub archive: ArchiveConfig,
}

impl Configuration {
    /// Load from `chive.toml` in the working directory plus `CHIVE__` env vars.
    pub fn load() -> Result<Self, Box<figment::Error>> {
        Self::figment(Path::new(DEFAULT_CONFIG_FILE))
            .extract()
            .map_err(Box::new)
    }

    /// Load from an explicit TOML file plus `CHIVE__` env vars.
    pub fn load_from_path(path: &Path) -> Result<Self, Box<figment::Error>> {
        Self::figment(path).extract().map_err(Box::new)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Configuration::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Check the settings the pipeline relies on. Called once at startup;
    /// any error here is fatal.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source.dsn.is_empty() {
            return Err(ConfigError::MissingSetting("source.dsn"));
        }
        if self.source.collection.is_empty() {
            return Err(ConfigError::MissingSetting("source.collection"));
        }
        if self.source.age_field.is_empty() {
            return Err(ConfigError::MissingSetting("source.age_field"));
        }
        if self.source.id_field.is_empty() {
            return Err(ConfigError::MissingSetting("source.id_field"));
        }
        if self.storage.dsn.is_empty() {
            return Err(ConfigError::MissingSetting("storage.dsn"));
        }

        let archive = &self.archive;
        let zero = Duration::ZERO;
        if archive.age_threshold <= zero {
            return Err(ConfigError::NotPositive {
                name: "archive.age_threshold",
            });
        }
        if archive.extract_interval <= zero {
            return Err(ConfigError::NotPositive {
                name: "archive.extract_interval",
            });
        }
        if archive.record_limit == 0 {
            return Err(ConfigError::NotPositive {
                name: "archive.record_limit",
            });
        }
        if archive.delete_concurrency == 0 {
            return Err(ConfigError::NotPositive {
                name: "archive.delete_concurrency",
            });
        }
        if archive.flush_interval <= archive.extract_interval {
            return Err(ConfigError::FlushNotLongerThanExtract {
                extract: archive.extract_interval,
                flush: archive.flush_interval,
            });
        }

        let pending = archive.record_limit as u128 * archive.flush_interval.as_nanos()
            / archive.extract_interval.as_nanos();
        if pending >= archive.max_pending_records as u128 {
            return Err(ConfigError::PendingCeilingExceeded {
                pending,
                ceiling: archive.max_pending_records,
            });
        }

        Ok(())
    }
}
