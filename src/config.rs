use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfError {
    // The generated code for returning an error is cheaper than maybe panicking.
    #[error("a prior check guaranteed that this error would never happen.")]
    Impossible,
}

/// Stuff the app needs that's sourced from configuration.
#[derive(Clone, Debug)]
pub struct HoardConfig {
    /// The location of the database file.
    pub db_file: PathBuf,
    /// The port to listen on when serving.
    pub port: u16,
    /// The request header that names the calling agent.
    pub agent_header: String,
    /// Whether to check the integrity of database migrations before
    /// continuing startup.
    pub validate_migrations: bool,
    pub database: DatabaseConfig,
    pub duplicates: DuplicatesConfig,
    pub memory: MemoryConfig,
    pub worker: WorkerConfig,
    pub log: LogConfig,
}

/// Timing knobs for the store and the write lock. These are the keys the
/// concurrency core actually consults; everything else in the file belongs
/// to the outer layers.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// The store's internal busy-retry budget.
    pub busy_timeout_ms: u64,
    /// Bound for acquiring the cross-process write lock.
    pub lock_timeout_ms: u64,
    /// Upper-layer retry budget when the write lock times out.
    pub retry_budget_ms: u64,
    /// Upper-layer initial backoff between those retries.
    pub retry_backoff_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            lock_timeout_ms: 30_000,
            retry_budget_ms: 30_000,
            retry_backoff_ms: 50,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DuplicatesConfig {
    /// Cosine similarity at or above this marks a pair as duplicates.
    pub threshold: f64,
}

impl Default for DuplicatesConfig {
    fn default() -> Self {
        Self { threshold: 0.85 }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Default TTL for new memories, in days. Zero means expire
    /// immediately; explicit per-call TTLs override this.
    pub default_ttl_days: i64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self { default_ttl_days: 30 }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Whether to run the background job worker inside the server.
    pub enabled: bool,
    /// Worker-lease expiry. Renewal happens at a third of this.
    pub lease_ttl_ms: i64,
    /// How long terminal job rows stick around before the sweeper
    /// deletes them.
    pub job_retention_hours: i64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lease_ttl_ms: 15_000,
            job_retention_hours: 24,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub stdout: bool,
    pub filter: String,
    pub file: Option<LogFileConfig>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            stdout: true,
            filter: "hoard=debug,info".to_string(),
            file: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct LogFileConfig {
    pub name: String,
    pub directory: String,
    pub days: usize,
}

/// The intermediate struct used for deserializing the config file and
/// generating a usable HoardConfig struct.
#[derive(Debug, Deserialize)]
struct PreHoardConfig {
    // The db path can be absolute, or relative to the config file's dir.
    db_file: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_agent_header")]
    agent_header: String,
    #[serde(default)]
    validate_migrations: bool,
    #[serde(default)]
    database: DatabaseConfig,
    #[serde(default)]
    duplicates: DuplicatesConfig,
    #[serde(default)]
    memory: MemoryConfig,
    #[serde(default)]
    worker: WorkerConfig,
    #[serde(default)]
    log: LogConfig,
}

fn default_port() -> u16 {
    5737
}

fn default_agent_header() -> String {
    "x-hoard-agent".to_string()
}

impl PreHoardConfig {
    fn finalize(self, base_dir: &Path) -> anyhow::Result<HoardConfig> {
        let Self {
            db_file,
            port,
            agent_header,
            validate_migrations,
            database,
            duplicates,
            memory,
            worker,
            log,
        } = self;
        Ok(HoardConfig {
            db_file: base_dir.join(db_file),
            port,
            agent_header,
            validate_migrations,
            database,
            duplicates,
            memory,
            worker,
            log,
        })
    }
}

impl HoardConfig {
    /// Load app configuration from a config file. The provided path can be
    /// absolute or relative to the current working directory.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let cwd = std::env::current_dir()?;
        let abs_path = cwd.join(path.as_ref());
        // This runs before we have a tracing subscriber, so we have to log rudely.
        println!("Startup: loading config file from {:?}", &abs_path);
        let base_dir = abs_path.parent().ok_or(ConfError::Impossible)?;
        let conf_text = std::fs::read_to_string(&abs_path)?;
        let pre: PreHoardConfig = toml::from_str(&conf_text)?;
        pre.finalize(base_dir)
    }

    /// The cross-process write lock lives next to the store: `P.lock`.
    pub fn write_lock_path(&self) -> PathBuf {
        sibling_path(&self.db_file, "lock")
    }

    /// The server singleton lock: `P.server`.
    pub fn server_lock_path(&self) -> PathBuf {
        sibling_path(&self.db_file, "server")
    }

    /// The connector-sync pipeline lock: `P.sync`.
    pub fn sync_lock_path(&self) -> PathBuf {
        sibling_path(&self.db_file, "sync")
    }

    #[cfg(test)]
    pub fn temp_test(db_file: impl Into<PathBuf>) -> Self {
        Self {
            db_file: db_file.into(),
            port: 0,
            agent_header: default_agent_header(),
            validate_migrations: false,
            database: DatabaseConfig {
                // Short enough that contention tests don't drag.
                lock_timeout_ms: 2_000,
                retry_budget_ms: 2_000,
                ..DatabaseConfig::default()
            },
            duplicates: DuplicatesConfig::default(),
            memory: MemoryConfig::default(),
            worker: WorkerConfig {
                enabled: false,
                ..WorkerConfig::default()
            },
            log: LogConfig::default(),
        }
    }
}

/// `foo/hoard.db` -> `foo/hoard.db.<suffix>`. Appends rather than swapping
/// extensions, so stores named without an extension still get distinct
/// sibling files.
fn sibling_path(db_file: &Path, suffix: &str) -> PathBuf {
    let mut name = db_file.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sibling_paths() {
        let conf = HoardConfig::temp_test("/tmp/stuff/hoard.db");
        assert_eq!(
            conf.write_lock_path(),
            PathBuf::from("/tmp/stuff/hoard.db.lock")
        );
        assert_eq!(
            conf.server_lock_path(),
            PathBuf::from("/tmp/stuff/hoard.db.server")
        );
        assert_eq!(
            conf.sync_lock_path(),
            PathBuf::from("/tmp/stuff/hoard.db.sync")
        );
    }

    #[test]
    fn minimal_config_parses_with_defaults() {
        let pre: PreHoardConfig = toml::from_str(r#"db_file = "hoard.db""#).unwrap();
        let conf = pre.finalize(Path::new("/srv/hoard")).unwrap();
        assert_eq!(conf.db_file, PathBuf::from("/srv/hoard/hoard.db"));
        assert_eq!(conf.port, 5737);
        assert_eq!(conf.database.busy_timeout_ms, 5_000);
        assert_eq!(conf.database.lock_timeout_ms, 30_000);
        assert_eq!(conf.duplicates.threshold, 0.85);
        assert_eq!(conf.memory.default_ttl_days, 30);
        assert!(conf.worker.enabled);
    }
}
