//! Persistent application configuration model and defaults.

use std::path::PathBuf;

use log::info;

/// Root configuration persisted to `tunesync.toml`.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Config {
    #[serde(default)]
    /// Document and blob storage locations.
    pub storage: StorageConfig,
    #[serde(default)]
    /// Ingest pipeline tuning.
    pub ingest: IngestConfig,
}

/// Storage locations; empty paths resolve to the per-user data directory.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub data_dir: String,
}

/// Ingest pipeline tuning.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct IngestConfig {
    /// Chunk size used while streaming bytes through the hashing worker.
    #[serde(default = "default_hash_chunk_bytes")]
    pub hash_chunk_bytes: usize,
    /// Depth of the worker's serialized inbound queue.
    #[serde(default = "default_worker_queue_depth")]
    pub worker_queue_depth: usize,
}

fn default_hash_chunk_bytes() -> usize {
    64 * 1024
}

fn default_worker_queue_depth() -> usize {
    64
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: String::new(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            hash_chunk_bytes: default_hash_chunk_bytes(),
            worker_queue_depth: default_worker_queue_depth(),
        }
    }
}

impl StorageConfig {
    /// Resolved root directory for the document database and blob files.
    pub fn resolve_data_dir(&self) -> PathBuf {
        if !self.data_dir.trim().is_empty() {
            return PathBuf::from(self.data_dir.trim());
        }
        dirs::data_dir()
            .expect("Could not find data directory")
            .join("tunesync")
    }

    pub fn document_db_path(&self) -> PathBuf {
        self.resolve_data_dir().join("tunesync.db")
    }

    pub fn blob_dir(&self) -> PathBuf {
        self.resolve_data_dir().join("tracks")
    }
}

/// Clamps tuning values into workable ranges.
pub fn sanitize_config(config: Config) -> Config {
    let clamped_chunk = config.ingest.hash_chunk_bytes.clamp(4 * 1024, 8 * 1024 * 1024);
    let clamped_depth = config.ingest.worker_queue_depth.clamp(1, 1024);

    Config {
        storage: config.storage,
        ingest: IngestConfig {
            hash_chunk_bytes: clamped_chunk,
            worker_queue_depth: clamped_depth,
        },
    }
}

fn config_file_path() -> PathBuf {
    dirs::config_dir()
        .expect("Could not find config directory")
        .join("tunesync.toml")
}

/// Reads the config file, creating it with defaults on first run.
pub fn load_or_create() -> Config {
    let config_file = config_file_path();

    if !config_file.exists() {
        let default_config = Config::default();
        info!(
            "Config file not found. Creating default config. path={}",
            config_file.display()
        );
        if let Err(err) = std::fs::write(
            &config_file,
            toml::to_string(&default_config).expect("default config serializes"),
        ) {
            log::error!(
                "Failed to write default config to {}: {}",
                config_file.display(),
                err
            );
        }
    }

    let config_content = std::fs::read_to_string(&config_file).unwrap_or_default();
    sanitize_config(toml::from_str::<Config>(&config_content).unwrap_or_default())
}
