use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub metadata: MetadataConfig,
    pub vector: VectorConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub documents: DocumentsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MetadataConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VectorConfig {
    pub path: PathBuf,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    #[serde(default = "default_container_prefix")]
    pub container_prefix: String,
}

fn default_dims() -> usize {
    1536
}
fn default_rpc_timeout_ms() -> u64 {
    10_000
}
fn default_container_prefix() -> String {
    "collection_".to_string()
}

impl VectorConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReconcileConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_collection_scan_limit")]
    pub collection_scan_limit: usize,
    #[serde(default = "default_chunk_scan_limit")]
    pub chunk_scan_limit: usize,
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            batch_size: default_batch_size(),
            collection_scan_limit: default_collection_scan_limit(),
            chunk_scan_limit: default_chunk_scan_limit(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

fn default_interval_secs() -> u64 {
    60
}
fn default_batch_size() -> usize {
    100
}
fn default_collection_scan_limit() -> usize {
    100
}
fn default_chunk_scan_limit() -> usize {
    1000
}
fn default_stale_after_secs() -> u64 {
    600
}

#[derive(Debug, Deserialize, Clone)]
pub struct DocumentsConfig {
    #[serde(default = "default_max_processing_retries")]
    pub max_processing_retries: u32,
}

impl Default for DocumentsConfig {
    fn default() -> Self {
        Self {
            max_processing_retries: default_max_processing_retries(),
        }
    }
}

fn default_max_processing_retries() -> u32 {
    3
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.metadata.path == config.vector.path {
        anyhow::bail!("metadata.path and vector.path must point to different files");
    }

    // Validate vector
    if config.vector.dims == 0 {
        anyhow::bail!("vector.dims must be > 0");
    }
    if config.vector.rpc_timeout_ms == 0 {
        anyhow::bail!("vector.rpc_timeout_ms must be > 0");
    }
    let prefix = &config.vector.container_prefix;
    if prefix.is_empty() || !prefix.chars().next().is_some_and(|c| c.is_ascii_alphabetic()) {
        anyhow::bail!("vector.container_prefix must start with a letter");
    }
    if !prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        anyhow::bail!("vector.container_prefix may only contain letters, digits, and underscores");
    }

    // Validate reconcile
    if config.reconcile.batch_size == 0 {
        anyhow::bail!("reconcile.batch_size must be > 0");
    }
    if config.reconcile.interval_secs == 0 {
        anyhow::bail!("reconcile.interval_secs must be > 0");
    }
    if config.reconcile.collection_scan_limit == 0 || config.reconcile.chunk_scan_limit == 0 {
        anyhow::bail!("reconcile scan limits must be > 0");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    const MINIMAL: &str = r#"
[metadata]
path = "./data/metadata.sqlite"

[vector]
path = "./data/vectors.sqlite"
"#;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let file = write_config(MINIMAL);
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.vector.dims, 1536);
        assert_eq!(config.vector.rpc_timeout(), Duration::from_secs(10));
        assert_eq!(config.vector.container_prefix, "collection_");
        assert_eq!(config.reconcile.batch_size, 100);
        assert_eq!(config.reconcile.stale_after_secs, 600);
        assert_eq!(config.reconcile.chunk_scan_limit, 1000);
        assert_eq!(config.documents.max_processing_retries, 3);
    }

    #[test]
    fn test_rejects_zero_batch_size() {
        let file = write_config(&format!("{}\n[reconcile]\nbatch_size = 0\n", MINIMAL));
        let err = load_config(file.path()).unwrap_err();
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    fn test_rejects_shared_database_file() {
        let file = write_config(
            r#"
[metadata]
path = "./data/one.sqlite"

[vector]
path = "./data/one.sqlite"
"#,
        );
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn test_rejects_bad_container_prefix() {
        let body = MINIMAL.replace(
            "path = \"./data/vectors.sqlite\"",
            "path = \"./data/vectors.sqlite\"\ncontainer_prefix = \"9-bad\"",
        );
        let file = write_config(&body);
        let err = load_config(file.path()).unwrap_err();
        assert!(err.to_string().contains("container_prefix"));
    }

    #[test]
    fn test_missing_file_names_path() {
        let err = load_config(Path::new("/nonexistent/csync.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/csync.toml"));
    }
}
