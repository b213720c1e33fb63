//! Configuration: CLI flags (`clap`) merged with an optional TOML file
//! (`serde`/`toml`), flag-wins-only-when-explicitly-set.

use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

#[derive(Parser, Debug, Clone)]
#[command(name = "gcsfuse", about = "Mount a remote object store as a local file tree")]
pub struct Cli {
    /// Bucket to mount.
    #[arg(long)]
    pub bucket: Option<String>,

    /// Local mount point.
    #[arg(long)]
    pub mount_point: Option<PathBuf>,

    /// Base URL of the object store's HTTP API.
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Optional TOML config file; CLI flags win only where explicitly set.
    #[arg(long)]
    pub config_file: Option<PathBuf>,

    #[arg(long)]
    pub implicit_dirs: bool,

    #[arg(long)]
    pub enable_streaming_writes: bool,

    #[arg(long)]
    pub ignore_interrupts: bool,

    #[arg(long)]
    pub write_block_size_mb: Option<u64>,

    #[arg(long)]
    pub write_max_blocks_per_file: Option<usize>,

    #[arg(long)]
    pub metadata_cache_ttl_secs: Option<i64>,

    #[arg(long)]
    pub metadata_cache_capacity: Option<usize>,

    #[arg(long)]
    pub type_cache_ttl_secs: Option<i64>,

    #[arg(long)]
    pub type_cache_capacity_per_parent: Option<usize>,

    #[arg(long)]
    pub file_cache_dir: Option<PathBuf>,

    #[arg(long)]
    pub file_cache_capacity_mb: Option<u64>,

    #[arg(long)]
    pub sequential_read_chunk_mb: Option<u64>,

    #[arg(long)]
    pub cache_for_range_reads: bool,

    #[arg(long)]
    pub enable_o_direct: bool,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct FileConfig {
    pub bucket: Option<String>,
    pub mount_point: Option<PathBuf>,
    pub endpoint: Option<String>,
    pub implicit_dirs: Option<bool>,
    pub enable_streaming_writes: Option<bool>,
    pub ignore_interrupts: Option<bool>,
    pub write_block_size_mb: Option<u64>,
    pub write_max_blocks_per_file: Option<usize>,
    pub metadata_cache_ttl_secs: Option<i64>,
    pub metadata_cache_capacity: Option<usize>,
    pub type_cache_ttl_secs: Option<i64>,
    pub type_cache_capacity_per_parent: Option<usize>,
    pub file_cache_dir: Option<PathBuf>,
    pub file_cache_capacity_mb: Option<u64>,
    pub sequential_read_chunk_mb: Option<u64>,
    pub cache_for_range_reads: Option<bool>,
    pub enable_o_direct: Option<bool>,
}

/// Fully-merged, fully-defaulted configuration the rest of the crate
/// consumes.
#[derive(Debug, Clone)]
pub struct Config {
    pub bucket: String,
    pub mount_point: PathBuf,
    pub endpoint: String,
    pub implicit_dirs: bool,
    pub enable_streaming_writes: bool,
    pub ignore_interrupts: bool,
    pub write_block_size_mb: u64,
    pub write_max_blocks_per_file: usize,
    pub metadata_cache_ttl_secs: i64,
    pub metadata_cache_capacity: usize,
    pub type_cache_ttl_secs: i64,
    pub type_cache_capacity_per_parent: usize,
    pub file_cache_dir: PathBuf,
    pub file_cache_capacity_mb: u64,
    pub sequential_read_chunk_mb: u64,
    pub cache_for_range_reads: bool,
    pub enable_o_direct: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            mount_point: PathBuf::new(),
            endpoint: "http://127.0.0.1:9000".to_string(),
            implicit_dirs: false,
            enable_streaming_writes: true,
            ignore_interrupts: false,
            write_block_size_mb: 1,
            write_max_blocks_per_file: 4,
            metadata_cache_ttl_secs: 60,
            metadata_cache_capacity: 4096,
            type_cache_ttl_secs: 60,
            type_cache_capacity_per_parent: 256,
            file_cache_dir: std::env::temp_dir().join("gcsfuse-cache"),
            file_cache_capacity_mb: 1024,
            sequential_read_chunk_mb: 8,
            cache_for_range_reads: true,
            enable_o_direct: false,
        }
    }
}

/// Loads the optional TOML file named by `--config-file`, then merges
/// CLI flags on top. A bool flag counts as "explicitly set" only when
/// true, matching `clap`'s `ArgAction::SetTrue` semantics for a flag
/// that has no corresponding "unset" spelling; numeric/string flags
/// use `Option` so presence is unambiguous.
pub fn load(cli: Cli) -> std::io::Result<Config> {
    let file_config = match &cli.config_file {
        Some(path) => {
            let text = std::fs::read_to_string(path)?;
            toml::from_str(&text).unwrap_or_else(|e| {
                tracing::warn!(error = %e, path = %path.display(), "failed to parse config file, using defaults for its keys");
                FileConfig::default()
            })
        }
        None => FileConfig::default(),
    };

    let defaults = Config::default();
    Ok(Config {
        bucket: cli.bucket.or(file_config.bucket).unwrap_or(defaults.bucket),
        mount_point: cli.mount_point.or(file_config.mount_point).unwrap_or(defaults.mount_point),
        endpoint: cli.endpoint.or(file_config.endpoint).unwrap_or(defaults.endpoint),
        implicit_dirs: cli.implicit_dirs || file_config.implicit_dirs.unwrap_or(defaults.implicit_dirs),
        enable_streaming_writes: cli.enable_streaming_writes
            || file_config.enable_streaming_writes.unwrap_or(defaults.enable_streaming_writes),
        ignore_interrupts: cli.ignore_interrupts || file_config.ignore_interrupts.unwrap_or(defaults.ignore_interrupts),
        write_block_size_mb: cli
            .write_block_size_mb
            .or(file_config.write_block_size_mb)
            .unwrap_or(defaults.write_block_size_mb),
        write_max_blocks_per_file: cli
            .write_max_blocks_per_file
            .or(file_config.write_max_blocks_per_file)
            .unwrap_or(defaults.write_max_blocks_per_file),
        metadata_cache_ttl_secs: cli
            .metadata_cache_ttl_secs
            .or(file_config.metadata_cache_ttl_secs)
            .unwrap_or(defaults.metadata_cache_ttl_secs),
        metadata_cache_capacity: cli
            .metadata_cache_capacity
            .or(file_config.metadata_cache_capacity)
            .unwrap_or(defaults.metadata_cache_capacity),
        type_cache_ttl_secs: cli
            .type_cache_ttl_secs
            .or(file_config.type_cache_ttl_secs)
            .unwrap_or(defaults.type_cache_ttl_secs),
        type_cache_capacity_per_parent: cli
            .type_cache_capacity_per_parent
            .or(file_config.type_cache_capacity_per_parent)
            .unwrap_or(defaults.type_cache_capacity_per_parent),
        file_cache_dir: cli.file_cache_dir.or(file_config.file_cache_dir).unwrap_or(defaults.file_cache_dir),
        file_cache_capacity_mb: cli
            .file_cache_capacity_mb
            .or(file_config.file_cache_capacity_mb)
            .unwrap_or(defaults.file_cache_capacity_mb),
        sequential_read_chunk_mb: cli
            .sequential_read_chunk_mb
            .or(file_config.sequential_read_chunk_mb)
            .unwrap_or(defaults.sequential_read_chunk_mb),
        cache_for_range_reads: cli.cache_for_range_reads
            || file_config.cache_for_range_reads.unwrap_or(defaults.cache_for_range_reads),
        enable_o_direct: cli.enable_o_direct || file_config.enable_o_direct.unwrap_or(defaults.enable_o_direct),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_flag_wins_over_file_default_only_when_set() {
        let cli = Cli {
            bucket: Some("explicit-bucket".to_string()),
            mount_point: None,
            endpoint: None,
            config_file: None,
            implicit_dirs: false,
            enable_streaming_writes: false,
            ignore_interrupts: false,
            write_block_size_mb: None,
            write_max_blocks_per_file: None,
            metadata_cache_ttl_secs: None,
            metadata_cache_capacity: None,
            type_cache_ttl_secs: None,
            type_cache_capacity_per_parent: None,
            file_cache_dir: None,
            file_cache_capacity_mb: None,
            sequential_read_chunk_mb: None,
            cache_for_range_reads: false,
            enable_o_direct: false,
        };
        let config = load(cli).unwrap();
        assert_eq!(config.bucket, "explicit-bucket");
        assert_eq!(config.write_block_size_mb, Config::default().write_block_size_mb);
    }

    fn empty_cli() -> Cli {
        Cli {
            bucket: None,
            mount_point: None,
            endpoint: None,
            config_file: None,
            implicit_dirs: false,
            enable_streaming_writes: false,
            ignore_interrupts: false,
            write_block_size_mb: None,
            write_max_blocks_per_file: None,
            metadata_cache_ttl_secs: None,
            metadata_cache_capacity: None,
            type_cache_ttl_secs: None,
            type_cache_capacity_per_parent: None,
            file_cache_dir: None,
            file_cache_capacity_mb: None,
            sequential_read_chunk_mb: None,
            cache_for_range_reads: false,
            enable_o_direct: false,
        }
    }

    #[test]
    fn file_config_fills_in_when_flag_is_unset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gcsfuse.toml");
        std::fs::write(&path, "bucket = \"from-file\"\nwrite_block_size_mb = 4\n").unwrap();

        let mut cli = empty_cli();
        cli.config_file = Some(path);
        let config = load(cli).unwrap();
        assert_eq!(config.bucket, "from-file");
        assert_eq!(config.write_block_size_mb, 4);
    }

    #[test]
    fn unparseable_config_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gcsfuse.toml");
        std::fs::write(&path, "not valid toml {{{").unwrap();

        let mut cli = empty_cli();
        cli.config_file = Some(path);
        let config = load(cli).unwrap();
        assert_eq!(config.bucket, Config::default().bucket);
    }

    #[test]
    fn bool_flag_only_wins_when_true() {
        let mut cli = empty_cli();
        cli.enable_streaming_writes = false;
        let config = load(cli).unwrap();
        assert!(config.enable_streaming_writes, "default is true and the flag never unsets it");
    }
}
