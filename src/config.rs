use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;

#[derive(Parser)]
#[command(name = "codexec", version = "1.0", about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(long = "config", short = 'c')]
    pub config_path: Option<String>,

    /// Path to the template database (defaults to the local data directory)
    #[arg(long = "database", short = 'd')]
    pub database_path: Option<PathBuf>,
}

impl CliArgs {
    /// Load the configuration from the specified file, or the defaults if none was given
    pub fn to_config(&self) -> anyhow::Result<Config> {
        let Some(path) = &self.config_path else {
            return Ok(Config::default());
        };

        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open configuration file {path}"))?;
        let reader = std::io::BufReader::new(file);
        serde_json::from_reader(reader)
            .with_context(|| format!("Failed to parse configuration file {path}"))
    }
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub executor: ExecutorConfig,
    /// Per-language sandbox image overrides, keyed by language id
    pub images: HashMap<String, String>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: Option<String>,
    pub bind_port: Option<u16>,
    pub max_concurrent_executions: Option<usize>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ExecutorConfig {
    pub run_timeout_ms: MilliSecond,
    pub compile_timeout_ms: MilliSecond,
    pub memory_limit: ByteSize,
    pub memory_swap_limit: ByteSize,
    pub nano_cpus: i64,
    pub cpu_shares: i64,
    pub pids_limit: i64,
    pub tmpfs_size: String,
    pub user: Option<String>,
    pub max_output_bytes: usize,
    /// Return whatever was captured before a timeout instead of discarding it
    pub keep_partial_output: bool,
    pub workspace_root: PathBuf,
    pub pull_images: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            run_timeout_ms: MilliSecond(8_000),
            compile_timeout_ms: MilliSecond(30_000),
            memory_limit: ByteSize(1536 * 1024 * 1024),
            memory_swap_limit: ByteSize(2048 * 1024 * 1024),
            nano_cpus: 1_000_000_000,
            cpu_shares: 512,
            pids_limit: 64,
            tmpfs_size: "64m".to_string(),
            user: Some("65534:65534".to_string()),
            max_output_bytes: 1024 * 1024,
            keep_partial_output: false,
            workspace_root: std::env::temp_dir().join("codexec"),
            pull_images: true,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MilliSecond(pub u64);

impl From<MilliSecond> for Duration {
    fn from(value: MilliSecond) -> Self {
        Duration::from_millis(value.0)
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteSize(pub u64);

impl ByteSize {
    /// Docker expresses memory limits as signed byte counts
    pub fn as_docker(self) -> i64 {
        i64::try_from(self.0).unwrap_or(i64::MAX)
    }
}
