use anyhow::{Context, Result};
use clap::Parser;
use lib_quotecache::EngineConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

const DEFAULT_CONFIG_FILE: &str = "server_quote_cache.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Session-adaptive quote cache with live tick batching", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "QUOTECACHE_PORT", help = "Port for the admin HTTP surface.")]
    pub port: Option<u16>,

    #[clap(long, env = "QUOTECACHE_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "QUOTECACHE_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "QUOTECACHE_LOG_LEVEL", help = "Logging level or filter directive (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "QUOTECACHE_LOG_RETENTION", help = "Number of daily log files to keep.")]
    pub log_retention: Option<usize>,

    #[clap(long, env = "QUOTECACHE_REDIS_URL", help = "Redis URL; the in-process backend is used when absent.")]
    pub redis_url: Option<String>,

    #[clap(long, env = "QUOTECACHE_REDIS_PREFIX", help = "Key prefix for entries stored in Redis.")]
    pub redis_prefix: Option<String>,

    #[clap(long, env = "QUOTECACHE_SEED", help = "Seed for the synthetic quote source and tick feed.")]
    pub seed: Option<u64>,

    #[clap(long, env = "QUOTECACHE_TICK_INSTRUMENTS", help = "Number of instrument tokens the synthetic feed ticks.")]
    pub tick_instruments: Option<u32>,

    #[clap(long, env = "QUOTECACHE_TICK_RATE_HZ", help = "Synthetic ticks per second.")]
    pub tick_rate_hz: Option<u32>,

    #[clap(long, env = "QUOTECACHE_BATCH_INTERVAL_MS", help = "Tick batch flush interval in milliseconds.")]
    pub batch_interval_ms: Option<u64>,

    #[clap(long, env = "QUOTECACHE_MAX_BATCH_SIZE", help = "Maximum ticks per delivered batch.")]
    pub max_batch_size: Option<usize>,

    #[clap(long, env = "QUOTECACHE_FETCH_TIMEOUT_MS", help = "Upper bound on every upstream fetch in milliseconds.")]
    pub fetch_timeout_ms: Option<u64>,

    /// Engine settings; only read from the config file.
    #[clap(skip)]
    pub engine: Option<EngineConfig>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            log_retention: other.log_retention.or(self.log_retention),
            redis_url: other.redis_url.or(self.redis_url),
            redis_prefix: other.redis_prefix.or(self.redis_prefix),
            seed: other.seed.or(self.seed),
            tick_instruments: other.tick_instruments.or(self.tick_instruments),
            tick_rate_hz: other.tick_rate_hz.or(self.tick_rate_hz),
            batch_interval_ms: other.batch_interval_ms.or(self.batch_interval_ms),
            max_batch_size: other.max_batch_size.or(self.max_batch_size),
            fetch_timeout_ms: other.fetch_timeout_ms.or(self.fetch_timeout_ms),
            engine: other.engine.or(self.engine),
        }
    }

    fn defaults() -> Config {
        Config {
            port: Some(9010),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            log_retention: Some(7),
            redis_prefix: Some("quotecache".to_string()),
            seed: Some(42),
            tick_instruments: Some(200),
            tick_rate_hz: Some(2_000),
            ..Default::default()
        }
    }

    /// Engine config from the file, with the CLI/env knobs applied on top.
    pub fn engine_config(&self) -> EngineConfig {
        let mut engine = self.engine.clone().unwrap_or_default();
        if let Some(v) = self.batch_interval_ms {
            engine.batch_interval_ms = v;
        }
        if let Some(v) = self.max_batch_size {
            engine.max_batch_size = v;
        }
        if let Some(v) = self.fetch_timeout_ms {
            engine.fetch_timeout_ms = v;
        }
        engine
    }
}

/// Defaults, then the JSON file, then environment variables and CLI flags.
pub fn load_config() -> Result<Config> {
    load_from(Config::parse())
}

fn load_from(cli: Config) -> Result<Config> {
    let mut current = Config::defaults();

    let path = cli.config_path.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    if path.exists() {
        let raw = fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        let file_config: Config =
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        current = current.merge(file_config);
        current.config_path = Some(path);
    }

    current = current.merge(cli);
    current.engine_config().validate()?;
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn cli_overrides_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"port": 9100, "logLevel": "debug", "engine": {{"batchIntervalMs": 250, "maxBatchSize": 64}}}}"#
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let cli = Config::try_parse_from(["server_quote_cache", "--config-path", &path, "--port", "9200"]).unwrap();
        let config = load_from(cli).unwrap();

        assert_eq!(config.port, Some(9200));
        assert_eq!(config.log_level.as_deref(), Some("debug"));
        assert_eq!(config.log_retention, Some(7));
        let engine = config.engine_config();
        assert_eq!(engine.batch_interval_ms, 250);
        assert_eq!(engine.max_batch_size, 64);
    }

    #[test]
    fn engine_knobs_from_cli_win() {
        let cli = Config::try_parse_from([
            "server_quote_cache",
            "--config-path",
            "/nonexistent/quotecache.conf",
            "--batch-interval-ms",
            "50",
        ])
        .unwrap();
        let config = load_from(cli).unwrap();
        assert_eq!(config.engine_config().batch_interval_ms, 50);
        assert_eq!(config.engine_config().max_batch_size, 5_000);
    }

    #[test]
    fn invalid_engine_settings_fail_startup() {
        let cli = Config::try_parse_from([
            "server_quote_cache",
            "--config-path",
            "/nonexistent/quotecache.conf",
            "--max-batch-size",
            "0",
        ])
        .unwrap();
        assert!(load_from(cli).is_err());
    }
}
