//! In-process configuration, defaults mirroring the original client's
//! `config.h`, merged with CLI overrides.
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("download directory {0:?} could not be created: {1}")]
    DownloadDirUnavailable(PathBuf, std::io::Error),

    #[error("seed ratio limit must be non-negative, got {0}")]
    InvalidSeedRatioLimit(f64),

    #[error("endgame threshold must be at least 1, got {0}")]
    InvalidEndgameThreshold(usize),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_port: u16,
    pub max_peers: usize,
    pub max_connections: usize,

    /// 0 = unlimited.
    pub max_download_speed: u64,
    /// 0 = unlimited.
    pub max_upload_speed: u64,

    pub download_dir: PathBuf,
    pub sequential_download: bool,
    pub piece_timeout: Duration,

    pub seed_after_download: bool,
    /// 0 = unlimited.
    pub seed_ratio_limit: f64,

    pub tracker_announce_interval: Duration,
    pub tracker_timeout: Duration,
    pub tracker_max_retries: u32,

    pub log_level: String,

    pub enable_dht: bool,
    pub dht_port: u16,

    /// Configurable per the spec's recommendation that the hard-coded
    /// endgame threshold become a parameter.
    pub endgame_threshold: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: 6881,
            max_peers: 50,
            max_connections: 100,
            max_download_speed: 0,
            max_upload_speed: 0,
            download_dir: PathBuf::from("./downloads"),
            sequential_download: false,
            piece_timeout: Duration::from_secs(30),
            seed_after_download: true,
            seed_ratio_limit: 2.0,
            tracker_announce_interval: Duration::from_secs(1800),
            tracker_timeout: Duration::from_secs(30),
            tracker_max_retries: 3,
            log_level: "info".to_string(),
            enable_dht: true,
            dht_port: 6881,
            endgame_threshold: 5,
        }
    }
}

impl Config {
    /// Applies CLI overrides on top of the defaults; `None` leaves the
    /// default untouched.
    pub fn merge_cli(mut self, cli: &crate::cli::Cli) -> Self {
        if let Some(dir) = &cli.download_dir {
            self.download_dir = dir.clone();
        }
        if let Some(port) = cli.listen_port {
            self.listen_port = port;
        }
        if let Some(rate) = cli.max_download_rate {
            self.max_download_speed = rate;
        }
        if let Some(rate) = cli.max_upload_rate {
            self.max_upload_speed = rate;
        }
        if let Some(level) = &cli.log_level {
            self.log_level = level.clone();
        }
        if cli.sequential {
            self.sequential_download = true;
        }
        if cli.no_dht {
            self.enable_dht = false;
        }
        self
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.seed_ratio_limit < 0.0 {
            return Err(ConfigError::InvalidSeedRatioLimit(self.seed_ratio_limit));
        }
        if self.endgame_threshold == 0 {
            return Err(ConfigError::InvalidEndgameThreshold(self.endgame_threshold));
        }
        std::fs::create_dir_all(&self.download_dir)
            .map_err(|e| ConfigError::DownloadDirUnavailable(self.download_dir.clone(), e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_baseline() {
        let config = Config::default();
        assert_eq!(config.listen_port, 6881);
        assert_eq!(config.max_peers, 50);
        assert_eq!(config.endgame_threshold, 5);
        assert_eq!(config.tracker_announce_interval, Duration::from_secs(1800));
    }

    #[test]
    fn rejects_negative_seed_ratio() {
        let mut config = Config { download_dir: std::env::temp_dir(), ..Config::default() };
        config.seed_ratio_limit = -1.0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidSeedRatioLimit(_))));
    }

    #[test]
    fn rejects_zero_endgame_threshold() {
        let mut config = Config { download_dir: std::env::temp_dir(), ..Config::default() };
        config.endgame_threshold = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidEndgameThreshold(_))));
    }
}
