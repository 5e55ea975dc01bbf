//! Process configuration, read from `OPENSHELF_*` environment variables.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::EngineSettings;
use crate::model::Ms;

pub const DATA_DIR: &str = "OPENSHELF_DATA_DIR";
pub const HOLD_TTL_SECS: &str = "OPENSHELF_HOLD_TTL_SECS";
pub const SWEEP_INTERVAL_SECS: &str = "OPENSHELF_SWEEP_INTERVAL_SECS";
pub const OP_TIMEOUT_MS: &str = "OPENSHELF_OP_TIMEOUT_MS";
pub const METRICS_PORT: &str = "OPENSHELF_METRICS_PORT";
pub const SEED: &str = "OPENSHELF_SEED";

const WAL_FILE: &str = "library.wal";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub hold_ttl: Duration,
    pub sweep_interval: Duration,
    pub op_timeout: Duration,
    pub metrics_port: Option<u16>,
    /// JSON seed imported into an empty library at startup.
    pub seed_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            hold_ttl: Duration::from_secs(24 * 3600),
            sweep_interval: Duration::from_secs(3600),
            op_timeout: Duration::from_millis(5_000),
            metrics_port: None,
            seed_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Invalid { var: &'static str, value: String },
    Zero(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Invalid { var, value } => write!(f, "{var}: cannot parse {value:?}"),
            ConfigError::Zero(var) => write!(f, "{var} must be greater than zero"),
        }
    }
}

impl std::error::Error for ConfigError {}

fn parse<T: FromStr>(var: &'static str, raw: Option<String>) -> Result<Option<T>, ConfigError> {
    let Some(raw) = raw else { return Ok(None) };
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|_| ConfigError::Invalid { var, value: raw })
}

fn nonzero(var: &'static str, value: Option<u64>) -> Result<Option<u64>, ConfigError> {
    match value {
        Some(0) => Err(ConfigError::Zero(var)),
        other => Ok(other),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source. Unset or empty variables keep their
    /// defaults; set but malformed ones are an error rather than ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(dir) = get(DATA_DIR) {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(secs) = nonzero(HOLD_TTL_SECS, parse(HOLD_TTL_SECS, get(HOLD_TTL_SECS))?)? {
            config.hold_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = nonzero(SWEEP_INTERVAL_SECS, parse(SWEEP_INTERVAL_SECS, get(SWEEP_INTERVAL_SECS))?)? {
            config.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(ms) = nonzero(OP_TIMEOUT_MS, parse(OP_TIMEOUT_MS, get(OP_TIMEOUT_MS))?)? {
            config.op_timeout = Duration::from_millis(ms);
        }
        config.metrics_port = parse(METRICS_PORT, get(METRICS_PORT))?;
        config.seed_path = get(SEED).map(PathBuf::from);
        Ok(config)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join(WAL_FILE)
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            hold_ttl_ms: self.hold_ttl.as_millis().min(Ms::MAX as u128) as Ms,
            op_timeout: self.op_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k: &str| map.get(k).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.wal_path(), PathBuf::from("./data/library.wal"));
        assert_eq!(config.engine_settings(), EngineSettings::default());
    }

    #[test]
    fn reads_every_variable() {
        let config = Config::from_lookup(lookup(&[
            (DATA_DIR, "/var/lib/openshelf"),
            (HOLD_TTL_SECS, "60"),
            (SWEEP_INTERVAL_SECS, "5"),
            (OP_TIMEOUT_MS, "250"),
            (METRICS_PORT, "9100"),
            (SEED, "seed.json"),
        ]))
        .unwrap();
        assert_eq!(config.wal_path(), PathBuf::from("/var/lib/openshelf/library.wal"));
        assert_eq!(config.hold_ttl, Duration::from_secs(60));
        assert_eq!(config.sweep_interval, Duration::from_secs(5));
        assert_eq!(config.metrics_port, Some(9100));
        assert_eq!(config.seed_path, Some(PathBuf::from("seed.json")));

        let settings = config.engine_settings();
        assert_eq!(settings.hold_ttl_ms, 60_000);
        assert_eq!(settings.op_timeout, Duration::from_millis(250));
    }

    #[test]
    fn empty_value_keeps_default() {
        let config = Config::from_lookup(lookup(&[(HOLD_TTL_SECS, "  "), (SEED, "")])).unwrap();
        assert_eq!(config.hold_ttl, Duration::from_secs(24 * 3600));
        assert_eq!(config.seed_path, None);
    }

    #[test]
    fn malformed_value_is_an_error() {
        let err = Config::from_lookup(lookup(&[(METRICS_PORT, "http")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                var: METRICS_PORT,
                value: "http".into()
            }
        );
        assert!(Config::from_lookup(lookup(&[(HOLD_TTL_SECS, "-1")])).is_err());
    }

    #[test]
    fn zero_durations_are_rejected() {
        let err = Config::from_lookup(lookup(&[(SWEEP_INTERVAL_SECS, "0")])).unwrap_err();
        assert_eq!(err, ConfigError::Zero(SWEEP_INTERVAL_SECS));
        assert_eq!(err.to_string(), "OPENSHELF_SWEEP_INTERVAL_SECS must be greater than zero");
    }
}
