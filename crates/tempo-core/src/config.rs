use std::{env, fs, path::Path, time::Duration};

use crate::{
    debounce::DebounceConfig,
    errors::Error,
    reaper::ReaperConfig,
    retry::{RetryPolicy, RetryStrategy},
    worker::WorkerConfig,
    Result,
};

/// Typed configuration for a tempo worker process.
///
/// Every knob is a plain value read from `TEMPO_*` environment variables.
#[derive(Clone, Debug)]
pub struct Config {
    // Wiring
    pub database_url: String,
    pub webhook_url: Option<String>,
    pub worker_id: String,

    // Claim loop
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub preemptive_window: Duration,
    pub execution_timeout: Duration,
    pub store_backoff_max: Duration,

    // Retries
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub retry_backoff: RetryStrategy,
    pub retry_delay_max: Duration,

    // Reaper
    pub stale_after: Duration,
    pub reap_interval: Duration,

    // Debounce
    pub quiet_period: Duration,
    pub max_wait_cap: Option<Duration>,
}

impl Config {
    /// Load from the process environment, seeding it from `.env` if present.
    pub fn load() -> Result<Self> {
        apply_env_file(Path::new(".env"));
        let cfg = Self::from_lookup(|key| env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Build from an arbitrary key lookup (the environment, a map in tests).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).and_then(non_empty);
        let millis = |key: &str, default: u64| -> Result<Duration> {
            match get(key) {
                None => Ok(Duration::from_millis(default)),
                Some(v) => v
                    .trim()
                    .parse::<u64>()
                    .map(Duration::from_millis)
                    .map_err(|_| Error::Config(format!("{key} must be milliseconds, got {v:?}"))),
            }
        };

        let database_url = get("TEMPO_DATABASE_URL").unwrap_or_else(|| "sqlite://tempo.db".to_string());
        let webhook_url = get("TEMPO_WEBHOOK_URL");
        let worker_id = get("TEMPO_WORKER_ID").unwrap_or_else(default_worker_id);

        let poll_interval = millis("TEMPO_POLL_INTERVAL_MS", 1_000)?;
        let batch_size = parse_num::<usize>(get("TEMPO_BATCH_SIZE"), "TEMPO_BATCH_SIZE")?.unwrap_or(10);
        let preemptive_window = millis("TEMPO_PREEMPTIVE_WINDOW_MS", 500)?;
        let execution_timeout = millis("TEMPO_EXECUTION_TIMEOUT_MS", 120_000)?;
        let store_backoff_max = millis("TEMPO_STORE_BACKOFF_MAX_MS", 30_000)?;

        let max_retries = parse_num::<u32>(get("TEMPO_MAX_RETRIES"), "TEMPO_MAX_RETRIES")?.unwrap_or(3);
        let retry_delay = millis("TEMPO_RETRY_DELAY_MS", 5_000)?;
        let retry_backoff = match get("TEMPO_RETRY_BACKOFF") {
            Some(v) => RetryStrategy::parse(&v)?,
            None => RetryStrategy::Fixed,
        };
        let retry_delay_max = millis("TEMPO_RETRY_DELAY_MAX_MS", 300_000)?;

        let stale_after = millis("TEMPO_STALE_AFTER_MS", 300_000)?;
        let reap_interval = millis("TEMPO_REAP_INTERVAL_MS", 60_000)?;

        let quiet_period = millis("TEMPO_QUIET_PERIOD_MS", 3_000)?;
        let max_wait_cap = match get("TEMPO_MAX_WAIT_CAP_MS") {
            None => None,
            Some(_) => Some(millis("TEMPO_MAX_WAIT_CAP_MS", 0)?),
        };

        Ok(Self {
            database_url,
            webhook_url,
            worker_id,
            poll_interval,
            batch_size,
            preemptive_window,
            execution_timeout,
            store_backoff_max,
            max_retries,
            retry_delay,
            retry_backoff,
            retry_delay_max,
            stale_after,
            reap_interval,
            quiet_period,
            max_wait_cap,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("TEMPO_BATCH_SIZE must be > 0".to_string()));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::Config("TEMPO_POLL_INTERVAL_MS must be > 0".to_string()));
        }
        if self.quiet_period.is_zero() {
            return Err(Error::Config("TEMPO_QUIET_PERIOD_MS must be > 0".to_string()));
        }
        // A live execution must never look abandoned to the reaper.
        if self.stale_after <= self.execution_timeout {
            return Err(Error::Config(format!(
                "TEMPO_STALE_AFTER_MS ({}) must exceed TEMPO_EXECUTION_TIMEOUT_MS ({})",
                self.stale_after.as_millis(),
                self.execution_timeout.as_millis()
            )));
        }
        Ok(())
    }

    pub fn worker(&self) -> WorkerConfig {
        WorkerConfig {
            poll_interval: self.poll_interval,
            batch_size: self.batch_size,
            preemptive_window: self.preemptive_window,
            execution_timeout: self.execution_timeout,
            store_backoff_max: self.store_backoff_max,
        }
    }

    pub fn reaper(&self) -> ReaperConfig {
        ReaperConfig {
            stale_after: self.stale_after,
            interval: self.reap_interval,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            retry_delay: self.retry_delay,
            strategy: self.retry_backoff,
            max_delay: self.retry_delay_max,
        }
    }

    pub fn debounce(&self) -> DebounceConfig {
        DebounceConfig {
            quiet_period: self.quiet_period,
            max_wait_cap: self.max_wait_cap,
        }
    }
}

fn parse_num<T: std::str::FromStr>(v: Option<String>, key: &str) -> Result<Option<T>> {
    match v {
        None => Ok(None),
        Some(s) => s
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::Config(format!("{key} must be a number, got {s:?}"))),
    }
}

fn default_worker_id() -> String {
    let host = env::var("HOSTNAME")
        .ok()
        .and_then(non_empty)
        .unwrap_or_else(|| "worker".to_string());
    format!("{host}-{}", std::process::id())
}

/// Export `TEMPO_*` and `RUST_LOG` entries from an env file into the process
/// environment. Variables already set win; a missing file is not an error.
fn apply_env_file(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };
    for (key, value) in env_file_entries(&contents) {
        if env::var_os(&key).is_none() {
            env::set_var(key, value);
        }
    }
}

/// `KEY=value` lines with optional `export`, quoting and trailing comments.
fn env_file_entries(contents: &str) -> Vec<(String, String)> {
    contents
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let line = line.strip_prefix("export ").unwrap_or(line);
            let (key, value) = line.split_once('=')?;
            let key = key.trim();
            if !(key.starts_with("TEMPO_") || key == "RUST_LOG") {
                return None;
            }
            Some((key.to_string(), env_file_value(value.trim())))
        })
        .collect()
}

fn env_file_value(raw: &str) -> String {
    for quote in ['"', '\''] {
        if let Some(inner) = raw.strip_prefix(quote) {
            if let Some(end) = inner.find(quote) {
                return inner[..end].to_string();
            }
        }
    }
    match raw.find(" #") {
        Some(i) => raw[..i].trim_end().to_string(),
        None => raw.to_string(),
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn cfg_from(pairs: &[(&str, &str)]) -> Result<Config> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn env_file_keeps_only_worker_keys() {
        let contents = "\
# local overrides
export TEMPO_DATABASE_URL=\"sqlite://dev.db\"
TEMPO_BATCH_SIZE = 25   # bigger batches
TEMPO_WEBHOOK_URL='http://localhost:9000/hook#frag'
RUST_LOG=debug
HOME=/tmp/elsewhere
not a pair
";
        let entries = env_file_entries(contents);
        assert_eq!(
            entries,
            vec![
                ("TEMPO_DATABASE_URL".to_string(), "sqlite://dev.db".to_string()),
                ("TEMPO_BATCH_SIZE".to_string(), "25".to_string()),
                (
                    "TEMPO_WEBHOOK_URL".to_string(),
                    "http://localhost:9000/hook#frag".to_string()
                ),
                ("RUST_LOG".to_string(), "debug".to_string()),
            ]
        );
    }

    #[test]
    fn env_file_does_not_override_existing_vars() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        fs::write(
            &path,
            "TEMPO_ENV_FILE_TEST_SET=from-file\nTEMPO_ENV_FILE_TEST_UNSET=from-file\n",
        )
        .unwrap();
        env::set_var("TEMPO_ENV_FILE_TEST_SET", "from-env");
        env::remove_var("TEMPO_ENV_FILE_TEST_UNSET");

        apply_env_file(&path);
        apply_env_file(&dir.path().join("missing.env"));

        assert_eq!(env::var("TEMPO_ENV_FILE_TEST_SET").unwrap(), "from-env");
        assert_eq!(env::var("TEMPO_ENV_FILE_TEST_UNSET").unwrap(), "from-file");
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = cfg_from(&[]).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.database_url, "sqlite://tempo.db");
        assert_eq!(cfg.batch_size, 10);
        assert_eq!(cfg.poll_interval, Duration::from_secs(1));
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.max_wait_cap, None);
        assert_eq!(cfg.retry_backoff, RetryStrategy::Fixed);
    }

    #[test]
    fn overrides_are_parsed() {
        let cfg = cfg_from(&[
            ("TEMPO_BATCH_SIZE", "50"),
            ("TEMPO_QUIET_PERIOD_MS", "2500"),
            ("TEMPO_MAX_WAIT_CAP_MS", "10000"),
            ("TEMPO_RETRY_BACKOFF", "exponential"),
            ("TEMPO_WORKER_ID", "w-1"),
        ])
        .unwrap();
        assert_eq!(cfg.batch_size, 50);
        assert_eq!(cfg.worker_id, "w-1");
        assert_eq!(cfg.debounce().quiet_period, Duration::from_millis(2500));
        assert_eq!(cfg.debounce().max_wait_cap, Some(Duration::from_secs(10)));
        assert_eq!(cfg.retry_policy().strategy, RetryStrategy::Exponential);
    }

    #[test]
    fn garbage_numbers_are_config_errors() {
        let err = cfg_from(&[("TEMPO_POLL_INTERVAL_MS", "soon")]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn stale_after_must_exceed_execution_timeout() {
        let cfg = cfg_from(&[
            ("TEMPO_STALE_AFTER_MS", "1000"),
            ("TEMPO_EXECUTION_TIMEOUT_MS", "1000"),
        ])
        .unwrap();
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }
}
