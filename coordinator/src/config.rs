use std::env;
use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

pub const DEFAULT_SPLIT_SIZE: u64 = 64 * 1024 * 1024;
pub const DEFAULT_MAX_DISPATCHES: usize = 64;

/// Coordinator settings, read once in `main` and passed down.
#[derive(Debug, Clone)]
pub struct Config {
    pub dev_mode: bool,
    pub listen_addr: String,
    pub artifacts_path: PathBuf,
    pub split_size: u64,
    pub worker_ns: String,
    pub worker_img: String,
    /// Shared volume where mappers leave their partitions.
    pub intermediate_files_loc: String,
    pub max_dispatches: usize,
    pub task_deadline: Option<Duration>,
}

impl Config {
    pub fn from_env(dev_mode: bool) -> Self {
        Self::from_lookup(dev_mode, |k| env::var(k).ok())
    }

    pub fn from_lookup(dev_mode: bool, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let artifacts_path = lookup("ARTIFACTS_PATH").unwrap_or_else(|| "/coordinator/artifacts".to_string());
        let intermediate = lookup("INT_FILES_LOC").unwrap_or_else(|| "/mapreduce/intermediate-files".to_string());

        Self {
            dev_mode,
            listen_addr: lookup("LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0:4750".to_string()),
            artifacts_path: PathBuf::from(artifacts_path.trim_end_matches('/')),
            split_size: parse_or(&lookup, "SPLIT_SIZE", DEFAULT_SPLIT_SIZE),
            worker_ns: lookup("WORKER_NS").unwrap_or_else(|| "mapreduce-workers".to_string()),
            worker_img: lookup("WORKER_IMG").unwrap_or_else(|| "localhost:5000/worker:latest".to_string()),
            intermediate_files_loc: intermediate.trim_end_matches('/').to_string(),
            max_dispatches: parse_or(&lookup, "MAX_DISPATCHES", DEFAULT_MAX_DISPATCHES).max(1),
            task_deadline: lookup("TASK_DEADLINE_SECS")
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
        }
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: std::str::FromStr + std::fmt::Display + Copy,
{
    match lookup(key) {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("can't read {} from {:?}, defaulting to {}", key, raw, default);
            default
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_with(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(false, |k| vars.get(k).cloned())
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let c = config_with(&[]);
        assert_eq!(c.split_size, 67_108_864);
        assert_eq!(c.listen_addr, "0.0.0.0:4750");
        assert_eq!(c.max_dispatches, 64);
        assert!(c.task_deadline.is_none());
        assert!(!c.dev_mode);
    }

    #[test]
    fn trailing_slashes_are_trimmed() {
        let c = config_with(&[("ARTIFACTS_PATH", "/tmp/art/"), ("INT_FILES_LOC", "/shared/")]);
        assert_eq!(c.artifacts_path, PathBuf::from("/tmp/art"));
        assert_eq!(c.intermediate_files_loc, "/shared");
    }

    #[test]
    fn unparsable_numbers_fall_back_to_defaults() {
        let c = config_with(&[("SPLIT_SIZE", "lots"), ("TASK_DEADLINE_SECS", "30"), ("MAX_DISPATCHES", "0")]);
        assert_eq!(c.split_size, DEFAULT_SPLIT_SIZE);
        assert_eq!(c.task_deadline, Some(Duration::from_secs(30)));
        assert_eq!(c.max_dispatches, 1);
    }
}
