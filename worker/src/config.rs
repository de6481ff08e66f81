use std::env;
use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

pub const DEFAULT_MAX_SUBPROCESSES: usize = 50;
pub const DEFAULT_OUTPUT_BUCKET: &str = "reducers";

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    /// Directory holding the engine and per-group IPC sockets.
    pub socket_dir: PathBuf,
    /// Where received programs are written before being run.
    pub program_dir: PathBuf,
    /// Shared volume mapper partitions are written to.
    pub mappers_dir: String,
    /// Cap on concurrently running program invocations, and on reduce
    /// result consumers.
    pub max_subprocesses: usize,
    /// Base of the linear backoff used to reach a reduce program's input
    /// socket.
    pub ipc_retry_base: Duration,
    /// How long the engine keeps accepting results once every program
    /// invocation has exited.
    pub result_grace: Duration,
    /// Bucket for reduce output when the output location names none.
    pub output_bucket: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| env::var(k).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let max_subprocesses = match lookup("MAX_SUBPROCESSES").map(|v| v.parse::<usize>()) {
            None => DEFAULT_MAX_SUBPROCESSES,
            Some(Ok(n)) if n > 0 => n,
            Some(_) => {
                warn!("MAX_SUBPROCESSES must be a positive integer, using {}", DEFAULT_MAX_SUBPROCESSES);
                DEFAULT_MAX_SUBPROCESSES
            }
        };
        let ipc_retry_base = secs_or(&lookup, "IPC_RETRY_BASE_SECS", 5);
        let result_grace = secs_or(&lookup, "RESULT_GRACE_SECS", 5);
        let mappers_dir = lookup("MAPPERS_DIR").unwrap_or_else(|| "/mappers".to_string());

        Self {
            listen_addr: lookup("WORKER_ADDR").unwrap_or_else(|| "0.0.0.0:8090".to_string()),
            socket_dir: lookup("SOCKET_DIR").unwrap_or_else(|| "/tmp".to_string()).into(),
            program_dir: lookup("PROGRAM_DIR")
                .unwrap_or_else(|| "/mapreduce/programs".to_string())
                .into(),
            mappers_dir: mappers_dir.trim_end_matches('/').to_string(),
            max_subprocesses,
            ipc_retry_base,
            result_grace,
            output_bucket: lookup("OUTPUT_BUCKET").unwrap_or_else(|| DEFAULT_OUTPUT_BUCKET.to_string()),
        }
    }
}

fn secs_or(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> Duration {
    match lookup(key).map(|v| v.parse::<u64>()) {
        None => Duration::from_secs(default),
        Some(Ok(secs)) => Duration::from_secs(secs),
        Some(Err(_)) => {
            warn!("can't read {}, using {}s", key, default);
            Duration::from_secs(default)
        }
    }
}
