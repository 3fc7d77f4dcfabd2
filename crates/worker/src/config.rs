//! Worker configuration loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use tabsyn_core::capacity::CapacityConfig;
use tabsyn_core::job::Tier;
use tabsyn_core::retry::RetryPolicy;
use tabsyn_pipeline::runner::RunnerConfig;

/// Worker process configuration.
///
/// All fields have defaults suitable for local development; override via
/// environment variables in production.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Max concurrently Running CPU-tier jobs (default: `2`).
    pub cpu_limit: usize,
    /// Max concurrently Running GPU-tier jobs (default: `1`).
    pub gpu_limit: usize,
    /// Worker loops per tier. Defaults to the tier's limit.
    pub workers_per_tier: Option<usize>,
    /// Enforce one active job per owner (default: `true`).
    pub single_active: bool,
    /// Queue poll fallback interval (default: `1000` ms).
    pub poll_interval: Duration,
    /// How often a running job's cancel flag is checked (default: `500` ms).
    pub cancel_poll_interval: Duration,
    /// Wall-clock limit for one pipeline run (default: `14400` s).
    pub pipeline_timeout: Duration,
    /// Grace between SIGTERM and SIGKILL (default: `10` s).
    pub kill_grace: Duration,
    /// Transient-failure retry backoff.
    pub retry: RetryPolicy,
    /// Pipeline interpreter (default: `python3`).
    pub python_bin: PathBuf,
    /// Pipeline entry point (default: `src/scripts/run_pipeline.py`).
    pub script_path: PathBuf,
    /// Working directory for pipeline runs (default: `.`).
    pub working_dir: PathBuf,
    /// Pipeline data root (default: `{working_dir}/src/data`).
    pub data_root: PathBuf,
    /// `CUDA_VISIBLE_DEVICES` for GPU-tier runs (default: `0`).
    pub gpu_devices: String,
    /// Webhook URL for terminal notifications (default: unset).
    pub webhook_url: Option<String>,
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                        | Default                      |
    /// |--------------------------------|------------------------------|
    /// | `TABSYN_CPU_LIMIT`             | `2`                          |
    /// | `TABSYN_GPU_LIMIT`             | `1`                          |
    /// | `TABSYN_WORKERS_PER_TIER`      | tier limit                   |
    /// | `TABSYN_SINGLE_ACTIVE`         | `true`                       |
    /// | `TABSYN_POLL_INTERVAL_MS`      | `1000`                       |
    /// | `TABSYN_CANCEL_POLL_MS`        | `500`                        |
    /// | `TABSYN_PIPELINE_TIMEOUT_SECS` | `14400`                      |
    /// | `TABSYN_KILL_GRACE_SECS`       | `10`                         |
    /// | `TABSYN_RETRY_BASE_SECS`       | `60`                         |
    /// | `TABSYN_RETRY_MAX_SECS`        | `900`                        |
    /// | `TABSYN_PYTHON_BIN`            | `python3`                    |
    /// | `TABSYN_PIPELINE_SCRIPT`       | `src/scripts/run_pipeline.py`|
    /// | `TABSYN_WORKING_DIR`           | `.`                          |
    /// | `TABSYN_DATA_ROOT`             | `{working_dir}/src/data`     |
    /// | `TABSYN_GPU_DEVICES`           | `0`                          |
    /// | `TABSYN_NOTIFY_WEBHOOK_URL`    | unset                        |
    pub fn from_env() -> Self {
        let working_dir = PathBuf::from(env_or("TABSYN_WORKING_DIR", "."));
        let data_root = std::env::var("TABSYN_DATA_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| working_dir.join("src").join("data"));

        Self {
            cpu_limit: env_parse("TABSYN_CPU_LIMIT", 2),
            gpu_limit: env_parse("TABSYN_GPU_LIMIT", 1),
            workers_per_tier: std::env::var("TABSYN_WORKERS_PER_TIER")
                .ok()
                .map(|v| v.parse().expect("TABSYN_WORKERS_PER_TIER must be a valid usize")),
            single_active: env_parse("TABSYN_SINGLE_ACTIVE", true),
            poll_interval: Duration::from_millis(env_parse("TABSYN_POLL_INTERVAL_MS", 1000)),
            cancel_poll_interval: Duration::from_millis(env_parse("TABSYN_CANCEL_POLL_MS", 500)),
            pipeline_timeout: Duration::from_secs(env_parse(
                "TABSYN_PIPELINE_TIMEOUT_SECS",
                14_400,
            )),
            kill_grace: Duration::from_secs(env_parse("TABSYN_KILL_GRACE_SECS", 10)),
            retry: RetryPolicy {
                base_delay: Duration::from_secs(env_parse("TABSYN_RETRY_BASE_SECS", 60)),
                max_delay: Duration::from_secs(env_parse("TABSYN_RETRY_MAX_SECS", 900)),
            },
            python_bin: PathBuf::from(env_or("TABSYN_PYTHON_BIN", "python3")),
            script_path: PathBuf::from(env_or(
                "TABSYN_PIPELINE_SCRIPT",
                "src/scripts/run_pipeline.py",
            )),
            working_dir,
            data_root,
            gpu_devices: env_or("TABSYN_GPU_DEVICES", "0"),
            webhook_url: std::env::var("TABSYN_NOTIFY_WEBHOOK_URL").ok(),
        }
    }

    pub fn capacity(&self) -> CapacityConfig {
        CapacityConfig {
            cpu_limit: self.cpu_limit,
            gpu_limit: self.gpu_limit,
            single_active: self.single_active,
        }
    }

    pub fn runner(&self) -> RunnerConfig {
        RunnerConfig {
            python_bin: self.python_bin.clone(),
            script_path: self.script_path.clone(),
            working_dir: self.working_dir.clone(),
            data_root: self.data_root.clone(),
            pythonpath: Some(self.working_dir.join("src")),
            timeout: self.pipeline_timeout,
            kill_grace: self.kill_grace,
            gpu_devices: self.gpu_devices.clone(),
        }
    }

    /// Worker loops to spawn for a tier. At least one, so a tier with a
    /// zero limit still drains cancellations.
    pub fn workers_for(&self, tier: Tier) -> usize {
        let limit = match tier {
            Tier::Cpu => self.cpu_limit,
            Tier::Gpu => self.gpu_limit,
        };
        self.workers_per_tier.unwrap_or(limit).max(1)
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T
where
    T::Err: std::fmt::Debug,
{
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .unwrap_or_else(|e| panic!("{name} is invalid: {e:?}")),
        Err(_) => default,
    }
}
