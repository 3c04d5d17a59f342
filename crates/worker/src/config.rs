use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::TimeDelta;

use editbot_comfyui::launcher::LauncherConfig;
use editbot_comfyui::readiness::ReadinessConfig;
use editbot_comfyui::tracker::TrackerConfig;
use editbot_comfyui::workflow::NodeMap;
use editbot_core::params::{ParamDefaults, ParamLimits};

use crate::processor::ProcessorConfig;
use crate::queue::QueueConfig;

/// Longest accepted `HISTORY_MAX_AGE_HOURS` (ten years).
const MAX_HISTORY_AGE_HOURS: i64 = 24 * 365 * 10;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} has invalid value '{value}': {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Worker configuration loaded from environment variables.
///
/// Every field has a default suitable for a local ComfyUI on the same host.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Intake bind address (default: `0.0.0.0`).
    pub host: String,
    /// Intake bind port (default: `3000`).
    pub port: u16,
    /// Intake request timeout in seconds (default: `30`).
    pub request_timeout_secs: u64,

    pub comfyui_host: String,
    pub comfyui_port: u16,
    pub ready_attempts: u32,
    pub ready_delay_secs: u64,
    /// When set, the worker launches ComfyUI from this checkout itself.
    pub comfyui_dir: Option<PathBuf>,
    pub comfyui_venv: Option<PathBuf>,
    pub comfyui_extra_args: String,

    pub queue_max_size: usize,
    pub history_limit: usize,
    /// Age after which terminal jobs are pruned (default: 24 hours).
    pub history_max_age: TimeDelta,
    pub job_timeout_secs: u64,
    pub stream_read_timeout_secs: u64,
    pub fallback_interval_secs: u64,
    /// How long shutdown waits for the in-flight job (default: `60`).
    pub shutdown_grace_secs: u64,

    pub workflow_template: PathBuf,
    pub workflow_ui: Option<PathBuf>,
    pub output_node_id: String,
    pub output_dir: PathBuf,
    /// Results and notifications go here when set; otherwise they are logged.
    pub delivery_webhook_url: Option<String>,

    pub defaults: ParamDefaults,
    pub limits: ParamLimits,
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                    | Default                          |
    /// |----------------------------|----------------------------------|
    /// | `HOST`                     | `0.0.0.0`                        |
    /// | `PORT`                     | `3000`                           |
    /// | `REQUEST_TIMEOUT_SECS`     | `30`                             |
    /// | `COMFYUI_HOST`             | `127.0.0.1`                      |
    /// | `COMFYUI_PORT`             | `8188`                           |
    /// | `COMFYUI_READY_ATTEMPTS`   | `60`                             |
    /// | `COMFYUI_READY_DELAY_SECS` | `5`                              |
    /// | `COMFYUI_DIR`              | unset                            |
    /// | `COMFYUI_VENV`             | unset                            |
    /// | `COMFYUI_EXTRA_ARGS`       | empty                            |
    /// | `QUEUE_MAX_SIZE`           | `100`                            |
    /// | `HISTORY_LIMIT`            | `1000`                           |
    /// | `HISTORY_MAX_AGE_HOURS`    | `24`                             |
    /// | `JOB_TIMEOUT_SECS`         | `300`                            |
    /// | `STREAM_READ_TIMEOUT_SECS` | `5`                              |
    /// | `FALLBACK_INTERVAL_SECS`   | `10`                             |
    /// | `SHUTDOWN_GRACE_SECS`      | `60`                             |
    /// | `WORKFLOW_TEMPLATE`        | `workflows/qwen_image_edit.json` |
    /// | `WORKFLOW_UI`              | unset                            |
    /// | `OUTPUT_NODE_ID`           | `102`                            |
    /// | `OUTPUT_DIR`               | `data/output`                    |
    /// | `DELIVERY_WEBHOOK_URL`     | unset                            |
    ///
    /// Parameter defaults come from `DEFAULT_STEPS`, `DEFAULT_CFG`,
    /// `DEFAULT_SAMPLER`, `DEFAULT_SCHEDULER`, `DEFAULT_STRENGTH`,
    /// `DEFAULT_ETA`, `DEFAULT_DENOISE` and `DEFAULT_NEGATIVE_PROMPT`; limits
    /// from `MIN_STEPS`/`MAX_STEPS`, `MIN_CFG`/`MAX_CFG` and
    /// `MIN_STRENGTH`/`MAX_STRENGTH`.
    ///
    /// `COMFYUI_READY_ATTEMPTS`, `QUEUE_MAX_SIZE`, `JOB_TIMEOUT_SECS` and
    /// `STREAM_READ_TIMEOUT_SECS` must be greater than zero.
    /// `HISTORY_MAX_AGE_HOURS` must lie between 0 and ten years.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) but reads variables through
    /// `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);
        let base_defaults = ParamDefaults::default();
        let base_limits = ParamLimits::default();

        let defaults = ParamDefaults {
            steps: env.parse("DEFAULT_STEPS", base_defaults.steps)?,
            cfg: env.parse("DEFAULT_CFG", base_defaults.cfg)?,
            sampler: env.string("DEFAULT_SAMPLER", &base_defaults.sampler),
            scheduler: env.string("DEFAULT_SCHEDULER", &base_defaults.scheduler),
            seed: base_defaults.seed,
            strength: env.parse("DEFAULT_STRENGTH", base_defaults.strength)?,
            eta: env.parse("DEFAULT_ETA", base_defaults.eta)?,
            denoise: env.parse("DEFAULT_DENOISE", base_defaults.denoise)?,
            negative_prompt: env.string("DEFAULT_NEGATIVE_PROMPT", &base_defaults.negative_prompt),
        };

        let limits = ParamLimits {
            min_steps: env.parse("MIN_STEPS", base_limits.min_steps)?,
            max_steps: env.parse("MAX_STEPS", base_limits.max_steps)?,
            min_cfg: env.parse("MIN_CFG", base_limits.min_cfg)?,
            max_cfg: env.parse("MAX_CFG", base_limits.max_cfg)?,
            min_strength: env.parse("MIN_STRENGTH", base_limits.min_strength)?,
            max_strength: env.parse("MAX_STRENGTH", base_limits.max_strength)?,
        };

        Ok(Self {
            host: env.string("HOST", "0.0.0.0"),
            port: env.parse("PORT", 3000)?,
            request_timeout_secs: env.parse("REQUEST_TIMEOUT_SECS", 30)?,

            comfyui_host: env.string("COMFYUI_HOST", "127.0.0.1"),
            comfyui_port: env.parse("COMFYUI_PORT", 8188)?,
            ready_attempts: env.positive("COMFYUI_READY_ATTEMPTS", 60)?,
            ready_delay_secs: env.parse("COMFYUI_READY_DELAY_SECS", 5)?,
            comfyui_dir: env.optional("COMFYUI_DIR").map(PathBuf::from),
            comfyui_venv: env.optional("COMFYUI_VENV").map(PathBuf::from),
            comfyui_extra_args: env.string("COMFYUI_EXTRA_ARGS", ""),

            queue_max_size: env.positive("QUEUE_MAX_SIZE", 100)?,
            history_limit: env.parse("HISTORY_LIMIT", 1000)?,
            history_max_age: env.hours("HISTORY_MAX_AGE_HOURS", 24, MAX_HISTORY_AGE_HOURS)?,
            job_timeout_secs: env.positive("JOB_TIMEOUT_SECS", 300)?,
            stream_read_timeout_secs: env.positive("STREAM_READ_TIMEOUT_SECS", 5)?,
            fallback_interval_secs: env.parse("FALLBACK_INTERVAL_SECS", 10)?,
            shutdown_grace_secs: env.parse("SHUTDOWN_GRACE_SECS", 60)?,

            workflow_template: PathBuf::from(
                env.string("WORKFLOW_TEMPLATE", "workflows/qwen_image_edit.json"),
            ),
            workflow_ui: env.optional("WORKFLOW_UI").map(PathBuf::from),
            output_node_id: env.string("OUTPUT_NODE_ID", "102"),
            output_dir: PathBuf::from(env.string("OUTPUT_DIR", "data/output")),
            delivery_webhook_url: env.optional("DELIVERY_WEBHOOK_URL"),

            defaults,
            limits,
        })
    }

    pub fn readiness(&self) -> ReadinessConfig {
        ReadinessConfig {
            max_attempts: self.ready_attempts,
            delay: Duration::from_secs(self.ready_delay_secs),
            ..ReadinessConfig::default()
        }
    }

    pub fn tracker(&self) -> TrackerConfig {
        TrackerConfig {
            read_timeout: Duration::from_secs(self.stream_read_timeout_secs),
            fallback_interval: Duration::from_secs(self.fallback_interval_secs),
            ..TrackerConfig::default()
        }
    }

    pub fn queue(&self) -> QueueConfig {
        QueueConfig {
            max_size: self.queue_max_size,
            history_limit: self.history_limit,
        }
    }

    pub fn processor(&self) -> ProcessorConfig {
        ProcessorConfig {
            job_timeout: Duration::from_secs(self.job_timeout_secs),
            output_dir: self.output_dir.clone(),
            output_node: self.output_node_id.clone(),
        }
    }

    /// Template node ids, with the output node taken from `OUTPUT_NODE_ID`.
    pub fn node_map(&self) -> NodeMap {
        NodeMap {
            output: self.output_node_id.clone(),
            ..NodeMap::default()
        }
    }

    /// Launcher settings, present only when `COMFYUI_DIR` is configured.
    pub fn launcher(&self) -> Option<LauncherConfig> {
        self.comfyui_dir.as_ref().map(|dir| LauncherConfig {
            comfyui_dir: dir.clone(),
            host: self.comfyui_host.clone(),
            port: self.comfyui_port,
            venv_dir: self.comfyui_venv.clone(),
            extra_args: self.comfyui_extra_args.clone(),
        })
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Variable reader shared by the `from_*` constructors.
struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Set and non-blank value of `name`.
    fn optional(&self, name: &str) -> Option<String> {
        (self.0)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, name: &str, default: &str) -> String {
        (self.0)(name).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, name: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(name) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
                var: name,
                reason: e.to_string(),
                value,
            }),
        }
    }

    /// Like [`parse`](Self::parse) but rejects zero.
    fn positive<T>(&self, name: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr + Default + PartialEq + std::fmt::Display,
        T::Err: std::fmt::Display,
    {
        let value = self.parse(name, default)?;
        if value == T::default() {
            return Err(ConfigError::Invalid {
                var: name,
                value: value.to_string(),
                reason: "must be greater than zero".into(),
            });
        }
        Ok(value)
    }

    /// Whole hours in `0..=max`.
    fn hours(&self, name: &'static str, default: i64, max: i64) -> Result<TimeDelta, ConfigError> {
        let hours = self.parse(name, default)?;
        match TimeDelta::try_hours(hours) {
            Some(delta) if (0..=max).contains(&hours) => Ok(delta),
            _ => Err(ConfigError::Invalid {
                var: name,
                value: hours.to_string(),
                reason: format!("must be between 0 and {max} hours"),
            }),
        }
    }
}
