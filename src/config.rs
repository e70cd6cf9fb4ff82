use std::collections::BTreeSet;
use std::str::FromStr;
use std::string::String;
use std::{env, fmt};

use crate::metrics::Unit;

/// Process-wide settings, read once at cold start and shared read-only by
/// every invocation.
#[derive(Debug, Clone)]
pub struct Config {
    pub environment: String,
    pub namespace: String,
    pub production_environments: BTreeSet<String>,
    pub policy: MetricPolicy,
    pub timestamp_resolution: TimestampResolution,
    pub verify_writes: bool,
    pub retry_limit: u32,
    pub emit_concurrency: usize,
}

/// Unit choice for each elapsed-time metric. Every emission of a metric name
/// uses the unit recorded here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricPolicy {
    pub lead_time_unit: Unit,
    pub mttr_unit: Unit,
}

impl Default for MetricPolicy {
    fn default() -> Self {
        MetricPolicy {
            lead_time_unit: Unit::Seconds,
            mttr_unit: Unit::Minutes,
        }
    }
}

/// Granularity the emitted timestamp is truncated to before publishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimestampResolution {
    #[default]
    None,
    Second,
    Minute,
}

impl FromStr for TimestampResolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        match s.trim().to_lowercase().as_str() {
            "" | "none" => Ok(TimestampResolution::None),
            "second" | "seconds" => Ok(TimestampResolution::Second),
            "minute" | "minutes" => Ok(TimestampResolution::Minute),
            other => Err(format!("Invalid timestamp resolution {}", other)),
        }
    }
}

impl fmt::Display for TimestampResolution {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

const DEFAULT_PRODUCTION_ENVIRONMENTS: &str = "production";

impl Config {
    /// Builds a config with defaults for everything except the environment
    /// identifier and the metrics namespace.
    pub fn new(environment: impl Into<String>, namespace: impl Into<String>) -> Config {
        Config {
            environment: environment.into(),
            namespace: namespace.into(),
            production_environments: parse_environment_set(DEFAULT_PRODUCTION_ENVIRONMENTS),
            policy: MetricPolicy::default(),
            timestamp_resolution: TimestampResolution::default(),
            verify_writes: false,
            retry_limit: 3,
            emit_concurrency: 4,
        }
    }

    pub fn load_from_env() -> Result<Config, String> {
        let conf = Config {
            environment: env::var("ENVIRONMENT")
                .map_err(|e| format!("ENVIRONMENT not set - {}", e))?,
            namespace: env::var("DORA_METRICS_NAMESPACE")
                .map_err(|e| format!("DORA_METRICS_NAMESPACE not set - {}", e))?,
            production_environments: parse_environment_set(
                &env::var("PRODUCTION_ENVIRONMENTS")
                    .unwrap_or(DEFAULT_PRODUCTION_ENVIRONMENTS.to_string()),
            ),
            policy: MetricPolicy {
                lead_time_unit: elapsed_unit_from_env("LEAD_TIME_UNIT", Unit::Seconds)?,
                mttr_unit: elapsed_unit_from_env("MTTR_UNIT", Unit::Minutes)?,
            },
            timestamp_resolution: env::var("TIMESTAMP_RESOLUTION")
                .unwrap_or("none".to_string())
                .parse::<TimestampResolution>()
                .map_err(|e| format!("Error parsing TIMESTAMP_RESOLUTION - {}", e))?,
            verify_writes: env::var("VERIFY_METRICS")
                .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
            retry_limit: env::var("RETRY_LIMIT")
                .unwrap_or("3".to_string())
                .parse::<u32>()
                .map_err(|e| format!("Error parsing RETRY_LIMIT to u32 - {}", e))?,
            emit_concurrency: env::var("EMIT_CONCURRENCY")
                .unwrap_or("4".to_string())
                .parse::<usize>()
                .map_err(|e| format!("Error parsing EMIT_CONCURRENCY to usize - {}", e))?,
        };

        if conf.production_environments.is_empty() {
            return Err("PRODUCTION_ENVIRONMENTS must name at least one environment".to_string());
        }
        if conf.retry_limit == 0 {
            return Err("RETRY_LIMIT must be at least 1".to_string());
        }

        Ok(conf)
    }

    /// Whether the current environment is one of the configured
    /// production-equivalent identifiers. Comparison is exact.
    pub fn is_production(&self) -> bool {
        self.production_environments.contains(&self.environment)
    }

    pub fn with_production_environments<I, S>(mut self, environments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.production_environments = environments.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_policy(mut self, policy: MetricPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_timestamp_resolution(mut self, resolution: TimestampResolution) -> Self {
        self.timestamp_resolution = resolution;
        self
    }

    pub fn with_verify_writes(mut self, verify: bool) -> Self {
        self.verify_writes = verify;
        self
    }
}

fn parse_environment_set(raw: &str) -> BTreeSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn elapsed_unit_from_env(var: &str, default: Unit) -> Result<Unit, String> {
    let Ok(raw) = env::var(var) else {
        return Ok(default);
    };
    let unit = raw
        .parse::<Unit>()
        .map_err(|e| format!("Error parsing {} - {}", var, e))?;
    if !unit.is_elapsed_time() {
        return Err(format!(
            "{} must be one of Seconds, Minutes or Hours, got {}",
            var, unit
        ));
    }
    Ok(unit)
}
