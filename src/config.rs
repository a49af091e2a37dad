//! Configuration types, built from environment variables.
//!
//! Every `from_env()` has a `from_lookup()` twin taking the variable source
//! as a closure, so parsing can be exercised without touching the process
//! environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::error::ConfigError;

/// Duration used for any operator without a configured timing.
pub const DEFAULT_OPERATION_TIME_MS: u64 = 1000;

/// Read `key` and parse it. `Ok(None)` when unset or blank.
fn read_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse()
                .map(Some)
                .map_err(|_| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: format!("cannot parse '{raw}'"),
                })
        }
        _ => Ok(None),
    }
}

/// Read `key`, falling back to `default` when unset or invalid.
fn var_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match read_var(lookup, key) {
        Ok(Some(value)) => value,
        Ok(None) => default,
        Err(e) => {
            warn!("{e}; using the default");
            default
        }
    }
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

// ── Operation timings ───────────────────────────────────────────────

/// Simulated execution time per operator, handed to workers with each task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationTimes {
    pub addition_ms: u64,
    pub subtraction_ms: u64,
    pub multiplication_ms: u64,
    pub division_ms: u64,
}

impl Default for OperationTimes {
    fn default() -> Self {
        Self {
            addition_ms: DEFAULT_OPERATION_TIME_MS,
            subtraction_ms: DEFAULT_OPERATION_TIME_MS,
            multiplication_ms: DEFAULT_OPERATION_TIME_MS,
            division_ms: DEFAULT_OPERATION_TIME_MS,
        }
    }
}

impl OperationTimes {
    /// No simulated delay at all.
    pub fn instant() -> Self {
        Self {
            addition_ms: 0,
            subtraction_ms: 0,
            multiplication_ms: 0,
            division_ms: 0,
        }
    }

    /// Build from `TIME_ADDITION_MS`, `TIME_SUBTRACTION_MS`,
    /// `TIME_MULTIPLICATION_MS` and `TIME_DIVISION_MS`.
    pub fn from_env() -> Self {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            addition_ms: var_or(&lookup, "TIME_ADDITION_MS", DEFAULT_OPERATION_TIME_MS),
            subtraction_ms: var_or(&lookup, "TIME_SUBTRACTION_MS", DEFAULT_OPERATION_TIME_MS),
            multiplication_ms: var_or(&lookup, "TIME_MULTIPLICATION_MS", DEFAULT_OPERATION_TIME_MS),
            division_ms: var_or(&lookup, "TIME_DIVISION_MS", DEFAULT_OPERATION_TIME_MS),
        }
    }

    /// Timing for an operator symbol; unknown symbols get the default.
    pub fn for_operator(&self, op: &str) -> u64 {
        match op {
            "+" => self.addition_ms,
            "-" => self.subtraction_ms,
            "*" => self.multiplication_ms,
            "/" => self.division_ms,
            _ => DEFAULT_OPERATION_TIME_MS,
        }
    }
}

// ── Completion dispatcher ───────────────────────────────────────────

/// Worker pool that runs rescheduling passes after task completions.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Number of concurrent rescheduling workers.
    pub workers: usize,
    /// Attempts per completion before it is counted as failed.
    pub max_attempts: u32,
    /// Pause between attempts.
    pub retry_delay: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_attempts: 3,
            retry_delay: Duration::from_millis(200),
        }
    }
}

// ── Orchestrator ────────────────────────────────────────────────────

/// Orchestrator server configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// libSQL database file.
    pub db_path: PathBuf,
    /// HTTP listen port.
    pub http_port: u16,
    /// Delay suggested to workers when no task is available.
    pub retry_after_secs: u64,
    pub dispatch: DispatchConfig,
    /// Agents run inside the orchestrator process (0 = none).
    pub local_agents: usize,
    pub operation_times: OperationTimes,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/calc.db"),
            http_port: 8080,
            retry_after_secs: 5,
            dispatch: DispatchConfig::default(),
            local_agents: 0,
            operation_times: OperationTimes::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let db_path = lookup("CALC_DB_PATH")
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        let workers: usize = var_or(&lookup, "CALC_DISPATCH_WORKERS", defaults.dispatch.workers);

        Self {
            db_path,
            http_port: var_or(&lookup, "CALC_HTTP_PORT", defaults.http_port),
            retry_after_secs: var_or(&lookup, "CALC_RETRY_AFTER_SECS", defaults.retry_after_secs),
            dispatch: DispatchConfig {
                workers: workers.max(1),
                ..defaults.dispatch
            },
            local_agents: var_or(&lookup, "CALC_LOCAL_AGENTS", defaults.local_agents),
            operation_times: OperationTimes::from_lookup(&lookup),
        }
    }
}

// ── Agent ───────────────────────────────────────────────────────────

/// Remote agent process configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Base URL of the orchestrator's HTTP API.
    pub orchestrator_url: String,
    /// Number of concurrent workers in this process.
    pub computing_power: usize,
    /// Pause after a transport error.
    pub error_backoff: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            orchestrator_url: "http://127.0.0.1:8080".to_string(),
            computing_power: 2,
            error_backoff: Duration::from_secs(1),
        }
    }
}

impl AgentConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let orchestrator_url = lookup("CALC_ORCHESTRATOR_URL")
            .map(|s| s.trim().trim_end_matches('/').to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or(defaults.orchestrator_url);
        let computing_power: usize =
            var_or(&lookup, "COMPUTING_POWER", defaults.computing_power);

        Self {
            orchestrator_url,
            computing_power: computing_power.max(1),
            error_backoff: defaults.error_backoff,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn operation_times_default_to_one_second() {
        let times = OperationTimes::from_lookup(lookup_from(&[]));
        assert_eq!(times, OperationTimes::default());
        assert_eq!(times.for_operator("+"), 1000);
    }

    #[test]
    fn operation_times_read_each_operator() {
        let times = OperationTimes::from_lookup(lookup_from(&[
            ("TIME_ADDITION_MS", "10"),
            ("TIME_SUBTRACTION_MS", "20"),
            ("TIME_MULTIPLICATION_MS", "30"),
            ("TIME_DIVISION_MS", "40"),
        ]));
        assert_eq!(times.for_operator("+"), 10);
        assert_eq!(times.for_operator("-"), 20);
        assert_eq!(times.for_operator("*"), 30);
        assert_eq!(times.for_operator("/"), 40);
    }

    #[test]
    fn invalid_or_negative_timings_fall_back() {
        let times = OperationTimes::from_lookup(lookup_from(&[
            ("TIME_ADDITION_MS", "fast"),
            ("TIME_SUBTRACTION_MS", "-5"),
            ("TIME_MULTIPLICATION_MS", "  "),
        ]));
        assert_eq!(times.addition_ms, 1000);
        assert_eq!(times.subtraction_ms, 1000);
        assert_eq!(times.multiplication_ms, 1000);
    }

    #[test]
    fn unknown_operator_gets_default_timing() {
        let times = OperationTimes::instant();
        assert_eq!(times.for_operator("^"), DEFAULT_OPERATION_TIME_MS);
    }

    #[test]
    fn read_var_reports_the_key() {
        let err = read_var::<u16>(&lookup_from(&[("CALC_HTTP_PORT", "eighty")]), "CALC_HTTP_PORT")
            .unwrap_err();
        assert!(err.to_string().contains("CALC_HTTP_PORT"));
    }

    #[test]
    fn orchestrator_config_from_lookup() {
        let config = OrchestratorConfig::from_lookup(lookup_from(&[
            ("CALC_DB_PATH", "/tmp/x.db"),
            ("CALC_HTTP_PORT", "9090"),
            ("CALC_DISPATCH_WORKERS", "0"),
            ("CALC_LOCAL_AGENTS", "3"),
        ]));
        assert_eq!(config.db_path, PathBuf::from("/tmp/x.db"));
        assert_eq!(config.http_port, 9090);
        assert_eq!(config.retry_after_secs, 5);
        assert_eq!(config.dispatch.workers, 1);
        assert_eq!(config.local_agents, 3);
    }

    #[test]
    fn agent_config_trims_url() {
        let config = AgentConfig::from_lookup(lookup_from(&[
            ("CALC_ORCHESTRATOR_URL", "http://orchestrator:8080/"),
            ("COMPUTING_POWER", "4"),
        ]));
        assert_eq!(config.orchestrator_url, "http://orchestrator:8080");
        assert_eq!(config.computing_power, 4);

        let config = AgentConfig::from_lookup(lookup_from(&[]));
        assert_eq!(config.orchestrator_url, "http://127.0.0.1:8080");
        assert_eq!(config.computing_power, 2);
    }
}
