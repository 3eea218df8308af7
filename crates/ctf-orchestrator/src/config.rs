use ctf_common::{CtfError, Result};
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Orchestrator settings, read from the environment. Defaults are for local
/// development only.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Shared secret expected in the `X-ORCH-TOKEN` header.
    pub token: String,
    pub bind_addr: SocketAddr,
    /// Fractional cores per instance.
    pub cpu_limit: f64,
    pub memory_bytes: i64,
    pub pids_limit: i64,
    pub max_runtime: Duration,
    pub reaper_interval: Duration,
    /// Path to a seccomp JSON profile, or `unconfined`.
    pub seccomp_profile_path: String,
    pub stop_grace: Duration,
    /// Bound applied to every runtime call issued on behalf of a request.
    pub runtime_timeout: Duration,
    /// Host reported to callers alongside the published shell port.
    pub instance_host: String,
    pub allow_multiple_instances: bool,
    /// Capability allow-list override. `None` keeps the login-shell default.
    pub cap_add: Option<Vec<String>>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            token: "orch-dev-token".to_string(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8001)),
            cpu_limit: 0.5,
            memory_bytes: 256 * 1024 * 1024,
            pids_limit: 128,
            max_runtime: Duration::from_secs(3600),
            reaper_interval: Duration::from_secs(120),
            seccomp_profile_path: "/app/seccomp.json".to_string(),
            stop_grace: Duration::from_secs(10),
            runtime_timeout: Duration::from_secs(20),
            instance_host: "127.0.0.1".to_string(),
            allow_multiple_instances: true,
            cap_add: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup. Unset keys fall back to
    /// [`Default`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let cpu_limit = match get("CPU_LIMIT") {
            Some(v) => parse::<f64>("CPU_LIMIT", &v)?,
            None => defaults.cpu_limit,
        };
        if cpu_limit.is_nan() || cpu_limit <= 0.0 {
            return Err(CtfError::Config(format!(
                "CPU_LIMIT must be positive, got {cpu_limit}"
            )));
        }

        Ok(Self {
            token: get("ORCH_TOKEN").unwrap_or(defaults.token),
            bind_addr: match get("ORCH_BIND_ADDR") {
                Some(v) => parse("ORCH_BIND_ADDR", &v)?,
                None => defaults.bind_addr,
            },
            cpu_limit,
            memory_bytes: match get("MEM_LIMIT") {
                Some(v) => parse_memory_limit(&v)?,
                None => defaults.memory_bytes,
            },
            pids_limit: match get("PIDS_LIMIT") {
                Some(v) => parse("PIDS_LIMIT", &v)?,
                None => defaults.pids_limit,
            },
            max_runtime: secs(get("MAX_RUNTIME_SECONDS"), "MAX_RUNTIME_SECONDS", defaults.max_runtime, 1)?,
            reaper_interval: secs(
                get("REAPER_INTERVAL_SECONDS"),
                "REAPER_INTERVAL_SECONDS",
                defaults.reaper_interval,
                1,
            )?,
            seccomp_profile_path: get("SECCOMP_PROFILE_PATH").unwrap_or(defaults.seccomp_profile_path),
            stop_grace: secs(get("STOP_GRACE_SECONDS"), "STOP_GRACE_SECONDS", defaults.stop_grace, 0)?,
            runtime_timeout: secs(
                get("RUNTIME_TIMEOUT_SECONDS"),
                "RUNTIME_TIMEOUT_SECONDS",
                defaults.runtime_timeout,
                1,
            )?,
            instance_host: get("INSTANCE_HOST").unwrap_or(defaults.instance_host),
            allow_multiple_instances: match get("ALLOW_MULTIPLE_INSTANCES") {
                Some(v) => parse_bool("ALLOW_MULTIPLE_INSTANCES", &v)?,
                None => defaults.allow_multiple_instances,
            },
            cap_add: get("CAP_ADD").map(|v| {
                v.split(',')
                    .map(|c| c.trim().to_uppercase())
                    .filter(|c| !c.is_empty())
                    .collect()
            }),
        })
    }

    /// CPU limit in the engine's nano-CPU unit.
    pub fn nano_cpus(&self) -> i64 {
        (self.cpu_limit * 1e9) as i64
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| CtfError::Config(format!("invalid {key} {value:?}: {e}")))
}

/// Upper bound for every `*_SECONDS` setting (30 days).
pub const MAX_SECONDS: u64 = 30 * 24 * 60 * 60;

fn secs(value: Option<String>, key: &str, default: Duration, min: u64) -> Result<Duration> {
    let Some(v) = value else {
        return Ok(default);
    };
    let secs = parse::<u64>(key, &v)?;
    if !(min..=MAX_SECONDS).contains(&secs) {
        return Err(CtfError::Config(format!(
            "{key} must be between {min} and {MAX_SECONDS}, got {secs}"
        )));
    }
    Ok(Duration::from_secs(secs))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(CtfError::Config(format!("invalid {key} {other:?}"))),
    }
}

/// Parses docker-style memory sizes: `268435456`, `512k`, `256m`, `1g`.
pub fn parse_memory_limit(value: &str) -> Result<i64> {
    let trimmed = value.trim().to_ascii_lowercase();
    let trimmed = trimmed.strip_suffix('b').unwrap_or(&trimmed);
    let (digits, multiplier) = match trimmed.chars().last() {
        Some('k') => (&trimmed[..trimmed.len() - 1], 1024),
        Some('m') => (&trimmed[..trimmed.len() - 1], 1024 * 1024),
        Some('g') => (&trimmed[..trimmed.len() - 1], 1024 * 1024 * 1024),
        _ => (trimmed, 1),
    };
    let amount: i64 = digits
        .trim()
        .parse()
        .map_err(|_| CtfError::Config(format!("invalid MEM_LIMIT {value:?}")))?;
    if amount <= 0 {
        return Err(CtfError::Config(format!("invalid MEM_LIMIT {value:?}")));
    }
    amount
        .checked_mul(multiplier)
        .ok_or_else(|| CtfError::Config(format!("MEM_LIMIT {value:?} overflows")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = OrchestratorConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.token, "orch-dev-token");
        assert_eq!(config.memory_bytes, 268_435_456);
        assert_eq!(config.nano_cpus(), 500_000_000);
        assert_eq!(config.max_runtime, Duration::from_secs(3600));
        assert_eq!(config.reaper_interval, Duration::from_secs(120));
        assert!(config.allow_multiple_instances);
        assert!(config.cap_add.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = OrchestratorConfig::from_lookup(lookup(&[
            ("ORCH_TOKEN", "s3cret"),
            ("CPU_LIMIT", "1.5"),
            ("MEM_LIMIT", "1g"),
            ("MAX_RUNTIME_SECONDS", "60"),
            ("ALLOW_MULTIPLE_INSTANCES", "false"),
            ("CAP_ADD", "chown, setuid"),
        ]))
        .unwrap();
        assert_eq!(config.token, "s3cret");
        assert_eq!(config.nano_cpus(), 1_500_000_000);
        assert_eq!(config.memory_bytes, 1024 * 1024 * 1024);
        assert_eq!(config.max_runtime, Duration::from_secs(60));
        assert!(!config.allow_multiple_instances);
        assert_eq!(
            config.cap_add,
            Some(vec!["CHOWN".to_string(), "SETUID".to_string()])
        );
    }

    #[test]
    fn test_malformed_values_are_config_errors() {
        for pairs in [
            [("CPU_LIMIT", "lots")],
            [("CPU_LIMIT", "-1")],
            [("MEM_LIMIT", "12x")],
            [("MAX_RUNTIME_SECONDS", "1h")],
            [("ALLOW_MULTIPLE_INSTANCES", "maybe")],
        ] {
            let err = OrchestratorConfig::from_lookup(lookup(&pairs)).unwrap_err();
            assert!(matches!(err, CtfError::Config(_)), "{pairs:?}");
        }
    }

    #[test]
    fn test_duration_bounds() {
        for pairs in [
            [("MAX_RUNTIME_SECONDS", "18446744073709551615")],
            [("MAX_RUNTIME_SECONDS", "0")],
            [("REAPER_INTERVAL_SECONDS", "0")],
            [("REAPER_INTERVAL_SECONDS", "9999999999")],
            [("STOP_GRACE_SECONDS", "18446744073709551615")],
            [("RUNTIME_TIMEOUT_SECONDS", "0")],
        ] {
            let err = OrchestratorConfig::from_lookup(lookup(&pairs)).unwrap_err();
            assert!(matches!(err, CtfError::Config(_)), "{pairs:?}");
        }

        let longest = MAX_SECONDS.to_string();
        let config = OrchestratorConfig::from_lookup(lookup(&[
            ("MAX_RUNTIME_SECONDS", longest.as_str()),
            ("STOP_GRACE_SECONDS", "0"),
            ("REAPER_INTERVAL_SECONDS", "1"),
        ]))
        .unwrap();
        assert_eq!(config.max_runtime, Duration::from_secs(MAX_SECONDS));
        assert_eq!(config.stop_grace, Duration::ZERO);
        assert_eq!(config.reaper_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_memory_limit_units() {
        assert_eq!(parse_memory_limit("256m").unwrap(), 268_435_456);
        assert_eq!(parse_memory_limit("512K").unwrap(), 524_288);
        assert_eq!(parse_memory_limit("2gb").unwrap(), 2_147_483_648);
        assert_eq!(parse_memory_limit("1048576").unwrap(), 1_048_576);
        assert!(parse_memory_limit("m").is_err());
        assert!(parse_memory_limit("0").is_err());
    }
}
