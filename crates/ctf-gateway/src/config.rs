use ctf_common::{CtfError, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Browser-facing gateway settings. Defaults are for local development only.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// HS256 key user tokens are signed with.
    pub secret_key: String,
    pub bind_addr: SocketAddr,
    pub orchestrator_url: String,
    pub orchestrator_ws_url: String,
    pub orchestrator_token: String,
    pub challenges_path: PathBuf,
    pub ticket_ttl: Duration,
    pub orchestrator_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            secret_key: "dev-secret".to_string(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            orchestrator_url: "http://orchestrator:8001".to_string(),
            orchestrator_ws_url: "ws://orchestrator:8001".to_string(),
            orchestrator_token: "orch-dev-token".to_string(),
            challenges_path: PathBuf::from("/data/challenges.json"),
            ticket_ttl: Duration::from_secs(30),
            orchestrator_timeout: Duration::from_secs(20),
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let get = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        let secs = |key: &str, default: Duration| -> Result<Duration> {
            match get(key) {
                Some(v) => v
                    .trim()
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .map_err(|e| CtfError::Config(format!("invalid {key} {v:?}: {e}"))),
                None => Ok(default),
            }
        };

        Ok(Self {
            secret_key: get("SECRET_KEY").unwrap_or(defaults.secret_key),
            bind_addr: match get("GATEWAY_BIND_ADDR") {
                Some(v) => v
                    .trim()
                    .parse()
                    .map_err(|e| CtfError::Config(format!("invalid GATEWAY_BIND_ADDR {v:?}: {e}")))?,
                None => defaults.bind_addr,
            },
            orchestrator_url: get("ORCHESTRATOR_URL")
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or(defaults.orchestrator_url),
            orchestrator_ws_url: get("ORCHESTRATOR_WS_URL")
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or(defaults.orchestrator_ws_url),
            orchestrator_token: get("ORCHESTRATOR_TOKEN").unwrap_or(defaults.orchestrator_token),
            challenges_path: get("CHALLENGES_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.challenges_path),
            ticket_ttl: secs("TICKET_TTL_SECONDS", defaults.ticket_ttl)?,
            orchestrator_timeout: secs("ORCHESTRATOR_TIMEOUT_SECONDS", defaults.orchestrator_timeout)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const KEYS: [&str; 4] = [
        "SECRET_KEY",
        "ORCHESTRATOR_URL",
        "TICKET_TTL_SECONDS",
        "GATEWAY_BIND_ADDR",
    ];

    fn clear() {
        for key in KEYS {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_from_env_defaults_and_overrides() {
        clear();
        let config = GatewayConfig::from_env().unwrap();
        assert_eq!(config.secret_key, "dev-secret");
        assert_eq!(config.ticket_ttl, Duration::from_secs(30));

        std::env::set_var("SECRET_KEY", "prod-secret");
        std::env::set_var("ORCHESTRATOR_URL", "http://10.0.0.5:8001/");
        std::env::set_var("TICKET_TTL_SECONDS", "5");
        let config = GatewayConfig::from_env().unwrap();
        assert_eq!(config.secret_key, "prod-secret");
        assert_eq!(config.orchestrator_url, "http://10.0.0.5:8001");
        assert_eq!(config.ticket_ttl, Duration::from_secs(5));
        clear();
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_malformed_values() {
        clear();
        std::env::set_var("TICKET_TTL_SECONDS", "soon");
        assert!(matches!(GatewayConfig::from_env(), Err(CtfError::Config(_))));
        clear();

        std::env::set_var("GATEWAY_BIND_ADDR", "localhost");
        assert!(matches!(GatewayConfig::from_env(), Err(CtfError::Config(_))));
        clear();
    }
}
