//! Isolation policy applied to every instance container.

use crate::config::OrchestratorConfig;
use ctf_common::{CtfError, Result};
use std::path::Path;
use tracing::{info, warn};

/// Value of `SECCOMP_PROFILE_PATH` that disables the filter.
pub const UNCONFINED: &str = "unconfined";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeccompProfile {
    Unconfined,
    /// Inline JSON profile contents.
    Profile(String),
}

/// Capability set and syscall filter for an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityPolicy {
    pub cap_drop: Vec<String>,
    pub cap_add: Vec<String>,
    pub seccomp: SeccompProfile,
}

impl SecurityPolicy {
    /// Everything dropped, then what a login shell needs: chown, set-uid,
    /// set-gid and binding privileged ports.
    pub fn login_shell() -> Self {
        Self {
            cap_drop: vec!["ALL".to_string()],
            cap_add: ["CHOWN", "SETUID", "SETGID", "NET_BIND_SERVICE"]
                .iter()
                .map(|c| c.to_string())
                .collect(),
            seccomp: SeccompProfile::Unconfined,
        }
    }

    pub fn with_cap_add(mut self, caps: Vec<String>) -> Self {
        self.cap_add = caps;
        self
    }

    pub fn with_seccomp(mut self, seccomp: SeccompProfile) -> Self {
        self.seccomp = seccomp;
        self
    }

    /// Builds the policy from configuration, reading the seccomp profile from disk.
    pub async fn from_config(config: &OrchestratorConfig) -> Result<Self> {
        let mut policy = Self::login_shell();
        if let Some(caps) = &config.cap_add {
            policy = policy.with_cap_add(caps.clone());
        }
        let seccomp = load_seccomp(&config.seccomp_profile_path).await?;
        Ok(policy.with_seccomp(seccomp))
    }

    /// Engine `security_opt` entries.
    pub fn security_opts(&self) -> Vec<String> {
        match &self.seccomp {
            SeccompProfile::Unconfined => vec![format!("seccomp={UNCONFINED}")],
            SeccompProfile::Profile(json) => vec![format!("seccomp={json}")],
        }
    }
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self::login_shell()
    }
}

pub async fn load_seccomp(path: &str) -> Result<SeccompProfile> {
    if path.trim().eq_ignore_ascii_case(UNCONFINED) {
        warn!("Seccomp filtering disabled for instances");
        return Ok(SeccompProfile::Unconfined);
    }
    let contents = tokio::fs::read_to_string(Path::new(path))
        .await
        .map_err(|e| CtfError::Config(format!("cannot read seccomp profile {path}: {e}")))?;
    if contents.trim().is_empty() {
        return Err(CtfError::Config(format!("seccomp profile {path} is empty")));
    }
    info!(%path, "Loaded seccomp profile");
    Ok(SeccompProfile::Profile(contents))
}

/// Per-instance resource ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub nano_cpus: i64,
    pub memory_bytes: i64,
    pub pids_limit: i64,
}

impl From<&OrchestratorConfig> for ResourceLimits {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            nano_cpus: config.nano_cpus(),
            memory_bytes: config.memory_bytes,
            pids_limit: config.pids_limit,
        }
    }
}
