use anyhow::{bail, Context, Result};
use nimbus_common::policy::parse_template_patterns;
use std::net::Ipv4Addr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ControlPlaneSettings {
    /// XML-RPC endpoint, e.g. `http://one.example:2633/RPC2`.
    pub endpoint: String,
    pub username: String,
    pub password: String,
    pub timeout: Duration,
    pub accept_invalid_certs: bool,
}

#[derive(Debug, Clone)]
pub struct IpamSettings {
    pub endpoint: String,
    /// Owner recorded on reservations.
    pub user: String,
    pub network: String,
    pub netmask: Ipv4Addr,
}

/// Knobs of the cluster bootstrap handshake.
#[derive(Debug, Clone)]
pub struct BootstrapSettings {
    pub mgmt_connect_retries: u32,
    pub license_retries: u32,
    pub retry_interval: Duration,
    pub mgmt_timeout: Duration,
    /// 0 issues a permanent license.
    pub license_days: u32,
    pub license_capacity: u32,
}

impl Default for BootstrapSettings {
    fn default() -> Self {
        Self {
            mgmt_connect_retries: 60,
            license_retries: 10,
            retry_interval: Duration::from_secs(10),
            mgmt_timeout: Duration::from_secs(30),
            license_days: 30,
            license_capacity: 24,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    /// `opennebula` | `mock`
    pub provider: String,
    pub control_plane: ControlPlaneSettings,
    pub ipam: Option<IpamSettings>,
    pub poll_interval: Duration,
    /// Polls allowed for an instance to reach the wanted state.
    pub wait_retries: u32,
    pub max_parallel_nodes: usize,
    pub unstoppable_templates: Vec<String>,
    pub bootstrap: BootstrapSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            provider: "opennebula".to_string(),
            control_plane: ControlPlaneSettings {
                endpoint: "http://localhost:2633/RPC2".to_string(),
                username: "oneadmin".to_string(),
                password: String::new(),
                timeout: Duration::from_secs(60),
                accept_invalid_certs: false,
            },
            ipam: None,
            poll_interval: Duration::from_secs(10),
            wait_retries: 60,
            max_parallel_nodes: 8,
            unstoppable_templates: parse_template_patterns(None),
            bootstrap: BootstrapSettings::default(),
        }
    }
}

impl Settings {
    /// Read settings from the environment (after `.env`, if any).
    pub fn from_env() -> Result<Self> {
        let _ = dotenv::dotenv();
        let defaults = Settings::default();

        let control_plane = ControlPlaneSettings {
            endpoint: env_string("ONE_XMLRPC").unwrap_or(defaults.control_plane.endpoint),
            username: env_string("ONE_USERNAME").unwrap_or(defaults.control_plane.username),
            password: env_secret("ONE_PASSWORD").unwrap_or_default(),
            timeout: Duration::from_secs(env_parse("ONE_TIMEOUT_S", 60u64)?),
            accept_invalid_certs: env_flag("ONE_ACCEPT_INVALID_CERTS"),
        };

        let ipam = match env_string("IPAM_ENDPOINT") {
            Some(endpoint) => Some(IpamSettings {
                endpoint,
                user: env_string("IPAM_USER").unwrap_or_else(|| "nimbus".to_string()),
                network: env_string("IPAM_NETWORK").context("IPAM_NETWORK must be set with IPAM_ENDPOINT")?,
                netmask: env_parse("IPAM_NETMASK", Ipv4Addr::new(255, 255, 255, 0))?,
            }),
            None => None,
        };

        let d = &defaults.bootstrap;
        let bootstrap = BootstrapSettings {
            mgmt_connect_retries: env_parse("MGMT_CONNECT_RETRIES", d.mgmt_connect_retries)?.max(1),
            license_retries: env_parse("LICENSE_RETRIES", d.license_retries)?.max(1),
            retry_interval: Duration::from_secs(env_parse("BOOTSTRAP_RETRY_INTERVAL_S", 10u64)?),
            mgmt_timeout: Duration::from_secs(env_parse("MGMT_TIMEOUT_S", 30u64)?),
            license_days: env_parse("LICENSE_DAYS", d.license_days)?,
            license_capacity: env_parse("LICENSE_CAPACITY", d.license_capacity)?,
        };
        if bootstrap.license_capacity > 0xfff {
            bail!("LICENSE_CAPACITY must fit in 12 bits (max 4095)");
        }

        let provider = env_string("PROVIDER")
            .unwrap_or(defaults.provider)
            .to_lowercase();

        Ok(Self {
            provider,
            control_plane,
            ipam,
            poll_interval: Duration::from_secs(env_parse("POLL_INTERVAL_S", 10u64)?),
            wait_retries: env_parse("INSTANCE_WAIT_RETRIES", defaults.wait_retries)?.max(1),
            max_parallel_nodes: env_parse("MAX_PARALLEL_NODES", defaults.max_parallel_nodes)?.max(1),
            unstoppable_templates: parse_template_patterns(
                std::env::var("UNSTOPPABLE_TEMPLATE_PATTERNS").ok().as_deref(),
            ),
            bootstrap,
        })
    }
}

/// Non-empty, trimmed value of `name`.
fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

// Priority:
// 1) NAME (direct)
// 2) NAME_FILE (read file contents)
fn env_secret(name: &str) -> Option<String> {
    if let Some(direct) = env_string(name) {
        return Some(direct);
    }
    let path = env_string(&format!("{}_FILE", name))?;
    match std::fs::read_to_string(&path) {
        Ok(contents) => Some(contents.trim().to_string()).filter(|v| !v.is_empty()),
        Err(e) => {
            tracing::warn!("⚠️ [settings] cannot read {}_FILE ({}): {}", name, path, e);
            None
        }
    }
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env_string(name) {
        Some(raw) => match raw.parse::<T>() {
            Ok(v) => Ok(v),
            Err(e) => bail!("invalid {}={:?}: {}", name, raw, e),
        },
        None => Ok(default),
    }
}

fn env_flag(name: &str) -> bool {
    env_string(name)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test uses its own variable names; the process environment is shared.

    #[test]
    fn parse_falls_back_to_default() {
        std::env::remove_var("NIMBUS_TEST_UNSET");
        assert_eq!(env_parse("NIMBUS_TEST_UNSET", 7u32).unwrap(), 7);
    }

    #[test]
    fn parse_rejects_garbage() {
        std::env::set_var("NIMBUS_TEST_GARBAGE", "seven");
        let err = env_parse("NIMBUS_TEST_GARBAGE", 7u32).unwrap_err();
        assert!(err.to_string().contains("NIMBUS_TEST_GARBAGE"));
    }

    #[test]
    fn secrets_prefer_direct_value_then_file() {
        let path = std::env::temp_dir().join(format!("nimbus-secret-{}", std::process::id()));
        std::fs::write(&path, "from-file\n").unwrap();
        std::env::set_var("NIMBUS_TEST_SECRET_FILE", &path);

        std::env::remove_var("NIMBUS_TEST_SECRET");
        assert_eq!(env_secret("NIMBUS_TEST_SECRET").as_deref(), Some("from-file"));

        std::env::set_var("NIMBUS_TEST_SECRET", "direct");
        assert_eq!(env_secret("NIMBUS_TEST_SECRET").as_deref(), Some("direct"));
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn flags() {
        std::env::set_var("NIMBUS_TEST_FLAG_ON", "Yes");
        std::env::set_var("NIMBUS_TEST_FLAG_OFF", "0");
        assert!(env_flag("NIMBUS_TEST_FLAG_ON"));
        assert!(!env_flag("NIMBUS_TEST_FLAG_OFF"));
    }
}
