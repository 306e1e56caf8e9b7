//! Typed, env-overridable configuration.
//!
//! Values come from the upstream store's config subtree (global, then
//! per-host overriding it — see [`crate::watcher`]) with every key
//! additionally overridable by a `FELIX_<UPPERCASE_NAME>` environment
//! variable, per the external interface contract.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;

use crate::error::{AgentError, AgentResult};

/// Log severity levels accepted for `LogSeverityFile`/`LogSeveritySys`/
/// `LogSeverityScreen`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSeverity {
    None,
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogSeverity {
    fn parse(value: &str) -> AgentResult<Self> {
        match value.to_ascii_lowercase().as_str() {
            "none" => Ok(LogSeverity::None),
            "debug" => Ok(LogSeverity::Debug),
            "info" => Ok(LogSeverity::Info),
            "warning" => Ok(LogSeverity::Warning),
            "error" => Ok(LogSeverity::Error),
            "critical" => Ok(LogSeverity::Critical),
            other => Err(AgentError::configuration(format!(
                "unrecognised log severity '{other}'"
            ))),
        }
    }
}

/// Fully resolved runtime configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    pub startup_cleanup_delay: Duration,
    pub metadata_addr: Option<IpAddr>,
    pub metadata_port: Option<u16>,
    pub resync_interval: Option<Duration>,
    pub interface_prefix: String,
    pub log_file_path: Option<String>,
    pub log_severity_file: LogSeverity,
    pub log_severity_sys: LogSeverity,
    pub log_severity_screen: LogSeverity,
    pub reporting_interval: Duration,
    pub reporting_ttl: Duration,
    pub ip_in_ip_enabled: bool,
    pub hostname: String,
}

impl AgentConfig {
    /// Build and validate a config from merged store config keys (global
    /// overridden by per-host) plus process environment overrides, the
    /// same precedence the watcher's LOAD_CONFIG state applies.
    pub fn from_keys(keys: &BTreeMap<String, String>, os_hostname: &str) -> AgentResult<Self> {
        let builder = ConfigBuilder::new(keys);
        builder.build(os_hostname)
    }
}

/// The raw OS hostname, used as the default for the `Hostname` config key
/// before any store or `FELIX_HOSTNAME` override is applied.
pub fn os_hostname() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

struct ConfigBuilder<'a> {
    keys: &'a BTreeMap<String, String>,
}

impl<'a> ConfigBuilder<'a> {
    fn new(keys: &'a BTreeMap<String, String>) -> Self {
        Self { keys }
    }

    /// Resolve one named key: environment override wins, else the merged
    /// store value, else `None`.
    fn resolve(&self, name: &str) -> Option<String> {
        let env_name = format!("FELIX_{}", name.to_ascii_uppercase());
        if let Ok(value) = std::env::var(&env_name) {
            return Some(value);
        }
        self.keys.get(name).cloned()
    }

    fn build(&self, os_hostname: &str) -> AgentResult<AgentConfig> {
        let startup_cleanup_delay = self
            .resolve("StartupCleanupDelay")
            .map(|v| parse_secs(&v, "StartupCleanupDelay"))
            .transpose()?
            .unwrap_or(30);

        let metadata_addr = match self.resolve("MetadataAddr") {
            None => None,
            Some(v) if v.eq_ignore_ascii_case("none") => None,
            Some(v) => Some(v.parse::<IpAddr>().map_err(|_| {
                AgentError::configuration(format!("invalid MetadataAddr '{v}'"))
            })?),
        };

        let metadata_port = match self.resolve("MetadataPort") {
            None => None,
            Some(v) => {
                let port: u32 = v
                    .parse()
                    .map_err(|_| AgentError::configuration(format!("invalid MetadataPort '{v}'")))?;
                if port == 0 || port > 65535 {
                    return Err(AgentError::configuration(format!(
                        "MetadataPort '{port}' out of range 1..65535"
                    )));
                }
                Some(port as u16)
            }
        };

        let resync_interval = {
            let secs = self
                .resolve("ResyncIntervalSecs")
                .map(|v| parse_secs(&v, "ResyncIntervalSecs"))
                .transpose()?
                .unwrap_or(1800);
            if secs == 0 {
                None
            } else {
                Some(Duration::from_secs(secs))
            }
        };

        let interface_prefix = self.resolve("InterfacePrefix").ok_or_else(|| {
            AgentError::configuration("InterfacePrefix is required and has no default")
        })?;

        let log_file_path = match self.resolve("LogFilePath") {
            None => None,
            Some(v) if v.eq_ignore_ascii_case("none") => None,
            Some(v) => Some(v),
        };

        let log_severity_file = self
            .resolve("LogSeverityFile")
            .map(|v| LogSeverity::parse(&v))
            .transpose()?
            .unwrap_or(LogSeverity::Info);
        let log_severity_sys = self
            .resolve("LogSeveritySys")
            .map(|v| LogSeverity::parse(&v))
            .transpose()?
            .unwrap_or(LogSeverity::Info);
        let log_severity_screen = self
            .resolve("LogSeverityScreen")
            .map(|v| LogSeverity::parse(&v))
            .transpose()?
            .unwrap_or(LogSeverity::None);

        let reporting_interval = Duration::from_secs(
            self.resolve("ReportingIntervalSecs")
                .map(|v| parse_secs(&v, "ReportingIntervalSecs"))
                .transpose()?
                .unwrap_or(30),
        );
        let reporting_ttl = Duration::from_secs(
            self.resolve("ReportingTTLSecs")
                .map(|v| parse_secs(&v, "ReportingTTLSecs"))
                .transpose()?
                .unwrap_or(90),
        );

        let ip_in_ip_enabled = match self.resolve("IpInIpEnabled") {
            None => false,
            Some(v) => parse_bool(&v)?,
        };

        let hostname = self.resolve("Hostname").unwrap_or_else(|| os_hostname.to_string());

        Ok(AgentConfig {
            startup_cleanup_delay: Duration::from_secs(startup_cleanup_delay),
            metadata_addr,
            metadata_port,
            resync_interval,
            interface_prefix,
            log_file_path,
            log_severity_file,
            log_severity_sys,
            log_severity_screen,
            reporting_interval,
            reporting_ttl,
            ip_in_ip_enabled,
            hostname,
        })
    }
}

fn parse_secs(value: &str, name: &str) -> AgentResult<u64> {
    value
        .parse()
        .map_err(|_| AgentError::configuration(format!("invalid integer for {name}: '{value}'")))
}

fn parse_bool(value: &str) -> AgentResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(AgentError::configuration(format!(
            "invalid boolean value '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys_with(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn requires_interface_prefix() {
        let keys = keys_with(&[]);
        let result = AgentConfig::from_keys(&keys, "host-a");
        assert!(result.is_err());
    }

    #[test]
    fn applies_defaults_when_interface_prefix_present() {
        let keys = keys_with(&[("InterfacePrefix", "cali")]);
        let cfg = AgentConfig::from_keys(&keys, "host-a").unwrap();
        assert_eq!(cfg.startup_cleanup_delay, Duration::from_secs(30));
        assert_eq!(cfg.resync_interval, Some(Duration::from_secs(1800)));
        assert_eq!(cfg.interface_prefix, "cali");
        assert_eq!(cfg.hostname, "host-a");
        assert!(!cfg.ip_in_ip_enabled);
    }

    #[test]
    fn zero_resync_interval_disables_periodic_resync() {
        let keys = keys_with(&[("InterfacePrefix", "cali"), ("ResyncIntervalSecs", "0")]);
        let cfg = AgentConfig::from_keys(&keys, "host-a").unwrap();
        assert_eq!(cfg.resync_interval, None);
    }

    #[test]
    fn metadata_port_out_of_range_is_rejected() {
        let keys = keys_with(&[("InterfacePrefix", "cali"), ("MetadataPort", "70000")]);
        assert!(AgentConfig::from_keys(&keys, "host-a").is_err());
    }

    #[test]
    fn none_string_is_treated_as_absent_for_metadata_addr() {
        let keys = keys_with(&[("InterfacePrefix", "cali"), ("MetadataAddr", "none")]);
        let cfg = AgentConfig::from_keys(&keys, "host-a").unwrap();
        assert_eq!(cfg.metadata_addr, None);
    }

    #[test]
    fn environment_override_wins_over_store_value() {
        let keys = keys_with(&[("InterfacePrefix", "cali-from-store")]);
        std::env::set_var("FELIX_INTERFACEPREFIX", "cali-from-env");
        let cfg = AgentConfig::from_keys(&keys, "host-a").unwrap();
        std::env::remove_var("FELIX_INTERFACEPREFIX");
        assert_eq!(cfg.interface_prefix, "cali-from-env");
    }
}
