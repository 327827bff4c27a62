// Interception settings supplied by the config store

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

/// How traffic is diverted into the proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterceptionMode {
    /// Proxy owns a TUN device and routes by itself
    #[serde(rename = "tun")]
    Tun,
    /// TPROXY + fwmark policy routing
    #[serde(rename = "tproxy")]
    Tproxy,
    /// NAT REDIRECT of TCP
    #[serde(rename = "redir", alias = "redirect")]
    Redirect,
}

impl Default for InterceptionMode {
    fn default() -> Self {
        InterceptionMode::Tun
    }
}

impl fmt::Display for InterceptionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterceptionMode::Tun => write!(f, "tun"),
            InterceptionMode::Tproxy => write!(f, "tproxy"),
            InterceptionMode::Redirect => write!(f, "redir"),
        }
    }
}

/// Interception settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub proxy_mode: InterceptionMode,

    /// Transparent proxy listen port
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    #[serde(default = "default_redir_port")]
    pub redir_port: u16,

    #[serde(default = "default_tproxy_port")]
    pub tproxy_port: u16,

    /// HTTP+SOCKS5 mixed port for local clients
    #[serde(default = "default_mixed_port")]
    pub mixed_port: u16,

    /// Expose the proxy to the LAN (mark forwarded traffic too)
    #[serde(default)]
    pub lan_proxy: bool,

    #[serde(default)]
    pub auto_start: bool,

    /// Fake-IP pool handed out by the proxy's DNS; removed from the bypass set
    /// when set so fake-IP destinations are still intercepted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fake_ip_range: Option<String>,
}

fn default_listen_port() -> u16 {
    7890
}

fn default_redir_port() -> u16 {
    7892
}

fn default_tproxy_port() -> u16 {
    7893
}

fn default_mixed_port() -> u16 {
    7890
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            proxy_mode: InterceptionMode::Tun,
            listen_port: default_listen_port(),
            redir_port: default_redir_port(),
            tproxy_port: default_tproxy_port(),
            mixed_port: default_mixed_port(),
            lan_proxy: false,
            auto_start: false,
            fake_ip_range: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from disk, falling back to defaults if missing
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("Config file {:?} not found, using defaults", path);
            return Ok(AppConfig::default());
        }

        let contents =
            fs::read_to_string(path).context(format!("Failed to read config file: {:?}", path))?;

        let config: AppConfig =
            serde_json::from_str(&contents).context("Failed to parse config file")?;

        log::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Reject settings the rule renderers cannot express
    pub fn validate(&self) -> Result<()> {
        let (name, port) = match self.proxy_mode {
            InterceptionMode::Tun => ("mixed_port", self.mixed_port),
            InterceptionMode::Tproxy => ("tproxy_port", self.tproxy_port),
            InterceptionMode::Redirect => ("redir_port", self.redir_port),
        };
        if port == 0 {
            return Err(anyhow!("{} must be non-zero in {} mode", name, self.proxy_mode));
        }
        if self.mixed_port == 0 {
            return Err(anyhow!("mixed_port must be non-zero"));
        }
        if let Some(range) = &self.fake_ip_range {
            parse_ipv4_cidr(range).context("Invalid fake_ip_range")?;
        }
        Ok(())
    }

    /// Port the interception rules point at for the configured mode
    pub fn intercept_port(&self) -> Option<u16> {
        match self.proxy_mode {
            InterceptionMode::Tun => None,
            InterceptionMode::Tproxy => Some(self.tproxy_port),
            InterceptionMode::Redirect => Some(self.redir_port),
        }
    }
}

/// Parse "a.b.c.d/len" into address and prefix length
pub fn parse_ipv4_cidr(cidr: &str) -> Result<(Ipv4Addr, u8)> {
    let (addr, len) = cidr
        .split_once('/')
        .ok_or_else(|| anyhow!("missing prefix length in {:?}", cidr))?;
    let addr: Ipv4Addr = addr
        .trim()
        .parse()
        .context(format!("bad address in {:?}", cidr))?;
    let len: u8 = len
        .trim()
        .parse()
        .context(format!("bad prefix length in {:?}", cidr))?;
    if len > 32 {
        return Err(anyhow!("prefix length {} out of range in {:?}", len, cidr));
    }
    Ok((addr, len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_serialization() {
        let config = AppConfig {
            proxy_mode: InterceptionMode::Redirect,
            lan_proxy: true,
            ..AppConfig::default()
        };

        let json = serde_json::to_string_pretty(&config).unwrap();
        assert!(json.contains("\"proxy_mode\": \"redir\""));

        let deserialized: AppConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, config);
    }

    #[test]
    fn test_partial_config_gets_defaults() {
        let config: AppConfig = serde_json::from_str(r#"{"proxy_mode": "tproxy"}"#).unwrap();
        assert_eq!(config.proxy_mode, InterceptionMode::Tproxy);
        assert_eq!(config.tproxy_port, 7893);
        assert_eq!(config.redir_port, 7892);
        assert_eq!(config.mixed_port, 7890);
        assert!(!config.lan_proxy);
    }

    #[test]
    fn test_redirect_alias() {
        let config: AppConfig = serde_json::from_str(r#"{"proxy_mode": "redirect"}"#).unwrap();
        assert_eq!(config.proxy_mode, InterceptionMode::Redirect);
    }

    #[test]
    fn test_unknown_mode_rejected() {
        assert!(serde_json::from_str::<AppConfig>(r#"{"proxy_mode": "socks"}"#).is_err());
    }

    #[test]
    fn test_validate_zero_port() {
        let config = AppConfig {
            proxy_mode: InterceptionMode::Tproxy,
            tproxy_port: 0,
            ..AppConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("tproxy_port"));

        // Unused port may be zero
        let config = AppConfig {
            proxy_mode: InterceptionMode::Redirect,
            tproxy_port: 0,
            ..AppConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_fake_ip_range() {
        let mut config = AppConfig::default();
        config.fake_ip_range = Some("198.18.0.0/15".to_string());
        assert!(config.validate().is_ok());

        config.fake_ip_range = Some("198.18.0.0".to_string());
        assert!(config.validate().is_err());

        config.fake_ip_range = Some("198.18.0.0/40".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(&dir.path().join("app.json")).unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_load_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"proxy_mode": "tproxy", "tproxy_port": 12345, "lan_proxy": true}}"#
        )
        .unwrap();

        let config = AppConfig::load(file.path()).unwrap();
        assert_eq!(config.proxy_mode, InterceptionMode::Tproxy);
        assert_eq!(config.tproxy_port, 12345);
        assert!(config.lan_proxy);
        assert_eq!(config.intercept_port(), Some(12345));
    }

    #[test]
    fn test_load_garbage_fails() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(AppConfig::load(file.path()).is_err());
    }
}
