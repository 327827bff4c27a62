// Interception rule orchestration across nftables and iptables

pub mod iptables;
pub mod nftables;
pub mod routing;

use anyhow::{Context, Result};
use std::net::Ipv4Addr;
use std::sync::Arc;

use super::command::{self, CommandRunner, Step, SystemRunner};
use super::{RuleBackend, detect_backend};
use crate::config::{AppConfig, parse_ipv4_cidr};

/// Packet mark shared by every mode and backend
pub const FW_MARK: u32 = 1;

/// Policy routing table consulted for marked packets
pub const ROUTE_TABLE: u32 = 100;

pub const TABLE_NAME: &str = "proxyward";
pub const LAN_TABLE_NAME: &str = "proxyward_lan";

/// Interface the proxy creates in TUN mode
pub const TUN_INTERFACE: &str = "tun0";

/// Reserved, private and special-purpose IPv4 ranges that are never intercepted
pub const BYPASS_IPV4: [&str; 14] = [
    "0.0.0.0/8",
    "10.0.0.0/8",
    "100.64.0.0/10",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "172.16.0.0/12",
    "192.0.0.0/24",
    "192.168.0.0/16",
    "198.18.0.0/15",
    "198.51.100.0/24",
    "203.0.113.0/24",
    "224.0.0.0/4",
    "240.0.0.0/4",
    "255.255.255.255/32",
];

fn network(addr: Ipv4Addr, len: u8) -> u32 {
    let mask = if len == 0 { 0 } else { u32::MAX << (32 - len) };
    u32::from(addr) & mask
}

/// `outer` minus `inner`, where `inner` lies inside `outer`: one sibling
/// block per prefix length between the two
fn exclude(outer: (u32, u8), inner: (u32, u8)) -> Vec<String> {
    ((outer.1 + 1)..=inner.1)
        .map(|len| {
            let bit = 1u32 << (32 - len);
            let sibling = network(Ipv4Addr::from(inner.0 ^ bit), len);
            format!("{}/{}", Ipv4Addr::from(sibling), len)
        })
        .collect()
}

/// Bypass set for this config.
///
/// A configured fake-IP pool is carved out so its addresses reach the proxy:
/// ranges inside the pool are dropped and a range covering the pool is split
/// around it.
pub fn bypass_ranges(cfg: &AppConfig) -> Vec<String> {
    let pool = cfg
        .fake_ip_range
        .as_deref()
        .and_then(|range| parse_ipv4_cidr(range).ok())
        .map(|(addr, len)| (network(addr, len), len));

    let mut ranges = Vec::new();
    for cidr in BYPASS_IPV4 {
        let Some(pool) = pool else {
            ranges.push(cidr.to_string());
            continue;
        };
        let range = match parse_ipv4_cidr(cidr) {
            Ok((addr, len)) => (network(addr, len), len),
            Err(_) => continue,
        };
        let shorter = range.1.min(pool.1);
        if network(Ipv4Addr::from(range.0), shorter) != network(Ipv4Addr::from(pool.0), shorter) {
            ranges.push(cidr.to_string());
        } else if range.1 < pool.1 {
            log::debug!("Splitting bypass range {} around fake-IP pool", cidr);
            ranges.extend(exclude(range, pool));
        } else {
            log::debug!("Dropping bypass range {} inside fake-IP pool", cidr);
        }
    }
    ranges
}

/// Installs and removes interception rules.
///
/// `cleanup` never fails: every removal step is attempted on its own and
/// problems are only logged.
pub trait RuleManager: Send + Sync {
    fn apply(&self, cfg: &AppConfig) -> Result<()>;
    fn cleanup(&self, cfg: &AppConfig);
}

/// Renders rule plans for the detected backend and runs them
pub struct RuleOrchestrator {
    runner: Arc<dyn CommandRunner>,
}

impl RuleOrchestrator {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Orchestrator that changes the host's rules
    pub fn system() -> Self {
        Self::new(Arc::new(SystemRunner))
    }

    pub fn backend(&self) -> RuleBackend {
        detect_backend(self.runner.as_ref())
    }

    pub fn apply_plan(backend: RuleBackend, cfg: &AppConfig) -> Vec<Step> {
        let ranges = bypass_ranges(cfg);
        let bypass: Vec<&str> = ranges.iter().map(String::as_str).collect();
        match backend {
            RuleBackend::Nftables => nftables::apply_plan(cfg, &bypass),
            RuleBackend::Iptables => iptables::apply_plan(cfg, &bypass),
        }
    }

    pub fn cleanup_plan(backend: RuleBackend) -> Vec<Step> {
        match backend {
            RuleBackend::Nftables => nftables::cleanup_plan(),
            RuleBackend::Iptables => iptables::cleanup_plan(),
        }
    }
}

impl RuleManager for RuleOrchestrator {
    fn apply(&self, cfg: &AppConfig) -> Result<()> {
        cfg.validate()?;
        let backend = self.backend();
        log::info!("Applying {} rules with {}", cfg.proxy_mode, backend);

        let plan = Self::apply_plan(backend, cfg);
        command::execute(self.runner.as_ref(), &plan)
            .context(format!("Failed to apply {} rules", cfg.proxy_mode))?;

        log::info!("Interception rules installed ({} steps)", plan.len());
        Ok(())
    }

    fn cleanup(&self, _cfg: &AppConfig) {
        // Mode-independent: whatever an earlier apply left behind goes
        let backend = self.backend();
        let plan = Self::cleanup_plan(backend);
        let failed = command::execute_best_effort(self.runner.as_ref(), &plan);
        log::info!(
            "Removed interception rules with {} ({} of {} steps had nothing to do or failed)",
            backend,
            failed,
            plan.len()
        );
    }
}
