// Legacy iptables rule plans

use super::{FW_MARK, TUN_INTERFACE, routing};
use crate::backends::command::{Invocation, Step};
use crate::config::{AppConfig, InterceptionMode};

const CHAIN: &str = "PROXYWARD";
const CHAIN_LOCAL: &str = "PROXYWARD_LOCAL";
const CHAIN_LAN: &str = "PROXYWARD_LAN";
const CHAIN_TUN: &str = "PROXYWARD_TUN";

/// Chains this crate may create, as (table, chain)
const CHAINS: [(&str, &str); 5] = [
    ("mangle", CHAIN),
    ("mangle", CHAIN_LOCAL),
    ("mangle", CHAIN_LAN),
    ("mangle", CHAIN_TUN),
    ("nat", CHAIN),
];

/// A jump from a built-in chain into one of ours
struct Jump {
    table: &'static str,
    hook: &'static str,
    matches: &'static [&'static str],
    target: &'static str,
}

const TUN_JUMP: Jump = Jump {
    table: "mangle",
    hook: "PREROUTING",
    matches: &[],
    target: CHAIN_TUN,
};

const TPROXY_JUMP: Jump = Jump {
    table: "mangle",
    hook: "PREROUTING",
    matches: &[],
    target: CHAIN,
};

const LOCAL_JUMP: Jump = Jump {
    table: "mangle",
    hook: "OUTPUT",
    matches: &[],
    target: CHAIN_LOCAL,
};

const LAN_JUMP: Jump = Jump {
    table: "mangle",
    hook: "FORWARD",
    matches: &[],
    target: CHAIN_LAN,
};

const REDIRECT_JUMP: Jump = Jump {
    table: "nat",
    hook: "PREROUTING",
    matches: &["-p", "tcp"],
    target: CHAIN,
};

const REDIRECT_LOCAL_JUMP: Jump = Jump {
    table: "nat",
    hook: "OUTPUT",
    matches: &["-p", "tcp", "-m", "owner", "!", "--uid-owner", "0"],
    target: CHAIN,
};

const ALL_JUMPS: [&Jump; 6] = [
    &TUN_JUMP,
    &TPROXY_JUMP,
    &LOCAL_JUMP,
    &LAN_JUMP,
    &REDIRECT_JUMP,
    &REDIRECT_LOCAL_JUMP,
];

fn iptables<I, S>(table: &str, args: I) -> Invocation
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    Invocation::new("iptables").args(["-t", table]).args(args)
}

impl Jump {
    fn invocation(&self, action: &str) -> Invocation {
        iptables(self.table, [action, self.hook])
            .args(self.matches.iter().copied())
            .args(["-j", self.target])
    }

    /// Delete any previous copy first so re-applying never duplicates the jump
    fn install(&self) -> Vec<Step> {
        vec![
            Step::best_effort(self.invocation("-D")),
            Step::required(self.invocation("-A")),
        ]
    }

    fn remove(&self) -> Step {
        Step::best_effort(self.invocation("-D"))
    }
}

/// Create (or reuse) a chain and flush it
fn fresh_chain(table: &str, chain: &str) -> Vec<Step> {
    vec![
        Step::tolerate(iptables(table, ["-N", chain]), &["Chain already exists"]),
        Step::required(iptables(table, ["-F", chain])),
    ]
}

fn append(table: &str, chain: &str, rule: &[&str]) -> Step {
    Step::required(iptables(table, ["-A", chain]).args(rule.iter().copied()))
}

fn bypass_returns(table: &str, chain: &str, bypass: &[&str]) -> Vec<Step> {
    bypass
        .iter()
        .map(|&cidr| append(table, chain, &["-d", cidr, "-j", "RETURN"]))
        .collect()
}

fn tun_plan() -> Vec<Step> {
    let mark = FW_MARK.to_string();
    let mut steps = fresh_chain("mangle", CHAIN_TUN);
    steps.push(append("mangle", CHAIN_TUN, &["-i", TUN_INTERFACE, "-j", "ACCEPT"]));
    steps.push(append("mangle", CHAIN_TUN, &["-m", "mark", "--mark", &mark, "-j", "ACCEPT"]));
    steps.extend(TUN_JUMP.install());
    steps
}

fn tproxy_plan(port: u16, lan: bool, bypass: &[&str]) -> Vec<Step> {
    let mark = FW_MARK.to_string();
    let port = port.to_string();
    let mut steps = Vec::new();

    steps.extend(fresh_chain("mangle", CHAIN));
    steps.push(append("mangle", CHAIN, &["-m", "mark", "--mark", &mark, "-j", "RETURN"]));
    steps.extend(bypass_returns("mangle", CHAIN, bypass));
    for proto in ["tcp", "udp"] {
        steps.push(append(
            "mangle",
            CHAIN,
            &[
                "-p", proto, "-j", "TPROXY", "--on-ip", "127.0.0.1", "--on-port", &port,
                "--tproxy-mark", &mark,
            ],
        ));
    }

    steps.extend(fresh_chain("mangle", CHAIN_LOCAL));
    steps.push(append("mangle", CHAIN_LOCAL, &["-m", "mark", "--mark", &mark, "-j", "RETURN"]));
    steps.extend(bypass_returns("mangle", CHAIN_LOCAL, bypass));
    for proto in ["tcp", "udp"] {
        steps.push(append(
            "mangle",
            CHAIN_LOCAL,
            &["-p", proto, "-j", "MARK", "--set-mark", &mark],
        ));
    }

    steps.extend(TPROXY_JUMP.install());
    steps.extend(LOCAL_JUMP.install());

    if lan {
        steps.extend(fresh_chain("mangle", CHAIN_LAN));
        for proto in ["tcp", "udp"] {
            steps.push(append(
                "mangle",
                CHAIN_LAN,
                &["-p", proto, "-j", "MARK", "--set-mark", &mark],
            ));
        }
        steps.extend(LAN_JUMP.install());
    }

    steps.extend(routing::apply_steps());
    steps
}

fn redirect_plan(port: u16, bypass: &[&str]) -> Vec<Step> {
    let port = port.to_string();
    let mut steps = fresh_chain("nat", CHAIN);
    steps.extend(bypass_returns("nat", CHAIN, bypass));
    steps.push(append("nat", CHAIN, &["-p", "tcp", "-j", "REDIRECT", "--to-ports", &port]));
    steps.extend(REDIRECT_JUMP.install());
    steps.extend(REDIRECT_LOCAL_JUMP.install());
    steps
}

pub fn apply_plan(cfg: &AppConfig, bypass: &[&str]) -> Vec<Step> {
    match cfg.proxy_mode {
        InterceptionMode::Tun => tun_plan(),
        InterceptionMode::Tproxy => tproxy_plan(cfg.tproxy_port, cfg.lan_proxy, bypass),
        InterceptionMode::Redirect => redirect_plan(cfg.redir_port, bypass),
    }
}

/// Unhook, flush and delete every chain, then drop the policy route
pub fn cleanup_plan() -> Vec<Step> {
    let mut steps: Vec<Step> = ALL_JUMPS.iter().map(|jump| jump.remove()).collect();
    for (table, chain) in CHAINS {
        steps.push(Step::best_effort(iptables(table, ["-F", chain])));
        steps.push(Step::best_effort(iptables(table, ["-X", chain])));
    }
    steps.extend(routing::cleanup_steps());
    steps
}
