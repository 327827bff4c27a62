// nftables rule plans
//
// Each table is rendered as one script and loaded atomically with `nft -f -`.

use std::fmt::Write;

use super::{FW_MARK, LAN_TABLE_NAME, TABLE_NAME, TUN_INTERFACE, routing};
use crate::backends::command::{Invocation, Step};
use crate::config::{AppConfig, InterceptionMode};

/// Tables this crate may create, as (family, name)
const TABLES: [(&str, &str); 3] = [
    ("inet", TABLE_NAME),
    ("ip", TABLE_NAME),
    ("inet", LAN_TABLE_NAME),
];

/// Start a script that replaces `family name` if it already exists.
///
/// `add` is a no-op for an existing table and makes the following `delete`
/// safe on a clean host.
fn table_header(family: &str, name: &str) -> String {
    format!(
        "add table {family} {name}\ndelete table {family} {name}\ntable {family} {name} {{\n"
    )
}

fn bypass_set(script: &mut String, bypass: &[&str]) {
    script.push_str("    set bypass_ipv4 {\n");
    script.push_str("        type ipv4_addr\n");
    script.push_str("        flags interval\n");
    let _ = writeln!(script, "        elements = {{ {} }}", bypass.join(", "));
    script.push_str("    }\n");
}

fn chain(script: &mut String, name: &str, hook: &str, rules: &[String]) {
    let _ = writeln!(script, "    chain {name} {{");
    let _ = writeln!(script, "        {hook}; policy accept;");
    for rule in rules {
        let _ = writeln!(script, "        {rule}");
    }
    script.push_str("    }\n");
}

fn load(script: String) -> Step {
    Step::required(Invocation::new("nft").args(["-f", "-"]).stdin(script))
}

fn tun_script() -> String {
    let mut script = table_header("inet", TABLE_NAME);
    chain(
        &mut script,
        "prerouting",
        "type filter hook prerouting priority mangle",
        &[
            format!("iifname \"{TUN_INTERFACE}\" accept"),
            format!("meta mark {FW_MARK} accept"),
        ],
    );
    chain(
        &mut script,
        "output",
        "type route hook output priority mangle",
        &[
            format!("meta mark {FW_MARK} accept"),
            "meta skgid 0 meta skuid 0 accept".to_string(),
        ],
    );
    script.push_str("}\n");
    script
}

fn tproxy_script(port: u16, bypass: &[&str]) -> String {
    let mut script = table_header("inet", TABLE_NAME);
    bypass_set(&mut script, bypass);
    chain(
        &mut script,
        "prerouting",
        "type filter hook prerouting priority mangle",
        &[
            format!("meta mark {FW_MARK} accept"),
            "ip daddr @bypass_ipv4 accept".to_string(),
            format!("meta l4proto tcp tproxy ip to 127.0.0.1:{port} meta mark set {FW_MARK} accept"),
            format!("meta l4proto udp tproxy ip to 127.0.0.1:{port} meta mark set {FW_MARK} accept"),
        ],
    );
    chain(
        &mut script,
        "output",
        "type route hook output priority mangle",
        &[
            format!("meta mark {FW_MARK} accept"),
            "ip daddr @bypass_ipv4 accept".to_string(),
            format!("meta l4proto {{ tcp, udp }} meta mark set {FW_MARK} accept"),
        ],
    );
    script.push_str("}\n");
    script
}

fn lan_script() -> String {
    let mut script = table_header("inet", LAN_TABLE_NAME);
    chain(
        &mut script,
        "forward",
        "type filter hook forward priority mangle",
        &[format!(
            "meta l4proto {{ tcp, udp }} meta mark set {FW_MARK} accept"
        )],
    );
    script.push_str("}\n");
    script
}

fn redirect_script(port: u16, bypass: &[&str]) -> String {
    let mut script = table_header("ip", TABLE_NAME);
    bypass_set(&mut script, bypass);
    chain(
        &mut script,
        "prerouting",
        "type nat hook prerouting priority dstnat",
        &[
            "ip daddr @bypass_ipv4 accept".to_string(),
            format!("meta l4proto tcp redirect to :{port}"),
        ],
    );
    chain(
        &mut script,
        "output",
        "type nat hook output priority -100",
        &[
            "ip daddr @bypass_ipv4 accept".to_string(),
            "meta skuid 0 accept".to_string(),
            format!("meta l4proto tcp redirect to :{port}"),
        ],
    );
    script.push_str("}\n");
    script
}

pub fn apply_plan(cfg: &AppConfig, bypass: &[&str]) -> Vec<Step> {
    match cfg.proxy_mode {
        InterceptionMode::Tun => vec![load(tun_script())],
        InterceptionMode::Tproxy => {
            let mut script = tproxy_script(cfg.tproxy_port, bypass);
            if cfg.lan_proxy {
                script.push_str(&lan_script());
            }
            let mut steps = vec![load(script)];
            steps.extend(routing::apply_steps());
            steps
        }
        InterceptionMode::Redirect => vec![load(redirect_script(cfg.redir_port, bypass))],
    }
}

/// Remove every table and the policy route, whatever mode created them
pub fn cleanup_plan() -> Vec<Step> {
    let mut steps: Vec<Step> = TABLES
        .iter()
        .map(|&(family, name)| {
            Step::best_effort(Invocation::new("nft").args(["delete", "table", family, name]))
        })
        .collect();
    steps.extend(routing::cleanup_steps());
    steps
}
