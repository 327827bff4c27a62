// Policy routing for marked packets (TPROXY)

use super::{FW_MARK, ROUTE_TABLE};
use crate::backends::command::{Invocation, Step};

fn rule_args(action: &str) -> Vec<String> {
    vec![
        "rule".to_string(),
        action.to_string(),
        "fwmark".to_string(),
        FW_MARK.to_string(),
        "table".to_string(),
        ROUTE_TABLE.to_string(),
    ]
}

fn route_args(action: &str) -> Vec<String> {
    ["route", action, "local", "default", "dev", "lo", "table"]
        .iter()
        .map(|s| s.to_string())
        .chain(std::iter::once(ROUTE_TABLE.to_string()))
        .collect()
}

/// Send marked packets to loopback through the dedicated table
pub fn apply_steps() -> Vec<Step> {
    vec![
        Step::tolerate(Invocation::new("ip").args(rule_args("add")), &["File exists"]),
        Step::tolerate(Invocation::new("ip").args(route_args("add")), &["File exists"]),
    ]
}

pub fn cleanup_steps() -> Vec<Step> {
    vec![
        Step::best_effort(Invocation::new("ip").args(rule_args("del"))),
        Step::best_effort(Invocation::new("ip").args(route_args("del"))),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::command::OnFailure;

    #[test]
    fn test_route_commands() {
        let lines: Vec<String> = apply_steps().iter().map(|s| s.cmd.command_line()).collect();
        assert_eq!(
            lines,
            vec![
                "ip rule add fwmark 1 table 100",
                "ip route add local default dev lo table 100",
            ]
        );

        let lines: Vec<String> = cleanup_steps().iter().map(|s| s.cmd.command_line()).collect();
        assert_eq!(
            lines,
            vec![
                "ip rule del fwmark 1 table 100",
                "ip route del local default dev lo table 100",
            ]
        );
        assert!(
            cleanup_steps()
                .iter()
                .all(|s| s.on_failure == OnFailure::Ignore)
        );
    }
}
