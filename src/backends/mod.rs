// Rule backend selection and shared types

pub mod command;
pub mod rules;

use std::fmt;

use command::{CommandRunner, Invocation};

/// Kernel rule-management tool in use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleBackend {
    Nftables,
    Iptables,
}

impl RuleBackend {
    pub fn name(&self) -> &'static str {
        match self {
            RuleBackend::Nftables => "nftables",
            RuleBackend::Iptables => "iptables",
        }
    }
}

impl fmt::Display for RuleBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Check for nftables, falling back to legacy iptables.
///
/// Not cached: the host can change between apply and cleanup.
pub fn detect_backend(runner: &dyn CommandRunner) -> RuleBackend {
    let backend = match runner.run(&Invocation::new("nft").args(["--version"])) {
        Ok(output) if output.success() => RuleBackend::Nftables,
        Ok(output) => {
            log::debug!("nft --version exited with {:?}", output.code);
            RuleBackend::Iptables
        }
        Err(e) => {
            log::debug!("nft not available: {}", e);
            RuleBackend::Iptables
        }
    };
    log::debug!("Using {} backend", backend);
    backend
}

#[cfg(test)]
mod tests {
    use super::command::ToolOutput;
    use super::command::testing::RecordingRunner;
    use super::*;
    use std::io;

    #[test]
    fn test_detect_nftables() {
        let runner = RecordingRunner::ok();
        assert_eq!(detect_backend(&runner), RuleBackend::Nftables);
        assert_eq!(runner.command_lines(), vec!["nft --version"]);
    }

    #[test]
    fn test_detect_falls_back_when_nft_missing() {
        let runner = RecordingRunner::with(|_| Err(io::Error::from(io::ErrorKind::NotFound)));
        assert_eq!(detect_backend(&runner), RuleBackend::Iptables);
    }

    #[test]
    fn test_detect_falls_back_when_nft_fails() {
        let runner = RecordingRunner::with(|_| Ok(ToolOutput::failed(1, "netlink: Error")));
        assert_eq!(detect_backend(&runner), RuleBackend::Iptables);
    }
}
