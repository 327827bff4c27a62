// External tool invocation (nft, iptables, ip)
//
// All kernel state changes go through `CommandRunner` so rule plans can be
// exercised without touching the host.

use anyhow::{Result, anyhow};
use std::fmt;
use std::io::{self, Write};
use std::process::{Command, Stdio};

/// Substrings tools print when the object to delete is already gone
const ALREADY_GONE: &[&str] = &[
    "No such file or directory",
    "does not exist",
    "No chain/target/match by that name",
    "Bad rule",
];

/// A single external command: program, arguments, optional stdin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
}

impl Invocation {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            stdin: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Program and arguments joined with spaces (stdin not included)
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.command_line())
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// Exit code, `None` if killed by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    #[cfg(test)]
    pub fn ok() -> Self {
        Self {
            code: Some(0),
            ..Default::default()
        }
    }

    #[cfg(test)]
    pub fn failed(code: i32, stderr: &str) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }
}

/// Runs external tools and captures their output
pub trait CommandRunner: Send + Sync {
    fn run(&self, invocation: &Invocation) -> io::Result<ToolOutput>;
}

/// Runs commands on the host with `std::process::Command`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, invocation: &Invocation) -> io::Result<ToolOutput> {
        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(if invocation.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let mut write_error = None;
        if let (Some(input), Some(mut pipe)) = (&invocation.stdin, child.stdin.take()) {
            if let Err(e) = pipe.write_all(input.as_bytes()) {
                write_error = Some(e);
            }
            // pipe dropped here so the tool sees EOF
        }

        // Always reap; the tool's own exit and stderr explain a broken pipe
        let output = child.wait_with_output()?;
        let result = ToolOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        match write_error {
            Some(e) if result.success() => Err(e),
            Some(e) => {
                log::debug!("Writing stdin of {} failed: {}", invocation, e);
                Ok(result)
            }
            None => Ok(result),
        }
    }
}

/// What to do when a step's command fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnFailure {
    /// Abort the plan and report the tool output
    Abort,
    /// Treat as success if stderr contains one of these substrings
    Tolerate(&'static [&'static str]),
    /// Log and continue
    Ignore,
}

/// One command of a rule plan together with its failure policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub cmd: Invocation,
    pub on_failure: OnFailure,
}

impl Step {
    pub fn required(cmd: Invocation) -> Self {
        Self {
            cmd,
            on_failure: OnFailure::Abort,
        }
    }

    pub fn tolerate(cmd: Invocation, allowed: &'static [&'static str]) -> Self {
        Self {
            cmd,
            on_failure: OnFailure::Tolerate(allowed),
        }
    }

    pub fn best_effort(cmd: Invocation) -> Self {
        Self {
            cmd,
            on_failure: OnFailure::Ignore,
        }
    }
}

fn describe_failure(cmd: &Invocation, output: &ToolOutput) -> anyhow::Error {
    let code = output
        .code
        .map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string());
    let detail = if output.stderr.trim().is_empty() {
        output.stdout.trim()
    } else {
        output.stderr.trim()
    };
    anyhow!("`{}` failed (exit {}): {}", cmd.command_line(), code, detail)
}

fn spawn_error(cmd: &Invocation, err: io::Error) -> anyhow::Error {
    if err.kind() == io::ErrorKind::NotFound {
        anyhow!(
            "`{}` not found (install nftables or iptables)",
            cmd.program
        )
    } else {
        anyhow::Error::new(err).context(format!("Failed to run `{}`", cmd.command_line()))
    }
}

/// Run a plan in order, stopping at the first failure that is not allowed
pub fn execute(runner: &dyn CommandRunner, steps: &[Step]) -> Result<()> {
    for step in steps {
        log::debug!("Running: {}", step.cmd.command_line());

        let output = match runner.run(&step.cmd) {
            Ok(output) => output,
            Err(e) => match step.on_failure {
                OnFailure::Ignore => {
                    log::debug!("Ignoring spawn failure of {}: {}", step.cmd, e);
                    continue;
                }
                _ => return Err(spawn_error(&step.cmd, e)),
            },
        };

        if output.success() {
            continue;
        }

        match step.on_failure {
            OnFailure::Abort => return Err(describe_failure(&step.cmd, &output)),
            OnFailure::Tolerate(allowed) => {
                if allowed.iter().any(|s| output.stderr.contains(s)) {
                    log::debug!("Tolerated: {} ({})", step.cmd, output.stderr.trim());
                } else {
                    return Err(describe_failure(&step.cmd, &output));
                }
            }
            OnFailure::Ignore => {
                log::debug!("Ignoring failure: {} ({})", step.cmd, output.stderr.trim());
            }
        }
    }
    Ok(())
}

/// Run every step regardless of failures; returns how many steps failed.
///
/// Failures caused by the object already being absent are expected here and
/// only logged at debug level.
pub fn execute_best_effort(runner: &dyn CommandRunner, steps: &[Step]) -> usize {
    let mut failures = 0;
    for step in steps {
        log::debug!("Running: {}", step.cmd.command_line());
        match runner.run(&step.cmd) {
            Ok(output) if output.success() => {}
            Ok(output) => {
                failures += 1;
                let stderr = output.stderr.trim();
                if ALREADY_GONE.iter().any(|s| stderr.contains(s)) {
                    log::debug!("{}: already removed", step.cmd);
                } else {
                    log::warn!("Cleanup step `{}` failed: {}", step.cmd, stderr);
                }
            }
            Err(e) => {
                failures += 1;
                log::debug!("Cleanup step `{}` could not run: {}", step.cmd, e);
            }
        }
    }
    failures
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    type Responder = Box<dyn Fn(&Invocation) -> io::Result<ToolOutput> + Send + Sync>;

    /// Records every invocation and answers with a scripted result
    pub struct RecordingRunner {
        calls: Mutex<Vec<Invocation>>,
        respond: Responder,
    }

    impl RecordingRunner {
        /// Every command succeeds
        #[cfg(test)]
    pub fn ok() -> Self {
            Self::with(|_| Ok(ToolOutput::ok()))
        }

        pub fn with<F>(respond: F) -> Self
        where
            F: Fn(&Invocation) -> io::Result<ToolOutput> + Send + Sync + 'static,
        {
            Self {
                calls: Mutex::new(Vec::new()),
                respond: Box::new(respond),
            }
        }

        pub fn calls(&self) -> Vec<Invocation> {
            self.calls.lock().unwrap().clone()
        }

        pub fn command_lines(&self) -> Vec<String> {
            self.calls().iter().map(|c| c.command_line()).collect()
        }
    }

    impl CommandRunner for RecordingRunner {
        fn run(&self, invocation: &Invocation) -> io::Result<ToolOutput> {
            self.calls.lock().unwrap().push(invocation.clone());
            (self.respond)(invocation)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingRunner;
    use super::*;

    #[test]
    fn test_execute_stops_at_first_abort() {
        let runner = RecordingRunner::with(|inv| {
            if inv.args.first().map(String::as_str) == Some("second") {
                Ok(ToolOutput::failed(1, "Error: syntax error"))
            } else {
                Ok(ToolOutput::ok())
            }
        });
        let steps = vec![
            Step::required(Invocation::new("tool").args(["first"])),
            Step::required(Invocation::new("tool").args(["second"])),
            Step::required(Invocation::new("tool").args(["third"])),
        ];

        let err = execute(&runner, &steps).unwrap_err();
        assert!(err.to_string().contains("tool second"));
        assert!(err.to_string().contains("syntax error"));
        assert_eq!(runner.calls().len(), 2);
    }

    #[test]
    fn test_tolerated_failure_continues() {
        let runner = RecordingRunner::with(|inv| {
            if inv.program == "ip" {
                Ok(ToolOutput::failed(2, "RTNETLINK answers: File exists"))
            } else {
                Ok(ToolOutput::ok())
            }
        });
        let steps = vec![
            Step::tolerate(Invocation::new("ip").args(["rule", "add"]), &["File exists"]),
            Step::required(Invocation::new("nft").args(["list", "ruleset"])),
        ];

        execute(&runner, &steps).unwrap();
        assert_eq!(runner.calls().len(), 2);
    }

    #[test]
    fn test_tolerate_rejects_other_errors() {
        let runner = RecordingRunner::with(|_| Ok(ToolOutput::failed(2, "Operation not permitted")));
        let steps = vec![Step::tolerate(
            Invocation::new("ip").args(["rule", "add"]),
            &["File exists"],
        )];
        assert!(execute(&runner, &steps).is_err());
    }

    #[test]
    fn test_missing_tool_is_reported() {
        let runner = RecordingRunner::with(|_| Err(io::Error::from(io::ErrorKind::NotFound)));
        let steps = vec![Step::required(Invocation::new("iptables").args(["-L"]))];

        let err = execute(&runner, &steps).unwrap_err();
        assert!(err.to_string().contains("`iptables` not found"));
    }

    #[test]
    fn test_best_effort_runs_everything() {
        let runner = RecordingRunner::with(|_| {
            Ok(ToolOutput::failed(1, "Error: No such file or directory"))
        });
        let steps: Vec<Step> = (0..5)
            .map(|i| Step::best_effort(Invocation::new("nft").args([i.to_string()])))
            .collect();

        assert_eq!(execute_best_effort(&runner, &steps), 5);
        assert_eq!(runner.calls().len(), 5);
    }

    #[test]
    fn test_system_runner_captures_output() {
        let output = SystemRunner
            .run(&Invocation::new("sh").args(["-c", "cat; echo oops >&2; exit 3"]).stdin("piped in"))
            .unwrap();
        assert_eq!(output.code, Some(3));
        assert_eq!(output.stdout, "piped in");
        assert_eq!(output.stderr.trim(), "oops");
        assert!(!output.success());
    }

    #[test]
    fn test_system_runner_reports_tool_that_closed_stdin() {
        // Larger than a pipe buffer so the write hits EPIPE
        let input = "x".repeat(1 << 20);
        let output = SystemRunner
            .run(
                &Invocation::new("sh")
                    .args(["-c", "exec 0<&-; echo refused >&2; exit 4"])
                    .stdin(input),
            )
            .unwrap();
        assert_eq!(output.code, Some(4));
        assert_eq!(output.stderr.trim(), "refused");
    }
}
