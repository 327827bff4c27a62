use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fmt;
use std::path::Path;

/// Lifecycle state of the supervised proxy process
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ProcessStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    Error(String),
}

impl ProcessStatus {
    /// Status name without the error payload ("stopped", "running", ...)
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::Stopped => "stopped",
            ProcessStatus::Starting => "starting",
            ProcessStatus::Running => "running",
            ProcessStatus::Stopping => "stopping",
            ProcessStatus::Error(_) => "error",
        }
    }

    /// Error message, empty for every non-error state
    pub fn message(&self) -> &str {
        match self {
            ProcessStatus::Error(msg) => msg,
            _ => "",
        }
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessStatus::Error(msg) if !msg.is_empty() => write!(f, "error: {}", msg),
            other => f.write_str(other.as_str()),
        }
    }
}

impl Serialize for ProcessStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Infer severity from a raw proxy log line.
    ///
    /// Case-insensitive substring match; the truncated keywords also catch
    /// sing-box's four-letter level tags (`ERRO`, `DEBU`).
    pub fn classify(line: &str) -> Self {
        let lower = line.to_lowercase();
        if lower.contains("erro") {
            LogLevel::Error
        } else if lower.contains("warn") {
            LogLevel::Warn
        } else if lower.contains("debu") {
            LogLevel::Debug
        } else {
            LogLevel::Info
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.pad(s)
    }
}

/// One captured line of proxy output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub time: DateTime<Local>,
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    /// Build an entry for a line that just arrived
    pub fn from_line(line: impl Into<String>) -> Self {
        let message = line.into();
        Self {
            time: Local::now(),
            level: LogLevel::classify(&message),
            message,
        }
    }
}

/// Program and arguments used to launch the proxy
#[derive(Debug, Clone)]
pub struct ProxyCommand {
    pub program: OsString,
    pub args: Vec<OsString>,
}

impl ProxyCommand {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// `<bin> run -c <config>`
    pub fn sing_box(binary: &Path, config: &Path) -> Self {
        Self::new(binary.as_os_str())
            .arg("run")
            .arg("-c")
            .arg(config.as_os_str())
    }
}

impl fmt::Display for ProxyCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}
