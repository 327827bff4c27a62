// Proxy process supervision: rules, launch, log capture, exit handling

use std::future::Future;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::backends::rules::RuleManager;
use crate::config::AppConfig;
use crate::controller::{Connection, ControllerClient, TrafficStats};
use crate::feed::{LogFeed, LogSubscription};
use crate::history::LogHistory;
use crate::process::{LogEntry, ProcessStatus, ProxyCommand};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("proxy is already running")]
    AlreadyRunning,

    #[error("stop in progress")]
    StopInProgress,

    #[error("proxy is not running")]
    NotRunning,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to apply interception rules: {0:#}")]
    ApplyRules(anyhow::Error),

    #[error("failed to launch proxy: {0}")]
    Launch(#[source] std::io::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("supervisor task failed: {0}")]
    Task(String),
}

/// Timing knobs for stop and restart
#[derive(Debug, Clone, Copy)]
pub struct SupervisorOptions {
    /// Grace period between SIGINT and SIGKILL
    pub stop_timeout: Duration,
    /// How long to wait for the exit watcher after SIGKILL
    pub kill_timeout: Duration,
    /// Pause between stop and start on restart
    pub restart_delay: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(5),
            kill_timeout: Duration::from_secs(5),
            restart_delay: Duration::from_millis(500),
        }
    }
}

/// Live process owned by the exit watcher
struct ProcessHandle {
    generation: u64,
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
    done: watch::Receiver<bool>,
}

#[derive(Default)]
struct State {
    status: ProcessStatus,
    handle: Option<ProcessHandle>,
    /// Config the running process was started with
    active_config: Option<AppConfig>,
    history: LogHistory,
}

struct Inner {
    state: Mutex<State>,
    config: Mutex<AppConfig>,
    rules: Arc<dyn RuleManager>,
    command: ProxyCommand,
    feed: LogFeed,
    options: SupervisorOptions,
    controller: ControllerClient,
    generations: AtomicU64,
}

/// Handle to one supervised proxy process. Clones share the same process.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

async fn cleanup_rules(rules: Arc<dyn RuleManager>, cfg: AppConfig) {
    if let Err(e) = tokio::task::spawn_blocking(move || rules.cleanup(&cfg)).await {
        log::warn!("Rule cleanup task failed: {}", e);
    }
}

/// Wait until the watcher reports completion; false on timeout
async fn wait_done(done: &mut watch::Receiver<bool>, limit: Duration) -> bool {
    matches!(
        tokio::time::timeout(limit, done.wait_for(|finished| *finished)).await,
        Ok(Ok(_))
    )
}

impl Supervisor {
    pub fn new(
        rules: Arc<dyn RuleManager>,
        command: ProxyCommand,
        config: AppConfig,
        controller: ControllerClient,
        options: SupervisorOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                config: Mutex::new(config),
                rules,
                command,
                feed: LogFeed::new(),
                options,
                controller,
                generations: AtomicU64::new(0),
            }),
        }
    }

    /// Apply rules and launch the proxy
    pub async fn start(&self, cancel: &CancellationToken) -> Result<(), SupervisorError> {
        let this = self.clone();
        Self::run_cancellable(cancel, async move { this.start_inner().await }).await
    }

    /// Interrupt the proxy, escalating to a kill after the grace period
    pub async fn stop(&self, cancel: &CancellationToken) -> Result<(), SupervisorError> {
        let this = self.clone();
        Self::run_cancellable(cancel, async move { this.stop_inner().await }).await
    }

    pub async fn restart(&self, cancel: &CancellationToken) -> Result<(), SupervisorError> {
        let this = self.clone();
        Self::run_cancellable(cancel, async move {
            match this.stop_inner().await {
                Ok(()) | Err(SupervisorError::NotRunning) => {}
                Err(e) => return Err(e),
            }
            tokio::time::sleep(this.inner.options.restart_delay).await;
            this.start_inner().await
        })
        .await
    }

    /// Current status and its error message (empty unless in error)
    pub fn status(&self) -> (ProcessStatus, String) {
        let state = self.inner.state.lock().unwrap();
        (state.status.clone(), state.status.message().to_string())
    }

    pub fn logs(&self) -> Vec<LogEntry> {
        self.inner.state.lock().unwrap().history.snapshot()
    }

    pub fn subscribe_logs(&self) -> LogSubscription {
        self.inner.feed.subscribe()
    }

    /// Takes effect on the next start
    pub fn update_config(&self, config: AppConfig) {
        *self.inner.config.lock().unwrap() = config;
    }

    pub fn config(&self) -> AppConfig {
        self.inner.config.lock().unwrap().clone()
    }

    /// Config the current process was started with
    pub fn active_config(&self) -> Option<AppConfig> {
        self.inner.state.lock().unwrap().active_config.clone()
    }

    pub fn pid(&self) -> Option<u32> {
        let state = self.inner.state.lock().unwrap();
        state.handle.as_ref().and_then(|h| h.pid)
    }

    /// Resolve once the current process has exited and been cleaned up.
    /// Returns immediately when nothing is running.
    pub async fn wait(&self) {
        let done = {
            let state = self.inner.state.lock().unwrap();
            state.handle.as_ref().map(|h| h.done.clone())
        };
        if let Some(mut done) = done {
            let _ = done.wait_for(|finished| *finished).await;
        }
    }

    pub async fn get_traffic(&self) -> Result<TrafficStats> {
        self.inner.controller.traffic().await
    }

    pub async fn get_connections(&self) -> Result<Vec<Connection>> {
        self.inner.controller.connections().await
    }

    pub async fn get_proxies(&self) -> Result<serde_json::Value> {
        self.inner.controller.proxies().await
    }

    pub async fn select_proxy(&self, group: &str, name: &str) -> Result<()> {
        self.inner.controller.select_proxy(group, name).await
    }

    pub async fn close_connection(&self, id: &str) -> Result<()> {
        self.inner.controller.close_connection(id).await
    }

    /// Run `work` to completion in its own task; the caller stops waiting
    /// when the token fires but the work itself is never interrupted.
    async fn run_cancellable<F>(
        cancel: &CancellationToken,
        work: F,
    ) -> Result<(), SupervisorError>
    where
        F: Future<Output = Result<(), SupervisorError>> + Send + 'static,
    {
        if cancel.is_cancelled() {
            return Err(SupervisorError::Cancelled);
        }
        let task = tokio::spawn(work);
        tokio::select! {
            res = task => res.map_err(|e| SupervisorError::Task(e.to_string()))?,
            _ = cancel.cancelled() => Err(SupervisorError::Cancelled),
        }
    }

    fn set_status(&self, status: ProcessStatus) {
        self.inner.state.lock().unwrap().status = status;
    }

    /// Record a failed start after rolling back any partial rules
    async fn fail_start(&self, cfg: AppConfig, err: SupervisorError) -> Result<(), SupervisorError> {
        log::error!("Failed to start proxy: {}", err);
        cleanup_rules(self.inner.rules.clone(), cfg).await;
        self.set_status(ProcessStatus::Error(err.to_string()));
        Err(err)
    }

    async fn start_inner(&self) -> Result<(), SupervisorError> {
        let cfg = self.config();
        {
            let mut state = self.inner.state.lock().unwrap();
            match state.status {
                ProcessStatus::Running | ProcessStatus::Starting => {
                    return Err(SupervisorError::AlreadyRunning);
                }
                ProcessStatus::Stopping => return Err(SupervisorError::StopInProgress),
                ProcessStatus::Stopped | ProcessStatus::Error(_) => {}
            }
            state.status = ProcessStatus::Starting;
        }

        if let Err(e) = cfg.validate() {
            let err = SupervisorError::Config(format!("{:#}", e));
            log::error!("{}", err);
            self.set_status(ProcessStatus::Error(err.to_string()));
            return Err(err);
        }

        log::info!("Starting proxy in {} mode: {}", cfg.proxy_mode, self.inner.command);

        let rules = self.inner.rules.clone();
        let apply_cfg = cfg.clone();
        let applied = match tokio::task::spawn_blocking(move || rules.apply(&apply_cfg)).await {
            Ok(res) => res.map_err(SupervisorError::ApplyRules),
            Err(e) => Err(SupervisorError::Task(e.to_string())),
        };
        if let Err(err) = applied {
            return self.fail_start(cfg, err).await;
        }

        let mut child = match Command::new(&self.inner.command.program)
            .args(&self.inner.command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Terminal Ctrl+C must reach the supervisor only
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => return self.fail_start(cfg, SupervisorError::Launch(e)).await,
        };

        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed);
        let (kill_tx, kill_rx) = oneshot::channel();
        let (done_tx, done_rx) = watch::channel(false);

        // Publish the handle before any task can observe an exit
        {
            let mut state = self.inner.state.lock().unwrap();
            state.status = ProcessStatus::Running;
            state.handle = Some(ProcessHandle {
                generation,
                pid,
                kill_tx: Some(kill_tx),
                done: done_rx,
            });
            state.active_config = Some(cfg.clone());
        }
        log::info!("Proxy running (pid {})", pid.map_or("?".to_string(), |p| p.to_string()));

        if let Some(out) = stdout {
            tokio::spawn(self.clone().read_stream(out));
        }
        if let Some(err) = stderr {
            tokio::spawn(self.clone().read_stream(err));
        }
        tokio::spawn(self.clone().watch_exit(child, generation, kill_rx, done_tx, cfg));

        Ok(())
    }

    async fn stop_inner(&self) -> Result<(), SupervisorError> {
        let (generation, pid, kill_tx, mut done) = {
            let mut state = self.inner.state.lock().unwrap();
            if state.status != ProcessStatus::Running {
                return Err(SupervisorError::NotRunning);
            }
            let handle = state.handle.as_mut().ok_or(SupervisorError::NotRunning)?;
            let taken = (
                handle.generation,
                handle.pid,
                handle.kill_tx.take(),
                handle.done.clone(),
            );
            state.status = ProcessStatus::Stopping;
            taken
        };

        log::info!("Stopping proxy");
        if let Some(pid) = pid {
            if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
                log::warn!("Failed to interrupt proxy (pid {}): {}", pid, e);
            }
        }

        let options = self.inner.options;
        if wait_done(&mut done, options.stop_timeout).await {
            return Ok(());
        }

        log::warn!(
            "Proxy did not exit within {:?} of SIGINT, killing it",
            options.stop_timeout
        );
        if let Some(kill_tx) = kill_tx {
            let _ = kill_tx.send(());
        }
        if wait_done(&mut done, options.kill_timeout).await {
            return Ok(());
        }

        // The watcher is stuck on an unkillable process; detach it
        log::error!("Proxy still alive after SIGKILL, forcing cleanup");
        let cfg = {
            let mut state = self.inner.state.lock().unwrap();
            if state.handle.as_ref().map(|h| h.generation) == Some(generation) {
                state.handle = None;
                state.active_config.take()
            } else {
                None
            }
        };
        if let Some(cfg) = cfg {
            cleanup_rules(self.inner.rules.clone(), cfg).await;
        }
        self.set_status(ProcessStatus::Stopped);
        Ok(())
    }

    /// Forward output line by line until EOF. Bytes that are not UTF-8 are
    /// replaced, never fatal: closing the pipe early would SIGPIPE the proxy.
    async fn read_stream<R>(self, stream: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    while matches!(buf.last(), Some(b'\n' | b'\r')) {
                        buf.pop();
                    }
                    self.record(String::from_utf8_lossy(&buf).into_owned());
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("Proxy output stream failed: {}", e);
                    break;
                }
            }
        }
    }

    fn record(&self, line: String) {
        let entry = LogEntry::from_line(line);
        self.inner
            .state
            .lock()
            .unwrap()
            .history
            .push(entry.clone());
        self.inner.feed.publish(&entry);
    }

    async fn watch_exit(
        self,
        mut child: Child,
        generation: u64,
        kill_rx: oneshot::Receiver<()>,
        done_tx: watch::Sender<bool>,
        cfg: AppConfig,
    ) {
        let exit = tokio::select! {
            status = child.wait() => status,
            Ok(()) = kill_rx => {
                if let Err(e) = child.start_kill() {
                    log::warn!("Failed to kill proxy: {}", e);
                }
                child.wait().await
            }
        };
        let exit = match exit {
            Ok(status) => status.to_string(),
            Err(e) => format!("wait failed: {}", e),
        };

        let owner = {
            let state = self.inner.state.lock().unwrap();
            state.handle.as_ref().map(|h| h.generation) == Some(generation)
        };
        if !owner {
            // Stop gave up on this process and already cleaned up
            log::warn!("Detached proxy process finally exited ({})", exit);
            let _ = done_tx.send(true);
            return;
        }

        cleanup_rules(self.inner.rules.clone(), cfg).await;

        {
            let mut state = self.inner.state.lock().unwrap();
            state.status = if state.status == ProcessStatus::Stopping {
                log::info!("Proxy stopped ({})", exit);
                ProcessStatus::Stopped
            } else {
                log::error!("Proxy exited unexpectedly: {}", exit);
                ProcessStatus::Error(format!("proxy exited unexpectedly: {}", exit))
            };
            state.handle = None;
            state.active_config = None;
        }
        let _ = done_tx.send(true);
    }
}
