mod backends;
mod config;
mod controller;
mod feed;
mod history;
mod process;
mod supervisor;

use anyhow::{Result, anyhow, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use crate::backends::command::Step;
use crate::backends::rules::{RuleManager, RuleOrchestrator};
use crate::config::AppConfig;
use crate::controller::{ControllerClient, DEFAULT_CONTROLLER};
use crate::process::{LogEntry, ProxyCommand};
use crate::supervisor::{Supervisor, SupervisorError, SupervisorOptions};

/// Format bytes as human-readable string (e.g., "1.5 MB", "500 KB")
fn human_readable(bytes: i64) -> String {
    const KB: i64 = 1024;
    const MB: i64 = KB * 1024;
    const GB: i64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// proxyward - run a sing-box proxy with transparent traffic interception
#[derive(Parser, Debug)]
#[command(name = "proxyward")]
#[command(version)]
#[command(about = "Supervise a sing-box proxy and divert host traffic into it", long_about = None)]
struct Args {
    /// Interception settings (mode, ports, LAN exposure)
    #[arg(long, value_name = "PATH", default_value = "/etc/proxyward/app.json", global = true)]
    app_config: PathBuf,

    /// Proxy binary
    #[arg(long, value_name = "PATH", default_value = "/usr/local/bin/sing-box", global = true)]
    singbox: PathBuf,

    /// Proxy configuration passed to `run -c`
    #[arg(long, value_name = "PATH", default_value = "/etc/proxyward/config.json", global = true)]
    config: PathBuf,

    /// Controller API of the running proxy
    #[arg(long, value_name = "URL", default_value = DEFAULT_CONTROLLER, global = true)]
    controller: String,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Apply rules, run the proxy in the foreground and stream its logs until Ctrl+C
    Run,

    /// Inspect or change interception rules without running the proxy
    #[command(subcommand)]
    Rules(RulesCmd),

    /// Print the rule backend that would be used
    Backend,

    /// Current upload/download rate
    Traffic,

    /// List active connections
    Connections {
        /// Print raw JSON
        #[arg(long)]
        json: bool,
    },

    /// Dump proxy groups as JSON
    Proxies,

    /// Select NAME in selector GROUP
    Select { group: String, name: String },

    /// Close a connection by id
    Close { id: String },
}

#[derive(Subcommand, Debug)]
enum RulesCmd {
    /// Print the apply and cleanup plans for the detected backend
    Show,
    /// Install rules for the configured mode
    Apply,
    /// Remove every rule this tool may have installed
    Cleanup,
}

fn require_root() -> Result<()> {
    if !nix::unistd::Uid::effective().is_root() {
        bail!("Changing firewall rules requires root (try sudo)");
    }
    Ok(())
}

fn print_plan(title: &str, plan: &[Step]) {
    println!("{}:", title);
    for step in plan {
        println!("  {}", step.cmd.command_line());
        if let Some(script) = &step.cmd.stdin {
            for line in script.lines() {
                println!("    | {}", line);
            }
        }
    }
    println!();
}

fn print_entry(entry: &LogEntry) {
    println!(
        "{} {:>5} {}",
        entry.time.format("%H:%M:%S"),
        entry.level,
        entry.message
    );
}

fn build_supervisor(args: &Args, app: AppConfig) -> Result<Supervisor> {
    Ok(Supervisor::new(
        Arc::new(RuleOrchestrator::system()),
        ProxyCommand::sing_box(&args.singbox, &args.config),
        app,
        ControllerClient::new(args.controller.as_str())?,
        SupervisorOptions::default(),
    ))
}

async fn run_foreground(supervisor: Supervisor) -> Result<()> {
    require_root()?;

    let cancel = CancellationToken::new();
    let mut logs = supervisor.subscribe_logs();

    supervisor.start(&cancel).await?;
    if let Some(active) = supervisor.active_config() {
        println!(
            "proxyward: proxy running (pid {}) in {} mode{}, press Ctrl+C to stop",
            supervisor
                .pid()
                .map_or("?".to_string(), |p| p.to_string()),
            active.proxy_mode,
            active
                .intercept_port()
                .map_or(String::new(), |port| format!(" on port {}", port))
        );
    }

    loop {
        tokio::select! {
            Some(entry) = logs.recv() => print_entry(&entry),
            _ = supervisor.wait() => {
                while let Some(entry) = logs.try_recv() {
                    print_entry(&entry);
                }
                let (status, message) = supervisor.status();
                if !message.is_empty() {
                    return Err(anyhow!("{}", message));
                }
                println!("proxyward: proxy {}", status);
                return Ok(());
            }
            _ = signal::ctrl_c() => {
                println!("\nReceived Ctrl+C, stopping proxy...");
                match supervisor.stop(&cancel).await {
                    Ok(()) | Err(SupervisorError::NotRunning) => {}
                    Err(e) => return Err(e.into()),
                }
                println!("proxyward: proxy {}", supervisor.status().0);
                return Ok(());
            }
        }
    }
}

async fn run_rules(cmd: &RulesCmd, app: &AppConfig) -> Result<()> {
    let orchestrator = RuleOrchestrator::system();
    match cmd {
        RulesCmd::Show => {
            let backend = orchestrator.backend();
            println!("Backend: {}  Mode: {}\n", backend, app.proxy_mode);
            print_plan("Apply", &RuleOrchestrator::apply_plan(backend, app));
            print_plan("Cleanup", &RuleOrchestrator::cleanup_plan(backend));
        }
        RulesCmd::Apply => {
            require_root()?;
            let app = app.clone();
            tokio::task::spawn_blocking(move || orchestrator.apply(&app)).await??;
            println!("Interception rules applied");
        }
        RulesCmd::Cleanup => {
            require_root()?;
            let app = app.clone();
            tokio::task::spawn_blocking(move || orchestrator.cleanup(&app)).await?;
            println!("Interception rules removed");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if std::env::var("RUST_LOG").is_ok() {
        pretty_env_logger::formatted_builder()
            .parse_default_env()
            .init();
    }

    let app = AppConfig::load(&args.app_config)?;

    match &args.command {
        Cmd::Run => run_foreground(build_supervisor(&args, app)?).await?,
        Cmd::Rules(cmd) => run_rules(cmd, &app).await?,
        Cmd::Backend => {
            let backend = RuleOrchestrator::system().backend();
            println!("{}", backend);
        }
        Cmd::Traffic => {
            let stats = build_supervisor(&args, app)?.get_traffic().await?;
            println!(
                "up {}/s  down {}/s",
                human_readable(stats.up),
                human_readable(stats.down)
            );
        }
        Cmd::Connections { json } => {
            let conns = build_supervisor(&args, app)?.get_connections().await?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&conns)?);
            } else {
                for conn in &conns {
                    let target = if conn.metadata.host.is_empty() {
                        conn.metadata.destination_ip.as_str()
                    } else {
                        conn.metadata.host.as_str()
                    };
                    println!(
                        "{}  {:<4} {}:{}  ↑{} ↓{}  {}",
                        conn.id,
                        conn.metadata.network,
                        target,
                        conn.metadata.destination_port,
                        human_readable(conn.upload),
                        human_readable(conn.download),
                        conn.chains.join(" <- ")
                    );
                }
                println!("{} connection(s)", conns.len());
            }
        }
        Cmd::Proxies => {
            let proxies = build_supervisor(&args, app)?.get_proxies().await?;
            println!("{}", serde_json::to_string_pretty(&proxies)?);
        }
        Cmd::Select { group, name } => {
            build_supervisor(&args, app)?.select_proxy(group, name).await?;
            println!("Selected {} in {}", name, group);
        }
        Cmd::Close { id } => {
            build_supervisor(&args, app)?.close_connection(id).await?;
            println!("Closed {}", id);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_human_readable() {
        assert_eq!(human_readable(512), "512 B");
        assert_eq!(human_readable(1536), "1.5 KB");
        assert_eq!(human_readable(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let args = Args::try_parse_from(["proxyward", "select", "proxy", "tokyo-01"]).unwrap();
        assert!(matches!(args.command, Cmd::Select { ref group, ref name } if group == "proxy" && name == "tokyo-01"));
        assert_eq!(args.app_config, PathBuf::from("/etc/proxyward/app.json"));

        let args =
            Args::try_parse_from(["proxyward", "rules", "show", "--app-config", "/tmp/app.json"])
                .unwrap();
        assert!(matches!(args.command, Cmd::Rules(RulesCmd::Show)));
        assert_eq!(args.app_config, PathBuf::from("/tmp/app.json"));
    }
}
