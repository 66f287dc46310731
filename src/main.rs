use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;

use driftsync::config::{Config, DEFAULT_CONFIG_FILE};
use driftsync::console::{summary_line, ConsoleStatus};
use driftsync::logging;
use driftsync::runner::{self, HostOutcome};

/// Mirror a local directory to SSH, FTP or local targets.
#[derive(Parser, Debug)]
#[command(name = "driftsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
enum Commands {
    /// Sync every enabled host once
    Deploy {
        /// Only these hosts (repeatable)
        #[arg(long = "host")]
        hosts: Vec<String>,
    },

    /// Watch the source tree and push changes until Ctrl-C
    Watch {
        /// Only these hosts (repeatable)
        #[arg(long = "host")]
        hosts: Vec<String>,
    },

    /// List configured hosts
    Hosts,
}

#[tokio::main]
async fn main() {
    match run().await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("{}: {:#}", "error".red().bold(), e);
            std::process::exit(1);
        }
    }
}

/// Returns whether every host succeeded.
async fn run() -> Result<bool> {
    let cli = Cli::parse();
    if let Err(e) = logging::init(cli.verbose) {
        eprintln!("{}: could not set up logging: {}", "warning".yellow(), e);
    }

    let config = Config::load(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;

    match cli.command {
        Commands::Deploy { hosts } => {
            let status = Arc::new(ConsoleStatus::new(false));
            let outcomes = runner::deploy(&config, &hosts, status).await?;
            Ok(print_outcomes(&outcomes))
        }
        Commands::Watch { hosts } => {
            let status = Arc::new(ConsoleStatus::new(true));
            let shutdown = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!("cannot listen for Ctrl-C: {}", e);
                    std::future::pending::<()>().await;
                }
            };
            let outcomes = runner::watch(&config, &hosts, status, shutdown).await?;
            Ok(print_outcomes(&outcomes))
        }
        Commands::Hosts => {
            list_hosts(&config);
            Ok(true)
        }
    }
}

fn print_outcomes(outcomes: &[HostOutcome]) -> bool {
    for outcome in outcomes {
        match &outcome.result {
            Ok(report) => println!("{}", summary_line(report)),
            Err(e) => println!("{} {} {:#}", "✗".red().bold(), outcome.name.bold(), e),
        }
    }
    outcomes.iter().all(HostOutcome::is_success)
}

fn list_hosts(config: &Config) {
    if config.hosts.is_empty() {
        println!("No hosts configured.");
        return;
    }
    for (name, host) in &config.hosts {
        let endpoint = match &host.host {
            Some(address) => format!(
                "{}@{}:{}",
                host.user.as_deref().unwrap_or(""),
                address,
                host.port.or(host.protocol.default_port()).unwrap_or_default()
            ),
            None => String::new(),
        };
        let state = if host.enabled {
            "enabled".green()
        } else {
            "disabled".dimmed()
        };
        println!(
            "{:<16} {:<6} {:<8} {} -> {} {}",
            name.bold(),
            host.protocol.short_name(),
            state,
            host.source_path.display(),
            host.dest_path,
            endpoint
        );
    }
}
