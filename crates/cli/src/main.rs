// Benchflow starter CLI
//
// Design Decision: Use clap derive for argument parsing, one subcommand tree per resource kind.
// Design Decision: Talk to the worker's engine frontend over HTTP only.
// Design Decision: Exit non-zero on any submission or completion failure.

mod commands;
mod output;

use anyhow::{Context, Result};
use benchflow_core::telemetry::{init_telemetry, TelemetryConfig};
use benchflow_durable::HttpWorkflowClient;
use clap::{Parser, Subcommand};

use commands::jupyterhub::JupyterHubCommand;
use commands::workbench::WorkbenchCommand;
use commands::RunFlags;
use output::OutputFormat;

#[derive(Debug, Parser)]
#[command(name = "benchflow")]
#[command(about = "Trigger lifecycle workflows for workbench instances and JupyterHub servers")]
#[command(version)]
pub struct Cli {
    /// Engine frontend to connect to, in "<host>:<port>" format
    #[arg(
        long,
        global = true,
        env = "BENCHFLOW_FRONTEND_ADDR",
        default_value = "localhost:7233",
        value_parser = parse_frontend_addr
    )]
    pub frontend_addr: String,

    /// Log filter, e.g. "debug" or "benchflow_core=trace"
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Output format for the final result
    #[arg(long, short, global = true, value_enum, default_value_t = OutputFormat::Text)]
    pub output: OutputFormat,

    #[command(flatten)]
    pub flags: RunFlags,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Manage workbench notebook instances
    Workbench {
        #[command(subcommand)]
        command: WorkbenchCommand,
    },

    /// Manage JupyterHub user servers
    Jupyterhub {
        #[command(subcommand)]
        command: JupyterHubCommand,
    },
}

/// Accept `host:port` with a non-empty host and a numeric port
fn parse_frontend_addr(value: &str) -> Result<String, String> {
    let (host, port) = value
        .rsplit_once(':')
        .ok_or_else(|| format!("'{value}' is not in <host>:<port> format"))?;
    if host.is_empty() {
        return Err(format!("'{value}' has an empty host"));
    }
    port.parse::<u16>()
        .map_err(|_| format!("'{value}' has an invalid port"))?;
    Ok(value.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let telemetry =
        TelemetryConfig::from_env("benchflow").with_log_filter(cli.log_level.clone());
    init_telemetry(&telemetry).context("Failed to initialize logging")?;

    tracing::debug!(frontend_addr = %cli.frontend_addr, "Connecting to engine frontend");
    let client = HttpWorkflowClient::new(&cli.frontend_addr);

    let outcome = match cli.command {
        Commands::Workbench { command } => {
            commands::workbench::run(command, &client, cli.flags).await?
        }
        Commands::Jupyterhub { command } => {
            commands::jupyterhub::run(command, &client, cli.flags).await?
        }
    };
    commands::report(&outcome, cli.output)
}
