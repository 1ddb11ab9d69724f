// JupyterHub user server commands

use anyhow::Result;
use benchflow_core::{JupyterHub, Operation, SessionOption};
use benchflow_durable::WorkflowClient;
use clap::{Args, Subcommand};

use super::{run_lifecycle, Outcome, RunFlags};

#[derive(Debug, Clone, Subcommand)]
pub enum JupyterHubCommand {
    /// Create the hub user if needed and spawn a named server
    Create(SessionArgs),

    /// Stop and remove a named server
    Delete(SessionArgs),

    /// Spawn a stopped named server
    Start(SessionArgs),

    /// Stop a named server, keeping its definition
    Stop(SessionArgs),
}

#[derive(Debug, Clone, Args)]
pub struct SessionArgs {
    /// Hub user owning the server
    #[arg(long)]
    pub user: String,

    /// Named server of the user
    #[arg(long)]
    pub server: String,
}

impl JupyterHubCommand {
    pub fn operation(&self) -> Operation {
        match self {
            JupyterHubCommand::Create(_) => Operation::Create,
            JupyterHubCommand::Delete(_) => Operation::Delete,
            JupyterHubCommand::Start(_) => Operation::Start,
            JupyterHubCommand::Stop(_) => Operation::Stop,
        }
    }

    pub fn args(&self) -> &SessionArgs {
        match self {
            JupyterHubCommand::Create(args)
            | JupyterHubCommand::Delete(args)
            | JupyterHubCommand::Start(args)
            | JupyterHubCommand::Stop(args) => args,
        }
    }
}

pub async fn run<C: WorkflowClient + ?Sized>(
    command: JupyterHubCommand,
    client: &C,
    flags: RunFlags,
) -> Result<Outcome> {
    let args = command.args();
    let option = SessionOption::new(&args.user, &args.server);
    run_lifecycle::<JupyterHub, _>(client, command.operation(), &option, flags).await
}
