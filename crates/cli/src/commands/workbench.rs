// Workbench instance commands

use anyhow::Result;
use benchflow_core::{InstanceOption, Operation, Workbench};
use benchflow_durable::WorkflowClient;
use clap::{Args, Subcommand};

use super::{run_lifecycle, Outcome, RunFlags};

#[derive(Debug, Clone, Subcommand)]
pub enum WorkbenchCommand {
    /// Create a workbench instance and wait until it is reachable
    Create(CreateArgs),

    /// Delete a workbench instance
    Delete(InstanceArgs),

    /// Start a stopped workbench instance
    Start(InstanceArgs),

    /// Stop a running workbench instance
    Stop(InstanceArgs),
}

/// Flags identifying an instance
#[derive(Debug, Clone, Args)]
pub struct InstanceArgs {
    /// Name of the workbench instance
    #[arg(long)]
    pub name: String,

    /// Zone of the workbench instance
    #[arg(long, default_value = "asia-northeast1-a")]
    pub zone: String,

    /// Location of the subnetwork
    #[arg(long, default_value = "asia-northeast1")]
    pub location: String,

    /// Google Cloud project ID
    #[arg(long, default_value = "gcp-sample")]
    pub project_id: String,
}

#[derive(Debug, Clone, Args)]
pub struct CreateArgs {
    #[command(flatten)]
    pub instance: InstanceArgs,

    /// Google account email of the instance owner
    #[arg(long)]
    pub email: String,

    #[arg(long, default_value = "n1-standard-1")]
    pub machine_type: String,

    /// VPC network the instance belongs to
    #[arg(long, default_value = "default")]
    pub network: String,

    /// VPC subnet the instance belongs to
    #[arg(long, default_value = "default")]
    pub subnet: String,
}

impl InstanceArgs {
    fn into_option(self) -> InstanceOption {
        InstanceOption {
            name: self.name,
            zone: self.zone,
            location: self.location,
            project_id: self.project_id,
            ..InstanceOption::default()
        }
    }
}

impl CreateArgs {
    fn into_option(self) -> InstanceOption {
        InstanceOption {
            email: self.email,
            machine_type: self.machine_type,
            network: self.network,
            subnet: self.subnet,
            ..self.instance.into_option()
        }
    }
}

impl WorkbenchCommand {
    pub fn operation(&self) -> Operation {
        match self {
            WorkbenchCommand::Create(_) => Operation::Create,
            WorkbenchCommand::Delete(_) => Operation::Delete,
            WorkbenchCommand::Start(_) => Operation::Start,
            WorkbenchCommand::Stop(_) => Operation::Stop,
        }
    }

    pub fn into_option(self) -> InstanceOption {
        match self {
            WorkbenchCommand::Create(args) => args.into_option(),
            WorkbenchCommand::Delete(args)
            | WorkbenchCommand::Start(args)
            | WorkbenchCommand::Stop(args) => args.into_option(),
        }
    }
}

pub async fn run<C: WorkflowClient + ?Sized>(
    command: WorkbenchCommand,
    client: &C,
    flags: RunFlags,
) -> Result<Outcome> {
    let op = command.operation();
    let option = command.into_option();
    run_lifecycle::<Workbench, _>(client, op, &option, flags).await
}
