use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use vdcfleet::client::HttpMethod;
use vdcfleet::humanize::HumanDuration;

#[derive(Parser, Debug)]
#[command(name = "vdcfleet")]
#[command(about = "Signed VDC API calls, job tracking and fleet autoscaling", long_about = None)]
pub struct Cli {
    /// Configuration file (default: $VDCFLEET_CONFIG or config/vdcfleet.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Sign an API call and print the runnable URL, optionally executing it
    Sign(SignArgs),
    /// List fleet VMs with their state and creation time
    Vms(VmsArgs),
    /// Wait for async jobs to finish
    Wait(WaitArgs),
    /// Run one reconciliation to a target size
    Scale(ScaleArgs),
    /// Scale the fleet from the load signal until interrupted
    Autoscale(AutoscaleArgs),
}

#[derive(Args, Debug)]
pub struct SignArgs {
    /// API command name, e.g. listVirtualMachines
    #[arg(short = 'x', long)]
    pub command: String,

    /// Command arguments as a JSON object, e.g. '{"zoneid": "..."}'
    #[arg(short = 'a', long, default_value = "{}")]
    pub arguments: String,

    /// Make the signature expire after this long (e.g. 600, 10m)
    #[arg(short = 't', long)]
    pub expires: Option<HumanDuration>,

    /// Execute the call and print the response
    #[arg(short, long)]
    pub execute: bool,

    /// HTTP method used with --execute
    #[arg(short, long, value_enum)]
    pub method: Option<HttpMethod>,

    /// Write the response body to this file instead of stdout
    #[arg(short, long)]
    pub outfile: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct VmsArgs {
    /// Name prefix of the fleet (default: autoscale.name_prefix)
    #[arg(short, long)]
    pub prefix: Option<String>,

    /// List every VM, not just fleet members
    #[arg(long, conflicts_with = "prefix")]
    pub all: bool,
}

#[derive(Args, Debug)]
pub struct WaitArgs {
    /// Job ids returned by deploy/destroy calls
    #[arg(required = true)]
    pub job_ids: Vec<String>,

    /// Override poll.timeout
    #[arg(long)]
    pub timeout: Option<HumanDuration>,
}

#[derive(Args, Debug)]
#[command(group(clap::ArgGroup::new("size").required(true).args(["target", "load"])))]
pub struct ScaleArgs {
    /// Desired number of running members
    #[arg(long)]
    pub target: Option<usize>,

    /// Load signal to derive the target from (scaling policy applies)
    #[arg(long)]
    pub load: Option<u64>,
}

#[derive(Args, Debug)]
pub struct AutoscaleArgs {
    /// Run a single cycle and exit
    #[arg(long)]
    pub once: bool,
}
