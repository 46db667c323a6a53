use clap::Parser;
use clap::Subcommand;
use std::path::PathBuf;

use crate::readiness_gate::GateKind;

#[derive(Debug, Parser)]
#[clap(name = "provision-gate", version)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Command,

    /// -2 error, -1 warn, 0 info, 1 debug, 2 and above trace. RUST_LOG takes precedence.
    #[clap(long, default_value_t = 0, global = true, allow_negative_numbers = true)]
    pub log_verbosity: i8,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run the API calls of a job definition once the target is healthy.
    Job {
        /// Path to the job definition, `-` for stdin.
        #[clap(long, default_value = "-")]
        jobdef: String,

        /// Readiness gate completed by this job.
        #[clap(long, default_value_t = GateKind::PostProvision)]
        gate: GateKind,
    },

    /// Keep Pod readiness gate conditions in sync with their target.
    Reconciler {
        #[clap(short, long)]
        config: Option<PathBuf>,

        /// Overrides the namespace of the config file.
        #[clap(short, long)]
        namespace: Option<String>,
    },
}

impl Cli {
    pub fn log_directive(&self) -> &'static str {
        match self.log_verbosity {
            i8::MIN..=-2 => "error",
            -1 => "warn",
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}
