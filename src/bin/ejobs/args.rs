use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(about, long_about = None, version)]
pub(crate) struct Args {
    /// Configuration file.
    #[arg(short, long, default_value = "jobs.yaml")]
    pub(crate) config: PathBuf,
    /// Enables human-friendly logging.
    #[arg(short, long, default_value_t)]
    pub(crate) debug: bool,
    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Consumes the configured pipelines, running a command for every job.
    ///
    /// The payload is written to the command's stdin, and the job is
    /// described by the EJOBS_ID, EJOBS_JOB, EJOBS_PIPELINE and
    /// EJOBS_ATTEMPT variables. A non-zero exit fails the job.
    Serve {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        cmd: Vec<String>,
    },
    /// Pushes one job and prints its id.
    Push {
        /// Job name, matched against the dispatch rules.
        job: String,
        #[arg(short, long, default_value = "")]
        payload: String,
        /// Overrides the pipeline picked by the dispatch rules.
        #[arg(long)]
        pipeline: Option<String>,
        /// Delay in milliseconds.
        #[arg(long, default_value_t)]
        delay: u64,
        /// Attempts before the job is buried, 0 for unlimited.
        #[arg(long, default_value_t)]
        max_attempts: u32,
    },
    /// Prints the stats of every pipeline as YAML.
    Stat,
}
