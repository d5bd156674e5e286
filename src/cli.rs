//! Command-line surface (spec §4.10, ambient supplement), in the teacher's
//! `clap` derive style.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::types::ReportFormat;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
    /// Increase verbosity (can be supplied multiple times).
    #[arg(short, long, global = true, default_value_t = 1)]
    pub verbosity: usize,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a starter config file.
    Init(InitArgs),
    /// Run a scan against a config file.
    Run(RunArgs),
}

#[derive(Args)]
pub struct InitArgs {
    /// Where to write the starter config.
    #[arg(short, long, default_value = "lava.yaml")]
    pub output: PathBuf,
    /// Overwrite an existing file.
    #[arg(short, long, default_value_t = false)]
    pub force: bool,
}

#[derive(Args)]
pub struct RunArgs {
    /// Path to the run config.
    #[arg(short, long, default_value = "lava.yaml")]
    pub config: PathBuf,
    /// Override the config's report format.
    #[arg(short, long, value_enum)]
    pub format: Option<ReportFormatArg>,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum ReportFormatArg {
    Human,
    Json,
}

impl From<ReportFormatArg> for ReportFormat {
    fn from(value: ReportFormatArg) -> Self {
        match value {
            ReportFormatArg::Human => ReportFormat::Human,
            ReportFormatArg::Json => ReportFormat::Json,
        }
    }
}
