use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub mod run;
pub mod stats;

use run::RunArgs;
use stats::InspectArgs;

use bothost::config::ConfigManager;

#[derive(Parser, Debug)]
#[command(
    name = "bothost",
    about = "Host many Telegram bots behind one webhook",
    version = "0.1.0"
)]
pub struct Cli {
    /// Settings file loaded before reading the environment
    #[arg(long, global = true, default_value = ".env")]
    pub env_file: PathBuf,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the platform (default)
    Run(RunArgs),

    /// Print registry totals
    Stats,

    /// Show one hosted bot by its short id
    Inspect(InspectArgs),
}

#[derive(Clone)]
pub struct CliContext {
    pub config_manager: ConfigManager,
}

impl CliContext {
    pub fn new(config_manager: ConfigManager) -> Self {
        Self { config_manager }
    }
}
