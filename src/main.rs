mod cli;

use bothost::config::{ConfigManager, EnvConfigManager};
use clap::Parser;
use cli::{Cli, CliContext, Commands, run, stats};

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let context = CliContext::new(ConfigManager(EnvConfigManager::new(cli.env_file.clone())));

    match cli.command.unwrap_or(Commands::Run(run::RunArgs::default_runtime())) {
        Commands::Run(args) => run::execute(args, &context).await,
        Commands::Stats => stats::execute_stats(&context).await,
        Commands::Inspect(args) => stats::execute_inspect(args, &context).await,
    }
}
