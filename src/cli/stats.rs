//! Offline views of the registry. These read the database directly and do
//! not need a running platform.

use anyhow::{Context, bail};
use clap::Args;

use super::CliContext;
use bothost::config::database_path;
use bothost::registry::{SqliteRegistry, TenantRegistry};

#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Short id shown in the bot list and webhook path
    pub short_id: String,
}

async fn open(context: &CliContext) -> anyhow::Result<SqliteRegistry> {
    let path = database_path(&context.config_manager).await;
    if !path.exists() {
        bail!("no registry at {}, has the platform been run yet?", path.display());
    }
    SqliteRegistry::open(&path).with_context(|| format!("opening {}", path.display()))
}

pub async fn execute_stats(context: &CliContext) -> anyhow::Result<()> {
    let registry = open(context).await?;
    let stats = registry.aggregate_stats().await?;
    println!("users:    {}", stats.users);
    println!("bots:     {}", stats.bots);
    println!("running:  {}", stats.running);
    println!("stopped:  {}", stats.stopped);
    println!("starting: {}", stats.starting);
    println!("error:    {}", stats.error);
    println!("blocked:  {}", stats.blocked);
    println!("events:   {}", stats.total_events);
    Ok(())
}

pub async fn execute_inspect(args: InspectArgs, context: &CliContext) -> anyhow::Result<()> {
    let registry = open(context).await?;
    let Some(bot) = registry.find_by_short_id(&args.short_id).await? else {
        bail!("no bot with short id {}", args.short_id);
    };
    println!("{} @{}", bot.status.emoji(), bot.public_handle);
    println!("short id:  {}", bot.short_id);
    println!("token:     {}", bot.masked_token());
    println!("owner:     {}", bot.owner_id);
    println!("status:    {}", bot.status);
    println!("created:   {} ({})", bot.created_at.to_rfc3339(), bot.creation_type.as_str());
    println!("events:    {}", bot.event_count);
    println!("program:   {}", bot.code_location.display());
    if let Some(err) = bot.last_error {
        println!("last error: {err}");
    }
    Ok(())
}
