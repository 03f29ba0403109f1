use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use omx_sync::{build_scheduler, SyncConfig, SyncPipeline, SyncRunSummary, TaskRegistry};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "omx")]
#[command(about = "Incremental GitHub metrics extraction")]
struct Cli {
    /// Print run summaries as JSON.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List registered tasks.
    List,
    /// Run one task by name.
    Run { task: String },
    /// Run every enabled task once.
    RunAll,
    /// Run tasks on their cron schedules until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    let registry = TaskRegistry::load_or_builtin(&config.tasks_file).await?;

    match cli.command {
        Commands::List => {
            for name in registry.names() {
                if let Some(task) = registry.get(name) {
                    println!(
                        "{name}\t{:?}\t{}\t{}{}",
                        task.kind,
                        task.orgs.join(","),
                        task.cron.as_deref().unwrap_or("-"),
                        if task.enabled { "" } else { "\t(disabled)" }
                    );
                }
            }
        }
        Commands::Run { task } => {
            let pipeline = SyncPipeline::new(config, registry)?;
            let summary = pipeline.run_task(&task).await?;
            report(&summary, cli.json)?;
        }
        Commands::RunAll => {
            let pipeline = SyncPipeline::new(config, registry)?;
            for summary in pipeline.run_enabled().await? {
                report(&summary, cli.json)?;
            }
        }
        Commands::Schedule => {
            let pipeline = Arc::new(SyncPipeline::new(config, registry)?);
            let Some(mut sched) = build_scheduler(pipeline).await? else {
                eprintln!("no enabled task has a cron schedule");
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running, press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

fn report(summary: &SyncRunSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(summary)?);
    } else {
        println!(
            "sync complete: run_id={} task={} fetched={} exported={} failed_repos={} outputs={}",
            summary.run_id,
            summary.task,
            summary.resources_fetched,
            summary.records_exported,
            summary.failed_repos.len(),
            summary.outputs.join(",")
        );
    }
    Ok(())
}
