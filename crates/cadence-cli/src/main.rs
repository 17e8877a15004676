mod dry_run;

use cadence_orchestrator::{load_config, AppContext, Event, TickOutcome};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cadence", about = "Cadence: chain-based workflow orchestration")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "cadence.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check the config file and print what it declares
    Validate,
    /// Run the engine with dry-run capabilities
    Run {
        /// Mode to apply before starting (overrides [modes].initial_mode)
        #[arg(short, long)]
        mode: Option<String>,
        /// Execute this many ticks in the foreground, then print status and exit
        #[arg(short, long)]
        ticks: Option<u32>,
        /// Answer confirmation prompts and approval gates automatically
        #[arg(short, long)]
        yes: bool,
    },
    /// List production schedules and the one active now
    Schedules,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Validate => {
            let registry = config.build_registry()?;
            println!("Configuration OK: {}", cli.config.display());
            for chain in registry.chains() {
                let state = if chain.enabled { "" } else { " (disabled)" };
                println!("  chain {} '{}'{}", chain.id, chain.name, state);
                for unit in registry.members(chain.id) {
                    let gate = if unit.approval_required { " [approval]" } else { "" };
                    if unit.dependencies.is_empty() {
                        println!("    {}{}", unit.id, gate);
                    } else {
                        println!("    {} <- {}{}", unit.id, unit.dependencies.join(", "), gate);
                    }
                }
                if let Some(target) = chain.loop_back {
                    println!("    loops back to chain {target}");
                }
            }
            println!("  {} schedule(s), {} preset(s)", config.schedules.len(), config.presets.len());
        }
        Commands::Schedules => {
            let capabilities = dry_run::dry_run_capabilities(&config.build_registry()?);
            let ctx = AppContext::build(config, capabilities).await?;
            let active = ctx.modes.active_schedule().await.map(|s| s.name);
            let schedules = ctx.modes.list_schedules().await;
            if schedules.is_empty() {
                println!("No schedules configured.");
            }
            for schedule in schedules {
                let marker = if active.as_deref() == Some(schedule.name.as_str()) { "*" } else { " " };
                let days = if schedule.days.is_empty() {
                    "every day".to_string()
                } else {
                    schedule.days.iter().map(ToString::to_string).collect::<Vec<_>>().join(",")
                };
                println!(
                    "{marker} {} -> {} {}-{} ({days}){}",
                    schedule.name,
                    schedule.mode,
                    schedule.window.start.format("%H:%M"),
                    schedule.window.end.format("%H:%M"),
                    if schedule.enabled { "" } else { " disabled" }
                );
            }
        }
        Commands::Run { mode, ticks, yes } => {
            let capabilities = dry_run::dry_run_capabilities(&config.build_registry()?);
            let ctx = AppContext::build(config, capabilities).await?;
            if let Some(mode) = &mode {
                ctx.modes.set_mode(mode, None).await?;
            }
            match ticks {
                Some(ticks) => run_ticks(&ctx, ticks, yes).await?,
                None => run_until_interrupted(&ctx, yes).await?,
            }
        }
    }

    Ok(())
}

/// Drive the engine by hand: one execution tick and one queue tick per step.
async fn run_ticks(ctx: &AppContext, ticks: u32, auto_approve: bool) -> anyhow::Result<()> {
    let workflow_id = ctx.orchestrator.create_workflow().await?;
    for _ in 0..ticks {
        for (id, outcome) in ctx.orchestrator.tick().await {
            info!(workflow_id = %id, outcome = ?outcome, "Tick");
            if let TickOutcome::AwaitingApproval { unit_id } = outcome {
                if auto_approve {
                    ctx.orchestrator.approve(id, &unit_id, "cli").await?;
                }
            }
        }
        ctx.orchestrator.process_queue_once().await;
    }

    let status = ctx.orchestrator.get_status().await;
    let view = ctx.orchestrator.get_visualization(Some(workflow_id)).await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    println!("{}", serde_json::to_string_pretty(&view)?);
    ctx.shutdown().await;
    Ok(())
}

async fn run_until_interrupted(ctx: &AppContext, auto_confirm: bool) -> anyhow::Result<()> {
    let mut events = ctx.events.subscribe();
    let modes = ctx.modes.clone();
    let orchestrator = ctx.orchestrator.clone();
    let responder = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                Event::ConfirmationRequired { mode } if auto_confirm => {
                    info!(mode = %mode, "Confirming production start");
                    if let Err(e) = modes.confirm().await {
                        warn!(error = %e, "Confirmation failed");
                    }
                }
                Event::ConfirmationRequired { mode } => {
                    warn!(mode = %mode, "Mode requires confirmation; rerun with --yes");
                }
                Event::ApprovalRequested { workflow_id, unit_id } if auto_confirm => {
                    if let Err(e) = orchestrator.approve(workflow_id, &unit_id, "cli").await {
                        warn!(unit = %unit_id, error = %e, "Auto-approval failed");
                    }
                }
                Event::CriticalAlert { alert } => {
                    warn!(source = %alert.source, message = %alert.message, "Critical alert");
                }
                _ => {}
            }
        }
    });

    let workflow_id = ctx.start().await?;
    info!(workflow_id = %workflow_id, "Engine running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down");
    responder.abort();
    ctx.shutdown().await;
    let queue = ctx.queue.read().await.stats();
    println!("{}", serde_json::to_string_pretty(&queue)?);
    Ok(())
}
