//! Muster CLI - lease and work-item coordination for concurrently running agents.

use clap::Parser;
use muster::cli::{AgentCommands, Cli, Commands, ConfigCommands, ProjectCommands, WorkCommands};
use muster::commands::{self, CreateWork, Output};
use muster::config::{ConfigOverrides, resolve_config};
use muster::storage::get_data_dir;
use muster::{Engine, Error, sys};
use std::process;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter (e.g. `debug`, `muster=info`).
const LOG_ENV: &str = "MUSTER_LOG";

fn main() {
    init_logging();

    let cli = Cli::parse();
    let human = cli.human_readable;

    if let Err(e) = run(cli) {
        if human {
            eprintln!("Error: {}", e);
        } else {
            let envelope = serde_json::json!({
                "error": e.to_string(),
                "kind": e.kind().as_str(),
            });
            eprintln!("{}", envelope);
        }
        process::exit(e.kind().exit_code());
    }
}

/// Log to stderr so JSON on stdout stays machine-readable.
fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: Cli) -> Result<(), Error> {
    let human = cli.human_readable;
    let data_dir = get_data_dir(cli.data_dir.as_deref())?;

    let overrides = ConfigOverrides {
        stale_threshold_secs: cli.stale_threshold_secs,
        heartbeat_retention_days: cli.heartbeat_retention_days,
        busy_timeout_ms: cli.busy_timeout_ms,
        auto_sweep: cli.no_auto_sweep.then_some(false),
    };

    // Config commands work without opening the store.
    if let Commands::Config { command } = &cli.command {
        match command {
            ConfigCommands::Show => {
                let resolved = resolve_config(&data_dir, &overrides)?;
                output(&commands::config_show(&data_dir, resolved), human);
            }
            ConfigCommands::Set { key, value } => {
                let result = commands::config_set(&data_dir, key, value)?;
                output(&result, human);
            }
        }
        return Ok(());
    }

    let settings = resolve_config(&data_dir, &overrides)?.settings();
    let mut engine = Engine::open(&data_dir, settings)?;
    tracing::debug!(data_dir = %data_dir.display(), "store opened");

    if cli.command.triggers_sweep() {
        engine.auto_sweep();
    }

    run_command(cli.command, &mut engine, human)
}

fn run_command(command: Commands, engine: &mut Engine, human: bool) -> Result<(), Error> {
    match command {
        Commands::Agent { command } => match command {
            AgentCommands::Register {
                name,
                pid,
                parent,
                project,
                work,
                metadata,
            } => {
                // The CLI process itself exits immediately; the agent is the
                // process that invoked it.
                let pid = pid.or_else(sys::parent_pid);
                let result = commands::agent_register(
                    engine,
                    &name,
                    pid,
                    parent,
                    project,
                    work,
                    metadata.as_deref(),
                )?;
                output(&result, human);
            }
            AgentCommands::Heartbeat {
                session,
                progress,
                item,
                metadata,
            } => {
                let result = commands::agent_heartbeat(
                    engine,
                    &session,
                    progress.as_deref(),
                    item.as_deref(),
                    metadata.as_deref(),
                )?;
                output(&result, human);
            }
            AgentCommands::Idle { session } => {
                let result = commands::agent_idle(engine, &session)?;
                output(&result, human);
            }
            AgentCommands::Deregister { session } => {
                let result = commands::agent_deregister(engine, &session)?;
                output(&result, human);
            }
            AgentCommands::List {
                status,
                all,
                project,
            } => {
                let result = commands::agent_list(engine, status.as_deref(), all, project)?;
                output(&result, human);
            }
            AgentCommands::Show {
                session,
                heartbeats,
            } => {
                let result = commands::agent_show(engine, &session, heartbeats)?;
                output(&result, human);
            }
        },
        Commands::Work { command } => match command {
            WorkCommands::Create {
                id,
                title,
                description,
                project,
                source,
                source_ref,
                priority,
                metadata,
                claim_as,
            } => {
                let args = CreateWork {
                    item_id: &id,
                    title: &title,
                    description: description.as_deref(),
                    project_id: project.as_deref(),
                    source: source.as_deref(),
                    source_ref: source_ref.as_deref(),
                    priority: priority.as_deref(),
                    metadata: metadata.as_deref(),
                    claim_as: claim_as.as_deref(),
                };
                let result = commands::work_create(engine, &args)?;
                output(&result, human);
            }
            WorkCommands::Claim { id, session } => {
                let result = commands::work_claim(engine, &id, &session)?;
                output(&result, human);
            }
            WorkCommands::Next { session, project } => {
                let result = commands::work_next(engine, &session, project.as_deref())?;
                output(&result, human);
            }
            WorkCommands::Release { id, session } => {
                let result = commands::work_release(engine, &id, &session)?;
                output(&result, human);
            }
            WorkCommands::Complete { id, session } => {
                let result = commands::work_complete(engine, &id, &session)?;
                output(&result, human);
            }
            WorkCommands::Block { id, by, session } => {
                let result =
                    commands::work_block(engine, &id, by.as_deref(), session.as_deref())?;
                output(&result, human);
            }
            WorkCommands::Unblock { id, session } => {
                let result = commands::work_unblock(engine, &id, session.as_deref())?;
                output(&result, human);
            }
            WorkCommands::Delete { id, force, session } => {
                let result = commands::work_delete(engine, &id, force, session.as_deref())?;
                output(&result, human);
            }
            WorkCommands::Meta { id, json, session } => {
                let result = commands::work_meta(engine, &id, &json, session.as_deref())?;
                output(&result, human);
            }
            WorkCommands::Note {
                id,
                event_type,
                summary,
                metadata,
                source,
                session,
            } => {
                let result = commands::work_note(
                    engine,
                    &id,
                    &event_type,
                    &summary,
                    session.as_deref(),
                    metadata.as_deref(),
                    source.as_deref(),
                )?;
                output(&result, human);
            }
            WorkCommands::List {
                status,
                project,
                claimed_by,
            } => {
                let result = commands::work_list(engine, status.as_deref(), project, claimed_by)?;
                output(&result, human);
            }
            WorkCommands::Show { id } => {
                let result = commands::work_show(engine, &id)?;
                output(&result, human);
            }
        },
        Commands::Project { command } => match command {
            ProjectCommands::Register { id, name, root } => {
                let result = commands::project_register(engine, &id, &name, root.as_deref())?;
                output(&result, human);
            }
            ProjectCommands::List => {
                let result = commands::project_list(engine)?;
                output(&result, human);
            }
            ProjectCommands::Show { id } => {
                let result = commands::project_show(engine, &id)?;
                output(&result, human);
            }
        },
        Commands::Events {
            since,
            target,
            target_type,
            event_type,
            actor,
            limit,
        } => {
            let result = commands::events(
                engine,
                since,
                target,
                target_type.as_deref(),
                event_type,
                actor,
                limit,
            )?;
            output(&result, human);
        }
        Commands::Sweep { dry_run } => {
            let result = commands::sweep(engine, dry_run)?;
            output(&result, human);
        }
        // Handled in `run` before the store is opened.
        Commands::Config { .. } => {}
    }

    Ok(())
}

fn output<T: Output>(result: &T, human: bool) {
    if human {
        println!("{}", result.to_human());
    } else {
        println!("{}", result.to_json());
    }
}
