use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use domain::{
    model::{
        entity::{Job, JobStatus, Server, ServerStatus},
        vo::SwitchState,
    },
    repository::{JobRepository, QueueStateRepository, ServerRepository},
};

use crate::infrastructure::ioc::Container;

#[derive(Parser, Debug)]
#[command(name = "hrmd")]
#[command(about = "Queue manager dispatching deconvolution jobs to compute servers", long_about = None)]
pub struct Cli {
    /// Config file (yaml or toml); `HRMD__*` variables override it.
    #[arg(short, long, default_value = "hrmd.yaml")]
    pub config: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Poll the queue until the switch is turned off
    Run {
        /// Stop after this many passes
        #[arg(long)]
        passes: Option<u64>,
    },

    /// Turn the queue manager on or off, or show its state
    Switch {
        #[command(subcommand)]
        action: SwitchAction,
    },

    /// Put every paused job back into the queue
    RestartPaused,

    /// Remove a job; a running job is killed on the next pass
    Remove { id: String },

    /// Hold a queued job until the paused jobs are restarted
    Pause { id: String },

    /// Queue a new job
    Submit {
        #[arg(long)]
        owner: String,

        #[arg(long)]
        group: String,

        #[arg(long, action)]
        autoseries: bool,

        /// Input images
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// List the queue in service order
    Queue,

    /// Manage compute servers
    Server {
        #[command(subcommand)]
        action: ServerAction,
    },

    /// List finished jobs
    Stats,
}

#[derive(Subcommand, Debug)]
pub enum SwitchAction {
    On,
    Off,
    Status,
}

#[derive(Subcommand, Debug)]
pub enum ServerAction {
    Add {
        host: String,

        /// Engine executable on that host
        #[arg(long, default_value = "/usr/local/bin/hucore")]
        engine: String,

        /// Bind the entry to one GPU of the host
        #[arg(long)]
        gpu: Option<String>,
    },
    Remove {
        name: String,
    },
    List,
}

/// Operator commands. `run` is handled by the caller.
pub async fn execute(container: &Container, command: Commands) -> anyhow::Result<()> {
    let coordinator = &container.coordinator;
    let repo = &container.repo;

    match command {
        Commands::Run { .. } => anyhow::bail!("`run` is not an operator command"),
        Commands::Switch { action } => {
            let state = match action {
                SwitchAction::On => SwitchState::On,
                SwitchAction::Off => SwitchState::Off,
                SwitchAction::Status => {
                    println!("{}", switch_label(repo.get_switch_state().await?));
                    return Ok(());
                }
            };
            coordinator.set_switch(state).await?;
            println!("{}", switch_label(state));
        }
        Commands::RestartPaused => {
            let restarted = coordinator.restart_paused_jobs().await?;
            println!("{restarted} job(s) back in the queue");
        }
        Commands::Remove { id } => match coordinator.mark_job_removed(&id).await? {
            Some(JobStatus::Kill) => println!("{id} will be killed on the next pass"),
            Some(_) => println!("{id} will be removed on the next pass"),
            None => println!("{id} is already being removed"),
        },
        Commands::Pause { id } => {
            if coordinator.pause_job(&id).await? {
                println!("{id} paused");
            } else {
                anyhow::bail!("{id} is not waiting in the queue");
            }
        }
        Commands::Submit {
            owner,
            group,
            autoseries,
            files,
        } => {
            let files = files.iter().map(|f| f.to_string_lossy().into_owned()).collect();
            let job = Job::new(owner, group, files, autoseries)?;
            coordinator.submit(&job).await?;
            println!("{}", job.id);
        }
        Commands::Queue => {
            for job in repo.list_queue().await? {
                println!("{}", queue_line(&job));
            }
        }
        Commands::Server { action } => match action {
            ServerAction::Add { host, engine, gpu } => {
                let server = Server::new(&host, &engine, gpu.as_deref())?;
                repo.add_server(&server)
                    .await
                    .with_context(|| format!("Cannot add server `{}`", server.name))?;
                println!("added `{}`", server.name);
            }
            ServerAction::Remove { name } => {
                if !repo.remove_server(&name).await? {
                    anyhow::bail!("No server named `{name}`");
                }
                println!("removed `{name}`");
            }
            ServerAction::List => {
                for server in repo.list_servers().await? {
                    let status = match server.status {
                        ServerStatus::Free => server.status.as_ref().green(),
                        ServerStatus::Busy => server.status.as_ref().yellow(),
                        ServerStatus::Paused => server.status.as_ref().red(),
                    };
                    let pid = server.job.map(|p| p.to_string()).unwrap_or_default();
                    println!("{:<24} {:<6} {:>8} {}", server.name, status, pid, server.engine_path);
                }
            }
        },
        Commands::Stats => {
            for row in repo.list_statistics().await? {
                let start = row.start.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".to_owned());
                println!(
                    "{} {:<12} {:<12} {} {} {}",
                    row.id,
                    row.owner,
                    row.group,
                    start,
                    row.stop.to_rfc3339(),
                    row.server.as_deref().unwrap_or("-"),
                );
            }
        }
    }
    Ok(())
}

fn switch_label(state: SwitchState) -> colored::ColoredString {
    match state {
        SwitchState::On => "on".green(),
        SwitchState::Off => "off".red(),
    }
}

fn queue_line(job: &Job) -> String {
    let priority = job.priority.map(|p| p.to_string()).unwrap_or_else(|| "-".to_owned());
    format!(
        "{:>4} {} {:<8} {:<12} {} {} {}",
        priority,
        job.id,
        job.status.as_ref(),
        job.owner,
        job.queued.format("%Y-%m-%d %H:%M:%S"),
        job.server.as_deref().unwrap_or("-"),
        job.files.join(","),
    )
}
