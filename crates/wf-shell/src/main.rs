mod config;
mod events;
mod presentation;
mod session;

use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::oneshot;
use wf_client::{AgentStreams, ChannelError, ControlChannel, StreamKind, SubscriptionManager};
use wf_proto::watchfire::{ProjectId, ResizeRequest, SendInputRequest, StartAgentRequest};
use wf_supervisor::{ConnectionDescriptor, DescriptorSource, DescriptorStore};
use wf_telemetry as telemetry;

use config::{shell_config_path, ShellConfig};
use events::{ShellEventQueue, DEFAULT_EVENT_QUEUE_SIZE};
use presentation::Presentation;
use session::{describe_end, shell_event, SessionExit, SessionParts, ShellSession};

#[derive(Parser)]
#[command(
    name = "watchfire-shell",
    version,
    about = "Supervises the watchfire daemon and follows agent sessions"
)]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Keep the daemon running and follow project streams until it shuts down
    Run {
        #[arg(long = "project")]
        projects: Vec<String>,
    },
    /// Start the daemon if needed and print its descriptor
    Ensure,
    /// Print the registered daemon and what it reports about itself
    Status,
    /// Ask the daemon to shut down
    Shutdown,
    /// List projects known to the daemon
    Projects,
    /// Follow a single stream of one project
    Watch {
        #[arg(long)]
        project: String,
        #[arg(long, value_enum, default_value_t = KindArg::Screen)]
        kind: KindArg,
    },
    /// Agent controls (AgentService)
    Agent {
        #[command(subcommand)]
        cmd: AgentCmd,
    },
    /// Print the effective configuration
    Config {
        /// Persist it to the shell config file
        #[arg(long)]
        save: bool,
    },
}

#[derive(Subcommand)]
enum AgentCmd {
    Status {
        #[arg(long)]
        project: String,
    },
    Start {
        #[arg(long)]
        project: String,
        #[arg(long, default_value = "chat")]
        mode: String,
        #[arg(long, default_value_t = 0)]
        task: i32,
        #[arg(long, default_value_t = 24)]
        rows: i32,
        #[arg(long, default_value_t = 80)]
        cols: i32,
    },
    Stop {
        #[arg(long)]
        project: String,
    },
    Resume {
        #[arg(long)]
        project: String,
    },
    /// Send text to the agent's terminal
    Input {
        #[arg(long)]
        project: String,
        text: String,
    },
    Resize {
        #[arg(long)]
        project: String,
        rows: i32,
        cols: i32,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Screen,
    Issues,
    Raw,
}

impl From<KindArg> for StreamKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Screen => StreamKind::Screen,
            KindArg::Issues => StreamKind::Issues,
            KindArg::Raw => StreamKind::RawOutput,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    wf_util::init_tracing()?;
    telemetry::init_with_env(
        "watchfire-shell",
        env!("CARGO_PKG_VERSION"),
        wf_util::watchfire_dir(),
    );
    telemetry::event("shell.start", &[]);

    let cli = Cli::parse();
    let config = ShellConfig::load();

    match cli.cmd {
        Cmd::Run { projects } => run(&config, projects).await?,
        Cmd::Ensure => {
            let supervisor = SessionParts::system(&config).supervisor;
            let descriptor = supervisor.ensure_running().await?;
            print_descriptor(&descriptor);
        }
        Cmd::Status => {
            let store = DescriptorStore::new(config.descriptor_path());
            let Some(descriptor) = store.read() else {
                println!("no daemon running");
                if let Some(stale) = store.read_raw() {
                    println!("stale descriptor left by pid {}", stale.pid);
                }
                return Ok(());
            };
            print_descriptor(&descriptor);
            let channel = bind(&config, &descriptor)?;
            let status = channel.daemon_client()?.get_status(()).await?.into_inner();
            println!("active_agents={}", status.active_agents);
            for project in status.active_projects {
                println!("active\t{project}");
            }
            if status.update_available {
                println!("update={}\t{}", status.update_version, status.update_url);
            }
        }
        Cmd::Shutdown => {
            let channel = connect(&config)?;
            channel.daemon_client()?.shutdown(()).await?;
            println!("shutdown requested");
        }
        Cmd::Projects => {
            let channel = connect(&config)?;
            let list = channel.project_client()?.list_projects(()).await?.into_inner();
            for p in list.projects {
                println!("{}\t{}\t{}\t{}", p.project_id, p.name, p.status, p.path);
            }
        }
        Cmd::Watch { project, kind } => watch(&config, project, kind.into()).await?,
        Cmd::Agent { cmd } => agent(&config, cmd).await?,
        Cmd::Config { save } => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            if save {
                config.save()?;
                println!("saved to {}", shell_config_path().display());
            }
        }
    }

    Ok(())
}

async fn run(config: &ShellConfig, projects: Vec<String>) -> Result<(), Box<dyn std::error::Error>> {
    let (queue, mut notify) = ShellEventQueue::new(DEFAULT_EVENT_QUEUE_SIZE);
    let printer = {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move {
            let mut view = Presentation::new();
            while notify.recv().await.is_some() {
                print_events(&queue, &mut view);
            }
        })
    };

    let session = ShellSession::new(
        SessionParts::system(config),
        config,
        queue.sender(),
        projects,
    );
    let exit = session
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    printer.abort();
    print_events(&queue, &mut Presentation::new());
    if exit == SessionExit::RestartAbandoned {
        return Err("daemon could not be restarted".into());
    }
    Ok(())
}

async fn watch(
    config: &ShellConfig,
    project: String,
    kind: StreamKind,
) -> Result<(), Box<dyn std::error::Error>> {
    let channel = Arc::new(connect(config)?);
    let manager = SubscriptionManager::new(Arc::new(AgentStreams::new(channel)));
    let (end_tx, end_rx) = oneshot::channel();

    let on_event = {
        let project = project.clone();
        let mut view = Presentation::new();
        move |event| {
            if let Some(line) = view.render(&shell_event(&project, event)) {
                println!("{line}");
            }
        }
    };
    let token = manager.subscribe(&project, kind, on_event, move |end| {
        let _ = end_tx.send(end);
    });

    tokio::select! {
        end = end_rx => {
            if let Ok(end) = end {
                if let Some(detail) = describe_end(&end) {
                    println!("[{project}] {kind} stream ended: {detail}");
                }
                if end.is_error() {
                    return Err("stream ended with an error".into());
                }
            }
        }
        _ = tokio::signal::ctrl_c() => token.cancel(),
    }
    Ok(())
}

async fn agent(config: &ShellConfig, cmd: AgentCmd) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = connect(config)?.agent_client()?;
    let status = match cmd {
        AgentCmd::Status { project } => client.get_agent_status(ProjectId::new(project)).await?,
        AgentCmd::Start {
            project,
            mode,
            task,
            rows,
            cols,
        } => {
            client
                .start_agent(StartAgentRequest {
                    project_id: project,
                    mode,
                    task_number: task,
                    rows,
                    cols,
                })
                .await?
        }
        AgentCmd::Resume { project } => client.resume_agent(ProjectId::new(project)).await?,
        AgentCmd::Stop { project } => {
            client.stop_agent(ProjectId::new(project)).await?;
            println!("stopped");
            return Ok(());
        }
        AgentCmd::Input { project, text } => {
            client
                .send_input(SendInputRequest {
                    project_id: project,
                    data: text.into_bytes(),
                })
                .await?;
            return Ok(());
        }
        AgentCmd::Resize {
            project,
            rows,
            cols,
        } => {
            client
                .resize(ResizeRequest {
                    project_id: project,
                    rows,
                    cols,
                })
                .await?;
            return Ok(());
        }
    }
    .into_inner();

    println!(
        "running={}\tmode={}\ttask={}\t{}",
        status.is_running, status.mode, status.task_number, status.task_title
    );
    if !status.wildfire_phase.is_empty() {
        println!("phase={}", status.wildfire_phase);
    }
    if let Some(issue) = status.issue.and_then(|issue| issue.into_active()) {
        println!("issue={}\t{}", issue.issue_type, issue.message);
    }
    Ok(())
}

/// Channel bound to the currently registered, live daemon.
fn connect(config: &ShellConfig) -> Result<ControlChannel, ChannelError> {
    let descriptor = DescriptorStore::new(config.descriptor_path())
        .read()
        .ok_or(ChannelError::NoDaemon)?;
    bind(config, &descriptor)
}

fn bind(config: &ShellConfig, descriptor: &ConnectionDescriptor) -> Result<ControlChannel, ChannelError> {
    let channel = ControlChannel::new(config.rpc_timeout(), config.connect_timeout());
    channel.init_from(descriptor)?;
    Ok(channel)
}

fn print_descriptor(descriptor: &ConnectionDescriptor) {
    println!("endpoint={}", descriptor.endpoint());
    println!("pid={}", descriptor.pid);
    if let Some(started_at) = descriptor.started_at {
        println!("started_at={}", started_at.to_rfc3339());
    }
}

fn print_events(queue: &ShellEventQueue, view: &mut Presentation) {
    for event in queue.drain() {
        if let Some(line) = view.render(&event) {
            println!("{line}");
        }
    }
}
