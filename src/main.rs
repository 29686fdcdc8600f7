//! CLI entry point. Wires the layered config loader, the orchestrator state
//! machine, the dashboard HTTP server and the file-based IPC/notification/
//! shutdown plumbing together behind a small `clap` surface, plus the
//! per-branch launcher subcommands that spawn and supervise this same
//! binary (`launcher::launch` execs `<this binary> run --port <n>`).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gsd_autopilot::config::{Config, NotifyAdapter, RawConfig};
use gsd_autopilot::git;
use gsd_autopilot::http::{serve, AppState};
use gsd_autopilot::ipc::{AnswerPoller, EventTailer, EventWriter, HeartbeatWriter, ShutdownMarker};
use gsd_autopilot::launcher;
use gsd_autopilot::notify::{ConsoleAdapter, DesktopAdapter, Notification, NotificationAdapter, NotificationManager};
use gsd_autopilot::orchestrator::Orchestrator;
use gsd_autopilot::questions::QuestionHandler;
use gsd_autopilot::roadmap;
use gsd_autopilot::shutdown::ShutdownCoordinator;
use gsd_autopilot::state::{SharedState, StateStore};
use gsd_autopilot::supervisor::AgentSupervisor;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Parser)]
#[command(name = "gsd-autopilot")]
#[command(version, about = "Drives discuss/plan/execute/verify phases by supervising an AI coding agent")]
struct Cli {
    #[arg(long, global = true)]
    project_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator in the foreground against the project.
    Run(RunArgs),
    /// Launch the orchestrator detached for the current (or named) branch.
    Launch {
        #[arg(long)]
        branch: Option<String>,
    },
    /// Report whether the orchestrator is running for a branch.
    Status {
        #[arg(long)]
        branch: Option<String>,
    },
    /// Stop the orchestrator running for a branch.
    Stop {
        #[arg(long)]
        branch: Option<String>,
    },
}

#[derive(clap::Args, Debug, Default)]
struct RunArgs {
    #[arg(long)]
    prd: Option<PathBuf>,
    #[arg(long)]
    resume: bool,
    #[arg(long)]
    phases: Option<String>,
    #[arg(long)]
    skip_discuss: bool,
    #[arg(long)]
    skip_verify: bool,
    #[arg(long)]
    depth: Option<String>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    notify: Option<String>,
    #[arg(long)]
    webhook_url: Option<String>,
    #[arg(long)]
    adapter_path: Option<PathBuf>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(short, long)]
    verbose: bool,
    #[arg(short, long)]
    quiet: bool,
}

impl From<RunArgs> for RawConfig {
    fn from(args: RunArgs) -> Self {
        RawConfig {
            prd: args.prd,
            resume: args.resume.then_some(true),
            phases: args.phases,
            skip_discuss: args.skip_discuss.then_some(true),
            skip_verify: args.skip_verify.then_some(true),
            depth: args.depth,
            model: args.model,
            notify: args.notify,
            webhook_url: args.webhook_url,
            adapter_path: args.adapter_path,
            port: args.port,
            verbose: args.verbose.then_some(true),
            quiet: args.quiet.then_some(true),
            agent_cmd: None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("failed to determine current directory")?,
    };

    match cli.command {
        Commands::Run(args) => cmd_run(project_dir, args).await,
        Commands::Launch { branch } => cmd_launch(project_dir, branch).await,
        Commands::Status { branch } => cmd_status(project_dir, branch),
        Commands::Stop { branch } => cmd_stop(project_dir, branch).await,
    }
}

fn resolve_branch(project_dir: &std::path::Path, branch: Option<String>) -> Result<String> {
    match branch {
        Some(b) => Ok(b),
        None => git::current_branch(project_dir).context("failed to resolve current git branch"),
    }
}

async fn cmd_launch(project_dir: PathBuf, branch: Option<String>) -> Result<()> {
    let config = Config::load(project_dir.clone(), RawConfig::default())
        .context("failed to load configuration")?;
    let branch = resolve_branch(&project_dir, branch)?;
    let report = launcher::launch(&config, &branch).await?;
    if report.already_running {
        println!(
            "Already running for branch '{}' (pid {}) at {}",
            report.branch, report.pid, report.url
        );
    } else {
        println!(
            "Launched for branch '{}' (pid {}) at {}",
            report.branch, report.pid, report.url
        );
    }
    Ok(())
}

fn cmd_status(project_dir: PathBuf, branch: Option<String>) -> Result<()> {
    let config = Config::load(project_dir.clone(), RawConfig::default())
        .context("failed to load configuration")?;
    let branch = resolve_branch(&project_dir, branch)?;
    let report = launcher::status(&config, &branch);
    if report.running {
        println!(
            "Branch '{}': running (pid {}), {}% complete, phase {}",
            report.branch,
            report.pid.unwrap_or_default(),
            report.progress,
            report.phase.as_deref().unwrap_or("-"),
        );
        if let Some(url) = report.url {
            println!("Dashboard: {url}");
        }
    } else {
        println!("Branch '{}': not running", report.branch);
    }
    Ok(())
}

async fn cmd_stop(project_dir: PathBuf, branch: Option<String>) -> Result<()> {
    let config = Config::load(project_dir.clone(), RawConfig::default())
        .context("failed to load configuration")?;
    let branch = resolve_branch(&project_dir, branch)?;
    launcher::stop(&config, &branch).await?;
    println!("Stopped branch '{branch}'");
    Ok(())
}

async fn cmd_run(project_dir: PathBuf, args: RunArgs) -> Result<()> {
    let config =
        Config::load(project_dir, RawConfig::from(args)).context("failed to load configuration")?;
    init_logging(config.verbose, config.quiet);
    std::fs::create_dir_all(&config.workspace_dir)
        .context("failed to create workspace directory")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let coordinator = Arc::new(ShutdownCoordinator::new());
    {
        let tx = shutdown_tx.clone();
        coordinator
            .install_signal_handler(move || {
                let _ = tx.send(true);
            })
            .context("failed to install signal handler")?;
    }

    // Opened before the orchestrator writes anything so the notifier never
    // misses the run's first events.
    let event_tailer = EventTailer::new(config.events_file());
    let events = Arc::new(EventWriter::new(config.events_file()));

    let store = if config.resume {
        StateStore::load_or_fresh(config.state_file())?
    } else {
        StateStore::create_fresh(config.state_file())
    };
    let state = SharedState::new(store);

    let questions = Arc::new(QuestionHandler::with_state(state.clone()));
    let supervisor = Arc::new(AgentSupervisor::new(
        config.agent_cmd.clone(),
        Vec::new(),
        questions.clone(),
        events.clone(),
        shutdown_rx.clone(),
    ));

    let heartbeat_handle = HeartbeatWriter::new(config.heartbeat_file()).spawn(shutdown_rx.clone());
    let answer_poller_handle = spawn_answer_poller(
        config.answers_dir(),
        questions.clone(),
        events.clone(),
        shutdown_rx.clone(),
    );
    let shutdown_marker_handle =
        spawn_shutdown_marker_watch(config.shutdown_marker_file(), shutdown_tx.clone(), shutdown_rx.clone());

    let notify_manager = Arc::new(build_notification_manager(&config));
    notify_manager.init().await;
    let notifier_handle = spawn_event_notifier(event_tailer, notify_manager.clone(), shutdown_rx.clone());

    // No on-disk static override wired up from the CLI: `--adapter-path` is
    // reserved for a future custom `NotificationAdapter` loader (§4.10), not
    // the dashboard's static assets, so the embedded UI is always served.
    let http_state = AppState::new(config.clone(), shutdown_tx.clone(), shutdown_rx.clone(), None);
    let http_handle = tokio::spawn(serve(http_state, config.port, shutdown_rx.clone()));

    let prd_path = config.prd.clone();
    let phase_filter = match &config.phases {
        Some(spec) => Some(roadmap::parse_range(spec)?),
        None => None,
    };

    let mut orchestrator = Orchestrator::new(config, state, supervisor, events, shutdown_rx.clone());
    let run_result = orchestrator.run(prd_path.as_deref(), phase_filter.as_deref()).await;

    let _ = shutdown_tx.send(true);
    notify_manager.close().await;
    answer_poller_handle.abort();
    shutdown_marker_handle.abort();
    notifier_handle.abort();
    heartbeat_handle.abort();

    match http_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::warn!(error = %err, "dashboard server exited with an error"),
        Err(err) => tracing::warn!(error = %err, "dashboard server task panicked"),
    }

    run_result.map_err(anyhow::Error::from).context("orchestrator run failed")
}

fn spawn_answer_poller(
    dir: PathBuf,
    questions: Arc<QuestionHandler>,
    events: Arc<EventWriter>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let poller = AnswerPoller::new(dir);
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = ticker.tick() => { poller.poll(&questions, &events); }
                _ = shutdown.changed() => { if *shutdown.borrow() { break; } }
            }
        }
    })
}

/// Polls for the launcher's shutdown marker file (written by `gsd-autopilot
/// stop`) on the same cadence as the heartbeat, and folds it into the same
/// shutdown channel a SIGINT/SIGTERM trap would use.
fn spawn_shutdown_marker_watch(
    path: PathBuf,
    shutdown_tx: watch::Sender<bool>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let marker = ShutdownMarker::new(path);
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if marker.is_present() {
                        let _ = shutdown_tx.send(true);
                        marker.clear();
                        break;
                    }
                }
                _ = shutdown_rx.changed() => { if *shutdown_rx.borrow() { break; } }
            }
        }
    })
}

/// Fans key lifecycle events out through the notification manager: a
/// question needing a human, an escalated failure, and phase/run completion.
/// A `question-pending` notification repeats on [`NotificationManager`]'s
/// reminder interval, keyed by the question id, until a matching
/// `question-answered` event cancels it.
fn spawn_event_notifier(
    mut tailer: EventTailer,
    manager: Arc<NotificationManager>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(500));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for event in tailer.poll() {
                        if event.event == "question-answered" {
                            if let Some(id) = event.data.get("id").and_then(|v| v.as_str()) {
                                manager.cancel_reminder(id).await;
                            }
                            continue;
                        }
                        if let Some(notification) = notification_for_event(&event.event, &event.data) {
                            match event.data.get("id").and_then(|v| v.as_str()) {
                                Some(id) if event.event == "question-pending" => {
                                    manager.notify_with_reminder(id, notification).await;
                                }
                                _ => manager.notify(notification).await,
                            }
                        }
                    }
                }
                _ = shutdown.changed() => { if *shutdown.borrow() { break; } }
            }
        }
    })
}

fn notification_for_event(event: &str, data: &serde_json::Value) -> Option<Notification> {
    let phase = data.get("phase").and_then(|v| v.as_str()).unwrap_or("?");
    match event {
        "question-pending" => Some(Notification::new(
            "Question needs an answer",
            format!("Phase {phase} is waiting on you in the dashboard."),
        )),
        "error-escalation" => Some(Notification::new(
            "Agent command failed twice",
            format!("Phase {phase} step {} needs attention.", data.get("step").and_then(|v| v.as_str()).unwrap_or("?")),
        )),
        "gap-escalated" => Some(Notification::new(
            "Gap loop exhausted",
            format!("Phase {phase} still reports gaps after the maximum retries."),
        )),
        "phase-completed" => Some(Notification::new(
            "Phase completed",
            format!("Phase {phase} finished."),
        )),
        "build-complete" => Some(Notification::new(
            "Build complete",
            "All phases finished.".to_string(),
        )),
        _ => None,
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    use tracing_subscriber::EnvFilter;
    let default_level = if quiet {
        "warn"
    } else if verbose {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// `teams`/`slack`/`webhook` have no adapter implementation yet (chat/webhook
/// delivery is out of scope for this notify module); they still get the
/// console adapter so a run never falls silent just because the chosen
/// channel isn't wired up.
fn build_notification_manager(config: &Config) -> NotificationManager {
    let adapters: Vec<Arc<dyn NotificationAdapter>> = match config.notify {
        NotifyAdapter::Console => vec![Arc::new(ConsoleAdapter)],
        NotifyAdapter::System => vec![Arc::new(ConsoleAdapter), Arc::new(DesktopAdapter)],
        NotifyAdapter::Teams | NotifyAdapter::Slack | NotifyAdapter::Webhook => {
            tracing::warn!(adapter = ?config.notify, "chat/webhook notification delivery is not implemented, falling back to console");
            vec![Arc::new(ConsoleAdapter)]
        }
    };
    NotificationManager::new(adapters)
}
