mod companion;
mod config;
mod console;
mod event;
mod orchestrator;
mod output;
mod paths;
mod release;
mod status;
mod supervisor;
mod updater;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::future::Future;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::companion::Companion;
use crate::config::{ConfigError, ConfigOrigin, TIMESTAMP_FORMAT};
use crate::event::{Command, LauncherEvent, TaskKind, HELP};
use crate::orchestrator::Launcher;
use crate::paths::{Location, Locations};
use crate::release::GithubFeed;
use crate::status::LauncherStatus;
use crate::supervisor::{LaunchOutcome, SupervisorState};

const LIVENESS_POLL_INTERVAL: Duration = Duration::from_secs(1);
const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Parser)]
#[command(
    name = "megalauncher",
    version,
    about = "Installs, updates and supervises the MegaAntiCheat client backend"
)]
struct Cli {
    /// Keep the executable, its backup, the config and the status file under DIR
    #[arg(long, value_name = "DIR", env = "MEGALAUNCHER_ROOT", global = true)]
    root: Option<PathBuf>,

    /// Launch TF2 together with MAC for this session
    #[arg(long, conflicts_with = "no_companion", global = true)]
    companion: bool,

    /// Do not launch TF2 for this session
    #[arg(long, global = true)]
    no_companion: bool,

    #[command(subcommand)]
    command: Option<Mode>,
}

#[derive(Subcommand, Clone, Copy)]
enum Mode {
    /// Interactive console (default)
    Run,
    /// Check for updates once and exit
    Update,
    /// Delete MAC and its config, install the latest release and exit
    Reinstall,
    /// Print what is installed and exit
    Status,
}

impl Cli {
    fn locations(&self) -> Locations {
        match &self.root {
            Some(root) => Locations::in_dir(root),
            None => {
                debug!(
                    "Using platform locations (config at {})",
                    paths::resolve(Location::Config).display()
                );
                Locations::platform().clone()
            }
        }
    }

    fn companion_override(&self) -> Option<bool> {
        if self.companion {
            Some(true)
        } else if self.no_companion {
            Some(false)
        } else {
            None
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let locations = cli.locations();
    let feed = Arc::new(GithubFeed::upstream().context("Failed to build the HTTP client")?);
    let launcher = Arc::new(Launcher::new(locations, feed, Companion::default()));

    match cli.command.unwrap_or(Mode::Run) {
        Mode::Run => interactive(launcher, cli.companion_override()).await,
        Mode::Update => Ok(report(launcher.check_for_updates().await)),
        Mode::Reinstall => Ok(report(launcher.reinstall().await)),
        Mode::Status => Ok(print_installation(&launcher)),
    }
}

/// Prints the result of a one-shot operation. Only config errors fail the
/// process; remote failures are already folded into the message.
fn report(result: Result<String, ConfigError>) -> ExitCode {
    match result {
        Ok(message) => {
            println!("{message}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn print_installation(launcher: &Launcher) -> ExitCode {
    let loaded = match launcher.load_config() {
        Ok(loaded) => loaded,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let locations = launcher.locations();
    let config = &loaded.config;
    let executable = locations.get(Location::Executable);

    println!(
        "Executable:        {} ({})",
        executable.display(),
        if executable.exists() { "present" } else { "missing" }
    );
    println!(
        "Installed version: {}",
        config.managed.installed_version().unwrap_or("none")
    );
    println!(
        "Last update check: {}",
        config
            .managed
            .last_update_check
            .map_or_else(|| "never".to_string(), |t| t.format(TIMESTAMP_FORMAT).to_string())
    );
    println!(
        "Launch TF2:        {}",
        if config.launcher.launch_companion { "yes" } else { "no" }
    );

    // Written by a running console session, if there is one.
    let status_path = locations.get(Location::Status);
    if let Ok(content) = std::fs::read_to_string(status_path) {
        match toml::from_str::<LauncherStatus>(&content) {
            Ok(status) => println!("Console state:     {}", status.state),
            Err(e) => debug!("Ignoring unreadable {}: {e}", status_path.display()),
        }
    }
    ExitCode::SUCCESS
}

async fn interactive(launcher: Arc<Launcher>, companion_override: Option<bool>) -> Result<ExitCode> {
    let status_path = launcher.locations().get(Location::Status).to_path_buf();
    let supervisor = launcher.supervisor().clone();

    // ── Initial state ─────────────────────────────────────────────────────────
    let mut current_status = LauncherStatus::new();
    let stored_preference = match launcher.load_config() {
        Ok(loaded) => {
            if loaded.origin == ConfigOrigin::Created {
                info!("Created default config at {}", launcher.locations().config.display());
            }
            current_status.installed_version =
                loaded.config.managed.installed_version().map(str::to_string);
            loaded.config.launcher.launch_companion
        }
        Err(e) => {
            error!("{e}");
            println!("The launcher config is unreadable. Use `reinstall` to reset it.");
            current_status.error = Some(e.to_string());
            false
        }
    };
    let mut with_companion = companion_override.unwrap_or(stored_preference);
    // A command-line override only applies to this session.
    let mut persist_companion = companion_override.is_none();
    status::write_status(&status_path, &current_status);

    let (event_tx, mut event_rx) = mpsc::channel::<LauncherEvent>(EVENT_CHANNEL_CAPACITY);

    // ── Background tasks ──────────────────────────────────────────────────────
    {
        let (changed_tx, changed_rx) = watch::channel(());
        supervisor.add_observer(move || {
            changed_tx.send_replace(());
        });
        forward_status_changes(changed_rx, event_tx.clone());
    }

    {
        let supervisor = supervisor.clone();
        let tx = event_tx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(LIVENESS_POLL_INTERVAL);
            loop {
                ticker.tick().await;
                if let Some(exit) = supervisor.check_status() {
                    let line = format!("MAC exited unexpectedly ({exit}).");
                    if tx.send(LauncherEvent::Output(line)).await.is_err() {
                        break;
                    }
                }
            }
        });
    }

    // Graceful shutdown on Ctrl+C.
    {
        let tx = event_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = tx.send(LauncherEvent::Shutdown).await;
            }
        });
    }

    console::start(event_tx.clone()).context("Failed to start the console reader")?;

    println!("megalauncher v{} started", env!("CARGO_PKG_VERSION"));
    println!("{HELP}");

    // ── Event loop ────────────────────────────────────────────────────────────
    // Update or reinstall in flight; launches wait for it to finish.
    let mut busy: Option<TaskKind> = None;
    let mut shutting_down = false;

    while let Some(evt) = event_rx.recv().await {
        match evt {
            LauncherEvent::Command(Command::Quit) | LauncherEvent::Shutdown => {
                if shutting_down {
                    continue;
                }
                shutting_down = true;
                println!("Shutting down");
                // The loop keeps draining output until the stop reports back.
                spawn_task(TaskKind::Stop, &event_tx, stop_managed(Arc::clone(&launcher)));
            }

            LauncherEvent::Command(_) if shutting_down => {}

            LauncherEvent::Command(command) => match command {
                Command::Start => {
                    start_managed(&launcher, &event_tx, busy, with_companion);
                }
                Command::Stop => {
                    if supervisor.state() == SupervisorState::Idle {
                        println!("MAC is not running.");
                    } else {
                        spawn_task(TaskKind::Stop, &event_tx, stop_managed(Arc::clone(&launcher)));
                    }
                }
                Command::Toggle => {
                    if supervisor.state() == SupervisorState::Idle {
                        start_managed(&launcher, &event_tx, busy, with_companion);
                    } else {
                        spawn_task(TaskKind::Stop, &event_tx, stop_managed(Arc::clone(&launcher)));
                    }
                }
                Command::CheckUpdates | Command::Reinstall => {
                    if let Some(task) = busy {
                        println!("Wait for the {task} to finish.");
                        continue;
                    }
                    let task = if command == Command::Reinstall {
                        TaskKind::Reinstall
                    } else {
                        TaskKind::Update
                    };
                    busy = Some(task);
                    let launcher = Arc::clone(&launcher);
                    spawn_task(task, &event_tx, async move {
                        let result = match task {
                            TaskKind::Reinstall => launcher.reinstall().await,
                            _ => launcher.check_for_updates().await,
                        };
                        result.map_err(|e| e.to_string())
                    });
                }
                Command::Companion(enabled) => {
                    with_companion = enabled;
                    persist_companion = true;
                    println!(
                        "TF2 will {}be launched with MAC.",
                        if enabled { "" } else { "not " }
                    );
                }
                Command::Status => print_session(&current_status, with_companion),
                Command::Help => println!("{HELP}"),
                // Handled together with Shutdown.
                Command::Quit => {}
            },

            LauncherEvent::Output(line) => {
                println!("{line}");
                current_status.push_output(line);
            }

            LauncherEvent::StatusChanged => {
                refresh_status(&launcher, &mut current_status);
                status::write_status(&status_path, &current_status);
            }

            LauncherEvent::TaskFinished { task, result } => {
                if busy == Some(task) {
                    busy = None;
                }
                match result {
                    Ok(message) if message.is_empty() => {}
                    Ok(message) => {
                        println!("{message}");
                        current_status.last_message = Some(message);
                        current_status.error = None;
                    }
                    Err(e) => {
                        println!("{e}");
                        current_status.error = Some(format!("{task} failed: {e}"));
                    }
                }
                refresh_status(&launcher, &mut current_status);
                status::write_status(&status_path, &current_status);

                if shutting_down && task == TaskKind::Stop {
                    break;
                }
            }
        }
    }

    if persist_companion {
        if let Err(e) = launcher.set_companion_preference(with_companion) {
            warn!("Failed to save the TF2 preference: {e}");
        }
    }
    current_status.set_state(SupervisorState::Idle, None);
    status::write_status(&status_path, &current_status);
    Ok(ExitCode::SUCCESS)
}

/// Turns change signals into [`LauncherEvent::StatusChanged`]. Signals
/// raised while one is pending coalesce; a full channel delays the event
/// rather than losing it.
fn forward_status_changes(
    mut changes: watch::Receiver<()>,
    events: mpsc::Sender<LauncherEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while changes.changed().await.is_ok() {
            if events.send(LauncherEvent::StatusChanged).await.is_err() {
                break;
            }
        }
    })
}

/// Runs `work` on its own task and reports the result as
/// [`LauncherEvent::TaskFinished`].
fn spawn_task<F>(task: TaskKind, events: &mpsc::Sender<LauncherEvent>, work: F)
where
    F: Future<Output = Result<String, String>> + Send + 'static,
{
    let events = events.clone();
    tokio::spawn(async move {
        let result = work.await;
        let _ = events.send(LauncherEvent::TaskFinished { task, result }).await;
    });
}

fn start_managed(
    launcher: &Arc<Launcher>,
    events: &mpsc::Sender<LauncherEvent>,
    busy: Option<TaskKind>,
    with_companion: bool,
) {
    if let Some(task) = busy {
        println!("Wait for the {task} to finish before launching MAC.");
        return;
    }
    let launcher = Arc::clone(launcher);
    let output = events.clone();
    spawn_task(TaskKind::Launch, events, async move {
        match launcher.launch(with_companion, output).await {
            Ok(LaunchOutcome::Spawned { .. }) => Ok(format!(
                "MAC is running. Web interface: {}",
                status::WEB_INTERFACE_URL
            )),
            // Already reported on the output channel.
            Ok(LaunchOutcome::AlreadyRunning) => Ok(String::new()),
            Ok(LaunchOutcome::Failed) => Err("MAC did not start.".to_string()),
            Err(e) => Err(e.to_string()),
        }
    });
}

async fn stop_managed(launcher: Arc<Launcher>) -> Result<String, String> {
    let supervisor = launcher.supervisor();
    let was_active = supervisor.is_running() || supervisor.state() != SupervisorState::Idle;
    launcher.stop().await;
    Ok(if was_active {
        "MAC stopped.".to_string()
    } else {
        String::new()
    })
}

fn refresh_status(launcher: &Launcher, status: &mut LauncherStatus) {
    let supervisor = launcher.supervisor();
    status.set_state(supervisor.state(), supervisor.pid());
    match launcher.installed_version() {
        Ok(version) => status.installed_version = version,
        Err(e) => status.error = Some(e.to_string()),
    }
}

fn print_session(status: &LauncherStatus, with_companion: bool) {
    println!("State:             {}", status.state);
    if let Some(pid) = status.pid {
        println!("PID:               {pid}");
    }
    println!(
        "Installed version: {}",
        status.installed_version.as_deref().unwrap_or("none")
    );
    if let Some(url) = &status.web_interface {
        println!("Web interface:     {url}");
    }
    println!("Launch TF2:        {}", if with_companion { "yes" } else { "no" });
    if let Some(error) = &status.error {
        println!("Last error:        {error}");
    }
}
