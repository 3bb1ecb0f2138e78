//! tunectl - command line entry point
//!
//! `tunectl play`/`tunectl daemon` become the singleton (replacing a running
//! one); every other subcommand is a short-lived client of it.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{ExitCode, Stdio};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use tunectl::channel::ControlClient;
use tunectl::now_playing::status_line;
use tunectl::{logging, Daemon, InstanceRegistry, Intent, Role};
use tunectl_common::config::{BackendKind, ConfigPaths, TomlConfig};
use tunectl_common::{ControlCommand, StateSnapshot};

/// Command-line arguments for tunectl
#[derive(Parser, Debug)]
#[command(name = "tunectl")]
#[command(about = "Music playback controller with a single background instance")]
#[command(version)]
struct Cli {
    /// Configuration directory (lock, socket, config.toml)
    #[arg(long, global = true, env = "TUNECTL_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// Print snapshots as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Set on the re-executed child of `--background`
    #[arg(long, global = true, hide = true)]
    detached: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the background instance playing the given tracks
    Play {
        /// Track ids, URLs or file paths
        #[arg(required = true)]
        tracks: Vec<String>,

        #[command(flatten)]
        start: StartArgs,
    },
    /// Start an idle background instance
    Daemon {
        #[command(flatten)]
        start: StartArgs,
    },
    /// Send one command to the running instance
    Ctl {
        #[command(subcommand)]
        command: CtlCommand,
    },
    /// Show the current playback state
    Status,
    /// Print a snapshot after every state change
    Watch,
    /// List audio output devices
    Devices,
    /// Print the effective configuration as TOML
    Config,
}

#[derive(Args, Debug)]
struct StartArgs {
    /// Detach from the terminal
    #[arg(short, long)]
    background: bool,

    /// Media backend (overrides config.toml)
    #[arg(long, value_enum)]
    backend: Option<BackendArg>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BackendArg {
    Mpv,
    Memory,
}

impl BackendArg {
    fn as_str(self) -> &'static str {
        match self {
            BackendArg::Mpv => "mpv",
            BackendArg::Memory => "memory",
        }
    }
}

impl From<BackendArg> for BackendKind {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Mpv => BackendKind::Mpv,
            BackendArg::Memory => BackendKind::Memory,
        }
    }
}

#[derive(Subcommand, Debug)]
enum CtlCommand {
    Play,
    Pause,
    TogglePause,
    Next,
    Prev,
    /// Seek forward by SECONDS (default from config)
    SeekForward { seconds: Option<f64> },
    /// Seek back by SECONDS (default from config)
    SeekBack { seconds: Option<f64> },
    /// Raise volume by STEP (default from config)
    VolumeUp { step: Option<u8> },
    /// Lower volume by STEP (default from config)
    VolumeDown { step: Option<u8> },
    Mute,
    SetOutputDevice { device: String },
    Quit,
    QueryState,
}

impl From<CtlCommand> for ControlCommand {
    fn from(command: CtlCommand) -> Self {
        match command {
            CtlCommand::Play => ControlCommand::Play,
            CtlCommand::Pause => ControlCommand::Pause,
            CtlCommand::TogglePause => ControlCommand::TogglePause,
            CtlCommand::Next => ControlCommand::Next,
            CtlCommand::Prev => ControlCommand::Prev,
            CtlCommand::SeekForward { seconds } => ControlCommand::SeekForward { seconds },
            CtlCommand::SeekBack { seconds } => ControlCommand::SeekBack { seconds },
            CtlCommand::VolumeUp { step } => ControlCommand::VolumeUp { step },
            CtlCommand::VolumeDown { step } => ControlCommand::VolumeDown { step },
            CtlCommand::Mute => ControlCommand::Mute,
            CtlCommand::SetOutputDevice { device } => ControlCommand::SetOutputDevice { device },
            CtlCommand::Quit => ControlCommand::Quit,
            CtlCommand::QueryState => ControlCommand::QueryState,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{:#}", err);
            eprintln!("tunectl: {:#}", err);
            ExitCode::from(exit_code(&err))
        }
    }
}

/// Exit status of the innermost tunectl error, 1 for anything else
fn exit_code(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<tunectl::Error>())
        .map_or(1, tunectl::Error::exit_code)
}

async fn run(cli: Cli) -> Result<()> {
    let paths = ConfigPaths::resolve(cli.config_dir.as_deref());
    let config_file = paths.config_file();
    let loaded = config_file.exists().then(|| TomlConfig::load(&config_file));
    let config = match &loaded {
        Some(Ok(config)) => config.clone(),
        _ => TomlConfig::default(),
    };

    let starts_singleton = matches!(cli.command, Command::Play { .. } | Command::Daemon { .. });
    let default_level = if starts_singleton {
        config.logging.level.as_str()
    } else {
        "warn"
    };
    let level = cli.log_level.as_deref().unwrap_or(default_level);
    if starts_singleton && cli.detached {
        let log_file = config.logging.file.clone().unwrap_or_else(|| paths.log_file());
        logging::init_file(level, &log_file)?;
    } else {
        logging::init(level)?;
    }
    if let Some(Err(e)) = &loaded {
        warn!("Ignoring config file {}: {}", config_file.display(), e);
    }

    let json = cli.json;
    let launch = Launch {
        detached: cli.detached,
        log_level: cli.log_level,
    };
    match cli.command {
        Command::Play { tracks, start } => start_singleton(paths, config, tracks, start, launch).await,
        Command::Daemon { start } => start_singleton(paths, config, Vec::new(), start, launch).await,
        Command::Ctl { command } => {
            let snapshot = forward(paths, &config, command.into()).await?;
            print_snapshot(&snapshot, json)
        }
        Command::Status => {
            let snapshot = forward(paths, &config, ControlCommand::QueryState).await?;
            print_snapshot(&snapshot, json)
        }
        Command::Devices => {
            let snapshot = forward(paths, &config, ControlCommand::QueryState).await?;
            print_devices(&snapshot, json)
        }
        Command::Watch => watch(paths, &config, json).await,
        Command::Config => {
            if json {
                println!("{}", serde_json::to_string(&config)?);
            } else {
                print!("{}", toml::to_string_pretty(&config)?);
            }
            Ok(())
        }
    }
}

/// Global flags a singleton start carries into its background child
struct Launch {
    detached: bool,
    log_level: Option<String>,
}

async fn start_singleton(
    paths: ConfigPaths,
    mut config: TomlConfig,
    tracks: Vec<String>,
    start: StartArgs,
    launch: Launch,
) -> Result<()> {
    if let Some(backend) = start.backend {
        config.backend.kind = backend.into();
    }
    if start.background && !launch.detached {
        let args = background_args(&paths, launch.log_level.as_deref(), start.backend, &tracks);
        return spawn_background(paths, &config, args).await;
    }

    paths.ensure_exists().context("Failed to create configuration directory")?;
    TomlConfig::write_default_if_missing(&paths.config_file())
        .context("Failed to write default configuration")?;

    let registry = InstanceRegistry::new(paths.clone(), &config.channel);
    let guard = match registry.acquire_or_forward(Intent::Start).await? {
        Role::Singleton(guard) => guard,
        Role::Forwarded(_) => bail!("start request was forwarded instead of claimed"),
    };
    info!("Running as singleton (pid {})", std::process::id());

    let shutdown = CancellationToken::new();
    let signalled = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signalled.cancel();
    });

    Daemon::new(paths, config)
        .with_queue(tracks)
        .run(guard, shutdown)
        .await
        .context("Singleton failed")
}

/// Command line of the detached child: same start request, no `--background`
fn background_args(
    paths: &ConfigPaths,
    log_level: Option<&str>,
    backend: Option<BackendArg>,
    tracks: &[String],
) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["--config-dir".into(), paths.root().into(), "--detached".into()];
    if let Some(level) = log_level {
        args.push("--log-level".into());
        args.push(level.into());
    }
    let subcommand = if tracks.is_empty() { "daemon" } else { "play" };
    args.push(subcommand.into());
    if let Some(backend) = backend {
        args.push("--backend".into());
        args.push(backend.as_str().into());
    }
    if !tracks.is_empty() {
        args.push("--".into());
        args.extend(tracks.iter().map(OsString::from));
    }
    args
}

/// Re-execute ourselves detached and wait for the child to register
async fn spawn_background(paths: ConfigPaths, config: &TomlConfig, args: Vec<OsString>) -> Result<()> {
    use std::os::unix::process::CommandExt;

    let exe = std::env::current_exe().context("Cannot locate tunectl executable")?;

    let mut child = std::process::Command::new(exe)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0)
        .spawn()
        .context("Failed to start background instance")?;
    let pid = child.id();

    let registry = InstanceRegistry::new(paths, &config.channel);
    let deadline = tokio::time::Instant::now() + config.channel.lock_wait() + config.channel.client_timeout();
    loop {
        if let Ok(Some(record)) = registry.lookup().await {
            if record.pid == pid {
                println!("tunectl running in background (pid {})", pid);
                return Ok(());
            }
        }
        if let Some(status) = child.try_wait()? {
            bail!("background instance exited early ({})", status);
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("background instance (pid {}) did not register in time", pid);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

async fn forward(paths: ConfigPaths, config: &TomlConfig, command: ControlCommand) -> Result<StateSnapshot> {
    let registry = InstanceRegistry::new(paths, &config.channel);
    match registry.acquire_or_forward(Intent::Command(command)).await? {
        Role::Forwarded(snapshot) => Ok(snapshot),
        Role::Singleton(_) => bail!("command request claimed the instance lock"),
    }
}

async fn watch(paths: ConfigPaths, config: &TomlConfig, json: bool) -> Result<()> {
    let registry = InstanceRegistry::new(paths, &config.channel);
    let record = registry.lookup().await?.ok_or(tunectl::Error::NoRunningInstance)?;
    let mut observer = ControlClient::new(&record.address, config.channel.client_timeout())
        .subscribe()
        .await?;
    while let Some(snapshot) = observer.next().await? {
        print_snapshot(&snapshot, json)?;
    }
    Ok(())
}

fn print_snapshot(snapshot: &StateSnapshot, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(snapshot)?);
    } else {
        let mute = if snapshot.muted { " (muted)" } else { "" };
        println!("{}  vol {}%{}", status_line(snapshot), snapshot.volume, mute);
    }
    Ok(())
}

fn print_devices(snapshot: &StateSnapshot, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(&snapshot.devices)?);
        return Ok(());
    }
    for device in &snapshot.devices {
        let marker = if device.name == snapshot.output_device { "*" } else { " " };
        println!("{} {}  {}", marker, device.name, device.description);
    }
    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
