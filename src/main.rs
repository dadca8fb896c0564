//! Binary entry point: CLI flags, logging, signal handling, and the fatal
//! channel that turns upstream data corruption into a clean exit.

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, OnceLock};

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use avctl::{BotBridge, BridgeReceivers, Config, Server};

/// The running server, kept reachable for the panic recovery path.
static ACTIVE: OnceLock<Arc<Server>> = OnceLock::new();

#[derive(Parser)]
#[command(
    name = "avctl",
    about = "Supervisor and chat bridge for an Avorion dedicated server",
    version
)]
struct Cli {
    /// Configuration file
    #[arg(short = 'c', long = "config", default_value = "avctl.toml")]
    config: PathBuf,

    /// Bot token override
    #[arg(short = 't', long = "token")]
    token: Option<String>,

    /// Log level (0 = warn, 1 = info, 2 = debug, 3 = trace)
    #[arg(short = 'l', long = "log-level")]
    log_level: Option<u8>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("avctl: failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Handler panics are isolated at the dispatch boundary; this is the last
    // resort for everything else, so the game still gets a clean stop.
    let result = std::panic::catch_unwind(AssertUnwindSafe(|| runtime.block_on(run(cli))));
    match result {
        Ok(Ok(code)) => code,
        Ok(Err(e)) => {
            eprintln!("avctl: {e:#}");
            ExitCode::FAILURE
        }
        Err(_) => {
            eprintln!("avctl: panic caught, attempting to stop the server");
            if let Some(server) = ACTIVE.get() {
                if server.is_up() {
                    let _ = runtime.block_on(server.stop(true));
                }
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = load_config(&cli)?;
    init_tracing(&config).context("failed to initialize logging")?;

    let exit = CancellationToken::new();
    let tracker = TaskTracker::new();
    let (fatal_tx, mut fatal_rx) = mpsc::channel(4);
    let (bridge, receivers) = BotBridge::connected(64);
    spawn_bridge_drain(receivers, &tracker, exit.clone());

    let server = Server::new(config, bridge, exit.clone(), tracker.clone(), fatal_tx)
        .context("failed to construct server")?;
    let _ = ACTIVE.set(server.clone());

    server.start(true).await.context("failed to start server")?;

    let mut signals = Signals::new().context("failed to register signal handlers")?;
    info!("completed init, awaiting termination signal");

    let code = loop {
        tokio::select! {
            control = signals.next() => match control {
                Control::Shutdown => {
                    info!("caught termination signal, gracefully stopping");
                    break ExitCode::SUCCESS;
                }
                Control::ReloadRestart => {
                    info!("caught SIGUSR1, reloading configuration and restarting");
                    reload_config(&cli, &server);
                    if let Err(e) = server.restart().await {
                        error!(error = %e, "restart failed");
                    }
                }
                Control::StopReload => {
                    info!("caught SIGUSR2, stopping server");
                    if let Err(e) = server.stop(true).await {
                        error!(error = %e, "stop failed");
                    }
                    reload_config(&cli, &server);
                }
                Control::Ignored => info!("ignoring signal"),
            },

            fatal = fatal_rx.recv() => {
                if let Some(err) = fatal {
                    error!(error = %err, "fatal error raised, shutting down");
                    if let Err(e) = server.stop(true).await {
                        error!(error = %e, "stop after fatal error failed");
                    }
                    break ExitCode::FAILURE;
                }
            }
        }
    };

    exit.cancel();
    tracker.close();
    tracker.wait().await;

    if let Err(e) = server.config_snapshot().save(&cli.config) {
        error!(error = %e, "failed to persist configuration");
    }
    Ok(code)
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = if cli.config.exists() {
        Config::load(&cli.config).context("failed to load configuration")?
    } else {
        Config::default()
    };
    if let Some(token) = &cli.token {
        config.discord.token = token.clone();
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    Ok(config)
}

fn reload_config(cli: &Cli, server: &Arc<Server>) {
    match Config::load(&cli.config) {
        Ok(mut config) => {
            if let Some(token) = &cli.token {
                config.discord.token = token.clone();
            }
            server.reload_config(config);
        }
        Err(e) => error!(error = %e, "configuration reload failed"),
    }
}

fn init_tracing(config: &Config) -> anyhow::Result<()> {
    let level = match config.log_level {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    match &config.log_directory {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join("avctl.log"))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .compact()
                .with_writer(Arc::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .compact()
                .init();
        }
    }
    Ok(())
}

/// Attach point for the chat bot. Until one is wired in, the conduits are
/// drained so the supervisor never observes a stalled pipe.
fn spawn_bridge_drain(receivers: BridgeReceivers, tracker: &TaskTracker, exit: CancellationToken) {
    let BridgeReceivers { mut chat, mut log } = receivers;
    let chat_exit = exit.clone();
    tracker.spawn(async move {
        loop {
            tokio::select! {
                _ = chat_exit.cancelled() => break,
                message = chat.recv() => match message {
                    Some(m) => debug!(name = ?m.name, "bridge chat: {}", m.text),
                    None => break,
                },
            }
        }
    });
    tracker.spawn(async move {
        loop {
            tokio::select! {
                _ = exit.cancelled() => break,
                message = log.recv() => match message {
                    Some(m) => debug!("bridge log: {}", m.text),
                    None => break,
                },
            }
        }
    });
}

enum Control {
    Shutdown,
    ReloadRestart,
    StopReload,
    Ignored,
}

#[cfg(unix)]
struct Signals {
    int: tokio::signal::unix::Signal,
    term: tokio::signal::unix::Signal,
    usr1: tokio::signal::unix::Signal,
    usr2: tokio::signal::unix::Signal,
    hup: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn new() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            int: signal(SignalKind::interrupt())?,
            term: signal(SignalKind::terminate())?,
            usr1: signal(SignalKind::user_defined1())?,
            usr2: signal(SignalKind::user_defined2())?,
            hup: signal(SignalKind::hangup())?,
        })
    }

    async fn next(&mut self) -> Control {
        tokio::select! {
            _ = self.int.recv() => Control::Shutdown,
            _ = self.term.recv() => Control::Shutdown,
            _ = self.usr1.recv() => Control::ReloadRestart,
            _ = self.usr2.recv() => Control::StopReload,
            _ = self.hup.recv() => Control::Ignored,
        }
    }
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    fn new() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn next(&mut self) -> Control {
        let _ = tokio::signal::ctrl_c().await;
        Control::Shutdown
    }
}
