//! Hamburger gateway CLI
//!
//! Subcommands: `generate` writes a default JSON config, `run` starts the
//! gateway (pid file + graceful shutdown), `test` parses and merges the
//! configuration, `reload` signals the running process and spawns a fresh
//! one once it has exited.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use hamburger::config::Config;
use hamburger::proxy::Gateway;
use hamburger::runtime::{AppRegistry, FileRegistry, StaticRegistry};
use hamburger::server::ServerManager;
use hamburger::stat::NoGeo;
use hamburger::tls::TlsManager;

const PID_FILE: &str = "hamburger.pid";
const RELOAD_WAIT: Duration = Duration::from_secs(30);

/// Hamburger - HTTP reverse proxy / API gateway
#[derive(Parser, Debug)]
#[command(name = "hamburger")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(
        short = 'c',
        long = "config",
        global = true,
        default_value = "config/config.json",
        env = "HAMBURGER_CONFIG"
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Emit a default JSON configuration file
    Generate,
    /// Start the gateway
    Run,
    /// Parse and merge the configuration, then exit
    Test,
    /// Signal the running gateway and start a replacement
    Reload,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let result = match cli.command {
        Command::Generate => generate(&cli.config),
        Command::Run => run(&cli.config),
        Command::Test => test_config(&cli.config),
        Command::Reload => reload(&cli.config),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("hamburger: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn generate(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
    }
    std::fs::write(path, Config::generate_default())
        .with_context(|| format!("write {}", path.display()))?;
    println!("default config written to {}", path.display());
    Ok(())
}

fn test_config(path: &Path) -> anyhow::Result<()> {
    Config::load(path)?;
    println!("config ok");
    Ok(())
}

fn run(path: &Path) -> anyhow::Result<()> {
    let config = Arc::new(Config::load(path)?);
    init_logging(&config)?;

    // TLS needs a process-wide crypto provider before any handshake.
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();

    let runtime = build_runtime(config.max_cores)?;
    runtime.block_on(serve(config))
}

fn build_runtime(max_cores: usize) -> anyhow::Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if max_cores > 0 {
        builder.worker_threads(max_cores);
    }
    builder.build().context("build tokio runtime")
}

async fn serve(config: Arc<Config>) -> anyhow::Result<()> {
    info!(version = hamburger::VERSION, "starting {}", hamburger::NAME);

    write_pid_file()?;

    // The MongoDB-backed registry is an external collaborator; a domain-map
    // style JSON registry file stands in when configured, otherwise the
    // topology starts empty and fills on the next sync.
    let registry: Arc<dyn AppRegistry> = if config.database.mongo.url.is_empty() {
        warn!("no app registry configured, backend port map will be empty");
        Arc::new(StaticRegistry::empty())
    } else {
        Arc::new(FileRegistry::new(config.database.mongo.url.clone()))
    };

    let gateway = Gateway::new(Arc::clone(&config), registry, Arc::new(NoGeo));
    gateway.start_background_tasks();

    let tls = Arc::new(TlsManager::new(&config));
    tls.load_static_certs();

    let manager = ServerManager::new(Arc::clone(&config), gateway, tls);
    manager.start().await?;
    info!(servers = ?manager.running_servers(), "gateway is serving");

    wait_for_shutdown().await;
    info!("received shutdown signal, gracefully shutting down");
    manager.stop().await;
    remove_pid_file();
    Ok(())
}

async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

fn write_pid_file() -> anyhow::Result<()> {
    std::fs::write(PID_FILE, std::process::id().to_string()).context("write pid file")
}

fn remove_pid_file() {
    if let Err(e) = std::fs::remove_file(PID_FILE) {
        error!(error = %e, "failed to remove pid file");
    }
}

/// Signal the running instance, wait for it to exit, start a replacement.
fn reload(config_path: &Path) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(PID_FILE)
        .with_context(|| format!("read {PID_FILE} (is the gateway running?)"))?;
    let pid: i32 = raw.trim().parse().context("parse pid file")?;

    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid),
        nix::sys::signal::Signal::SIGTERM,
    )
    .with_context(|| format!("signal pid {pid}"))?;
    println!("sent SIGTERM to pid {pid}");

    // The old process removes its pid file on clean exit.
    let deadline = std::time::Instant::now() + RELOAD_WAIT;
    while Path::new(PID_FILE).exists() {
        if std::time::Instant::now() > deadline {
            bail!("old process did not exit within {RELOAD_WAIT:?}");
        }
        std::thread::sleep(Duration::from_millis(200));
    }

    let exe = std::env::current_exe().context("locate current executable")?;
    std::process::Command::new(exe)
        .arg("run")
        .arg("--config")
        .arg(config_path)
        .spawn()
        .context("spawn replacement process")?;
    println!("replacement process started");
    Ok(())
}

fn init_logging(config: &Config) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log.log_level.clone()));

    if config.log.log_file.is_empty() {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(config.log.color)
            .init();
    } else {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.log.log_file)
            .with_context(|| format!("open log file {}", config.log.log_file))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(Arc::new(file))
            .init();
    }
    Ok(())
}
