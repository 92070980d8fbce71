mod capture;
mod context;
mod error;
mod fsutil;
mod home;
mod install;
mod net;
mod process;
mod selfupdate;
mod shell_profile;
mod terminal;
mod worker;

use capture::{CaptureRequest, CaptureSource, ScrollbackCapturer};
use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use context::{Context, BUNDLE_URL_ENV, RELEASE_BASE_URL_ENV, REPO_URL_ENV};
use dialoguer::console::style;
use error::{GodoError, Result};
use home::{GlobalHome, DEFAULT_WORKER_PORT};
use install::{BundleInstaller, BundleSource, HttpArchiveSource, InstallMode, InstallTarget};
use process::{PathLocator, SystemRunner};
use selfupdate::{HttpImageSource, SelfUpdater, UpdateRoute};
use shell_profile::ProfileChange;
use std::io::{self, IsTerminal};
use std::path::PathBuf;
use terminal::TerminalKind;
use tracing::debug;
use tracing_subscriber::EnvFilter;
use worker::{HttpHealthProbe, StopOutcome, SystemProcessTable, WorkerSupervisor};

const LOG_ENV: &str = "GODO_LOG";

const USAGE: &str = "godo - Do CLI installer

Usage:
  godo sync [--force]       Install or update Do in the current project
  godo worker start         Start the memory worker (restart is an alias)
  godo worker stop          Stop the memory worker
  godo worker status        Show worker status
  godo selfupdate           Update godo itself
  godo capture -o <file>    Capture the terminal buffer to a file
  godo setup-logging        Install the claude session logger into your shell rc
  godo version              Show version
  godo help                 Show this help

Examples:
  cd my-project
  godo sync                              # Install or update Do
  godo worker start                      # Start memory worker
  godo selfupdate                        # Update godo CLI
  godo capture --output terminal.txt     # Capture terminal buffer";

#[derive(Parser, Debug)]
#[command(
    name = "godo",
    disable_help_flag = true,
    disable_help_subcommand = true,
    disable_version_flag = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Install or update Do in the current directory.
    Sync {
        /// Also overwrite user-owned files (CLAUDE.md, settings.json, .do/config).
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    #[command(name = "selfupdate", alias = "self-update")]
    SelfUpdate,
    Capture {
        #[arg(short = 'o', long)]
        output: PathBuf,
        /// Accepted for compatibility; the full history is always captured.
        #[arg(short = 'n', long)]
        lines: Option<usize>,
    },
    SetupLogging,
    Worker {
        #[command(subcommand)]
        command: WorkerCommand,
    },
    #[command(short_flag = 'v', long_flag = "version")]
    Version,
    #[command(short_flag = 'h', long_flag = "help")]
    Help,
}

#[derive(Subcommand, Debug)]
enum WorkerCommand {
    #[command(alias = "restart")]
    Start,
    Stop,
    Status,
}

fn main() {
    init_tracing();
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) {
                let _ = err.print();
                std::process::exit(0);
            }
            eprintln!("{err}");
            eprintln!("{USAGE}");
            std::process::exit(1);
        }
    };
    let Some(command) = cli.command else {
        eprintln!("{USAGE}");
        std::process::exit(1);
    };

    if let Err(err) = run(command) {
        eprintln!("{} {err}", style("Error:").red().bold());
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal())
        .with_target(false)
        .try_init();
}

fn run(command: Commands) -> Result<()> {
    let ctx = Context::from_process()?;
    match command {
        Commands::Sync { force } => handle_sync(&ctx, force),
        Commands::SelfUpdate => handle_selfupdate(&ctx),
        Commands::Capture { output, lines } => handle_capture(&ctx, output, lines),
        Commands::SetupLogging => handle_setup_logging(&ctx),
        Commands::Worker { command } => handle_worker(&ctx, command),
        Commands::Version => {
            println!("godo version {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Help => {
            println!("{USAGE}");
            Ok(())
        }
    }
}

fn ok_mark() -> String {
    style("✓").green().bold().to_string()
}

fn warn_mark() -> String {
    style("Warning:").yellow().bold().to_string()
}

fn handle_sync(ctx: &Context, force: bool) -> Result<()> {
    let target = InstallTarget::new(ctx.cwd.clone());
    if target.is_source_checkout() {
        return Err(GodoError::precondition(
            "godo sync cannot run inside the Do development folder",
            "Run it from another project folder",
        ));
    }

    println!();
    println!("{}", style("Do - Claude Code project environment").bold().cyan());
    println!();

    let home = GlobalHome::new(ctx.global_root());
    match home.initialize() {
        Ok(()) => {
            if let Err(err) = home.register_project(&ctx.cwd) {
                println!("{} failed to register project: {err}", warn_mark());
            }
        }
        Err(err) => println!("{} failed to initialize {}: {err}", warn_mark(), home.root().display()),
    }

    let runner = SystemRunner;
    let archives = HttpArchiveSource;
    let installer = BundleInstaller::new(&archives, &runner).with_urls(
        ctx.env.get(BUNDLE_URL_ENV),
        ctx.env.get(REPO_URL_ENV),
    );
    println!("Downloading...");
    let outcome = installer.install(&target, force)?;

    if let Some(reason) = &outcome.fallback_reason {
        println!("{} release download failed, used git clone: {reason}", warn_mark());
    }
    let source = match outcome.source {
        BundleSource::Release => "release archive",
        BundleSource::GitClone => "git clone",
    };
    println!("  {} files written from {source}", outcome.written);
    if !outcome.preserved.is_empty() {
        println!(
            "  kept your versions of: {}",
            style(outcome.preserved.join(", ")).dim()
        );
    }
    for seeded in &outcome.seeded {
        println!("  created {seeded}");
    }
    match outcome.mode {
        InstallMode::Fresh => println!("{} Do installed", ok_mark()),
        InstallMode::Update => println!("{} Do updated", ok_mark()),
    }

    match shell_profile::install_logging(&ctx.env, &ctx.home) {
        Ok(report) => print_profile_change(&report),
        Err(err) => println!("{} session logging not configured: {err}", warn_mark()),
    }
    println!("Start Claude Code in this folder to begin.");
    Ok(())
}

fn print_profile_change(report: &shell_profile::ProfileReport) {
    let rc = report.rc_file.display();
    debug!(shell = ?report.shell, change = ?report.change, "shell profile");
    match report.change {
        ProfileChange::Appended => {
            println!("{} session logging added to {rc}", ok_mark());
            println!("  Run: source {rc}");
        }
        ProfileChange::Replaced => {
            println!("{} session logging updated in {rc}", ok_mark());
            println!("  Run: source {rc}");
        }
        ProfileChange::Unchanged => println!("{} session logging already set up in {rc}", ok_mark()),
    }
}

fn handle_setup_logging(ctx: &Context) -> Result<()> {
    let report = shell_profile::install_logging(&ctx.env, &ctx.home)?;
    print_profile_change(&report);
    Ok(())
}

fn handle_selfupdate(ctx: &Context) -> Result<()> {
    println!("Updating godo...");
    println!("Current version: {}", env!("CARGO_PKG_VERSION"));
    let runner = SystemRunner;
    let images = HttpImageSource;
    let updater = SelfUpdater::new(
        &runner,
        &images,
        &ctx.env,
        ctx.env.get(RELEASE_BASE_URL_ENV),
        &ctx.exe_path,
    );
    match updater.update()? {
        UpdateRoute::PackageManager => {}
        UpdateRoute::Direct { url, bytes } => {
            println!("Downloaded {url} ({bytes} bytes)");
        }
    }
    println!("{} godo updated", ok_mark());
    Ok(())
}

fn handle_capture(ctx: &Context, output: PathBuf, lines: Option<usize>) -> Result<()> {
    if let Some(lines) = lines {
        debug!(lines, "--lines ignored, capturing full history");
    }
    let kind = TerminalKind::detect(&ctx.env);
    println!("Detected terminal: {kind}");

    let runner = SystemRunner;
    let locator = PathLocator;
    let capturer = ScrollbackCapturer::new(&runner, &locator, &ctx.env, std::env::temp_dir());
    let request = CaptureRequest {
        output,
        tail_lines: None,
    };
    let report = capture::capture(&capturer, kind, &request, &ctx.global_root())?;

    if let CaptureSource::TranscriptFallback { transcript, reason } = &report.source {
        println!("{} live capture unavailable: {reason}", warn_mark());
        println!("  using session transcript {}", transcript.display());
    }
    println!(
        "{} Captured {} lines to {}",
        ok_mark(),
        report.line_count,
        report.output.display()
    );
    Ok(())
}

fn handle_worker(ctx: &Context, command: WorkerCommand) -> Result<()> {
    let home = GlobalHome::new(ctx.global_root());
    let port = match home.load_config() {
        Ok(config) => config.worker.port,
        Err(err) => {
            println!(
                "{} ignoring unreadable {}: {err}",
                warn_mark(),
                home.config_path().display()
            );
            DEFAULT_WORKER_PORT
        }
    };
    let runner = SystemRunner;
    let table = SystemProcessTable::new(&runner);
    let probe = HttpHealthProbe::new();
    let locator = PathLocator;
    let supervisor = WorkerSupervisor::new(&probe, &table, &locator, &home, port);

    match command {
        WorkerCommand::Start => {
            let report = supervisor.start()?;
            debug!(binary = %report.binary.display(), "worker binary");
            if let Some(pid) = report.replaced {
                println!("Stopped existing worker (PID: {pid})");
            }
            if report.healthy {
                println!("{} Worker started (PID: {})", ok_mark(), report.pid);
                println!("  {}", report.address);
            } else {
                println!(
                    "{} worker (PID: {}) may not have started correctly",
                    warn_mark(),
                    report.pid
                );
            }
        }
        WorkerCommand::Stop => match supervisor.stop()? {
            StopOutcome::NotRunning => println!("Worker is not running"),
            StopOutcome::Stopped(pid) => println!("{} Worker stopped (PID: {pid})", ok_mark()),
        },
        WorkerCommand::Status => {
            let status = supervisor.status();
            if status.running {
                match status.pid {
                    Some(pid) => println!("{} Worker is running (PID: {pid})", ok_mark()),
                    None => println!("{} Worker is running", ok_mark()),
                }
                println!("  {}", status.address);
                if let Some(health) = &status.health {
                    if let Some(version) = &health.version {
                        println!("  Version: {version}");
                    }
                    if let Some(db) = &health.db_type {
                        println!("  DB: {db}");
                    }
                }
            } else {
                println!("{} Worker is not running", style("✗").red().bold());
                println!("  Start with: godo worker start");
            }
        }
    }
    Ok(())
}
