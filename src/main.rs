// Catalyst CLI - Infrastructure Automation Engine

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use colored::*;
use tracing::{debug, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use catalyst::config::EngineConfig;
use catalyst::executor::{AutoConnector, EngineContext, Scheduler, SshConnector};
use catalyst::loader::{self, SAMPLE_INVENTORY, SAMPLE_PLAN};
use catalyst::modules::ModuleRegistry;
use catalyst::output::{EngineError, OutputFormat, OutputWriter, EXIT_CONFIG_ERROR};

#[derive(Parser)]
#[command(
    name = "catalyst",
    about = "Infrastructure automation engine",
    version,
    disable_colored_help = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output (debug logging, full task output)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode - only show failures
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    output_format: String,

    /// Also append logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
#[command(disable_colored_help = true)]
enum Commands {
    /// Write a sample inventory.yaml and plan.yaml
    Init {
        /// Target directory
        #[arg(default_value = ".")]
        dir: PathBuf,

        /// Overwrite existing files
        #[arg(short, long)]
        force: bool,
    },

    /// Run a plan against an inventory
    Deploy {
        /// Path to the inventory file
        #[arg(short, long, default_value = "inventory.yaml")]
        inventory: PathBuf,

        /// Path to the plan file
        #[arg(short, long, default_value = "plan.yaml")]
        plan: PathBuf,

        /// Engine configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Maximum concurrent sessions across all hosts
        #[arg(short, long)]
        forks: Option<usize>,

        /// Maximum concurrent sessions per host
        #[arg(long)]
        max_per_host: Option<usize>,

        /// Default task timeout in seconds
        #[arg(short, long)]
        timeout: Option<u64>,

        /// SSH user for hosts without one
        #[arg(short, long)]
        user: Option<String>,

        /// SSH private key for hosts without credentials
        #[arg(long)]
        private_key: Option<PathBuf>,

        /// Prompt for the SSH password
        #[arg(short = 'k', long)]
        ask_pass: bool,
    },
}

struct DeployArgs {
    inventory: PathBuf,
    plan: PathBuf,
    config: Option<PathBuf>,
    forks: Option<usize>,
    max_per_host: Option<usize>,
    timeout: Option<u64>,
    user: Option<String>,
    private_key: Option<PathBuf>,
    ask_pass: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = init_tracing(cli.verbose, cli.log_file.as_deref()) {
        eprintln!("{} cannot open log file: {}", "ERROR".red().bold(), e);
        std::process::exit(EXIT_CONFIG_ERROR);
    }

    // Parse output format
    let output_format = OutputFormat::from_str(&cli.output_format).unwrap_or_else(|e| {
        eprintln!("{}. Using 'text'.", e);
        OutputFormat::Text
    });

    let code = match cli.command {
        Commands::Init { dir, force } => match init_project(&dir, force) {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("{} {:#}", "ERROR".red().bold(), e);
                EXIT_CONFIG_ERROR
            }
        },
        Commands::Deploy {
            inventory,
            plan,
            config,
            forks,
            max_per_host,
            timeout,
            user,
            private_key,
            ask_pass,
        } => {
            let args = DeployArgs {
                inventory,
                plan,
                config,
                forks,
                max_per_host,
                timeout,
                user,
                private_key,
                ask_pass,
            };
            let mut output = OutputWriter::new(output_format, cli.verbose, cli.quiet);
            match deploy(args, &mut output).await {
                Ok(code) => code,
                Err(e) => {
                    output.print_error(&e);
                    EXIT_CONFIG_ERROR
                }
            }
        }
    };

    std::process::exit(code);
}

/// Logs go to stderr so stdout stays clean for text or JSON output.
/// With `--log-file` the same events are appended there without colors.
fn init_tracing(verbose: bool, log_file: Option<&Path>) -> io::Result<()> {
    let default = if verbose { "catalyst=debug" } else { "catalyst=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let file_layer = match log_file {
        Some(path) => Some(
            fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(open_log_file(path)?)),
        ),
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr).with_target(false))
        .with(file_layer)
        .init();
    Ok(())
}

fn open_log_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

fn init_project(dir: &Path, force: bool) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;

    for (name, content) in [("inventory.yaml", SAMPLE_INVENTORY), ("plan.yaml", SAMPLE_PLAN)] {
        let path = dir.join(name);
        if path.exists() && !force {
            bail!("{} already exists (use --force to overwrite)", path.display());
        }
        std::fs::write(&path, content)
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("  {} {}", "created".green(), path.display());
    }

    println!();
    println!(
        "Edit the files, then run: {}",
        "catalyst deploy -i inventory.yaml -p plan.yaml".cyan()
    );
    Ok(())
}

async fn deploy(args: DeployArgs, output: &mut OutputWriter) -> Result<i32, EngineError> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    if let Some(forks) = args.forks {
        config.max_global = forks;
    }
    if let Some(max) = args.max_per_host {
        config.max_per_host = max;
    }
    if let Some(secs) = args.timeout {
        config.task_timeout = Duration::from_secs(secs);
    }
    config.validate()?;
    debug!(?config, "engine configuration");

    let registry = ModuleRegistry::builtin();
    let inventory = loader::load_inventory_file(&args.inventory)?;
    let plan = loader::load_plan_file(&args.plan, &registry, &config.retry)?;

    let mut ssh = SshConnector::new().with_connect_timeout(config.connect_timeout);
    if let Some(user) = args.user {
        ssh = ssh.with_default_user(user);
    }
    if let Some(key) = args.private_key {
        ssh = ssh.with_private_key(key);
    }
    if args.ask_pass {
        ssh = ssh.with_password(prompt_password("SSH Password: ")?);
    }

    let ctx = Arc::new(EngineContext::new(config, Arc::new(AutoConnector::new(ssh))));

    // Ctrl-C cancels the run; in-flight units abort, the rest are skipped
    let cancel = ctx.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            cancel.cancel();
        }
    });

    let mut events = ctx.subscribe();
    let scheduler = Scheduler::new(ctx.clone());

    output.print_run_header(
        &args.plan.display().to_string(),
        plan.len(),
        inventory.len(),
        plan.units(&inventory),
    );

    let run = scheduler.run(&plan, &inventory);
    tokio::pin!(run);

    let report = loop {
        tokio::select! {
            report = &mut run => break report,
            Some(result) = events.recv() => output.print_result(&result),
        }
    };
    // Results published right before the run returned
    while let Some(result) = events.try_recv() {
        output.print_result(&result);
    }

    output.print_recap(&report);
    info!(exit_code = report.exit_code(), "run finished");
    Ok(report.exit_code())
}

fn prompt_password(prompt: &str) -> Result<String, EngineError> {
    // Print prompt to stderr so it appears even with redirected stdout
    eprint!("{}", prompt.cyan());
    io::stderr().flush().ok();

    // Read password with echo disabled
    let password = rpassword::read_password().map_err(|e| EngineError::Config {
        message: format!("Failed to read password: {}", e),
    })?;

    let password = password.trim().to_string();
    eprintln!();

    if password.is_empty() {
        return Err(EngineError::Config {
            message: "empty password".to_string(),
        });
    }
    Ok(password)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_file_is_created_and_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/catalyst.log");

        writeln!(open_log_file(&path).unwrap(), "first").unwrap();
        writeln!(open_log_file(&path).unwrap(), "second").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first\nsecond\n");
    }

    #[test]
    fn test_log_file_flag_is_global() {
        let cli = Cli::try_parse_from(["catalyst", "init", "--log-file", "run.log"]).unwrap();
        assert_eq!(cli.log_file, Some(PathBuf::from("run.log")));
    }
}
