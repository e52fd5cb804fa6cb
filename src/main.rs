use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use gracefuld::{config, pid, supervisor, EchoHandler};

#[derive(Parser, Debug)]
#[command(name = "gracefuld", version, about = "A network server with uninterruptible restart")]
struct TopCli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the server (the default when no subcommand is given).
    Run(config::Cli),
    /// Report whether the daemon recorded at `pid_path` is running.
    Status {
        #[arg(long)]
        pid_path: Option<PathBuf>,
    },
}

fn main() -> std::process::ExitCode {
    let top = TopCli::parse();

    match top.command.unwrap_or(Commands::Run(config::Cli::default())) {
        Commands::Run(cli) => run_server(cli),
        Commands::Status { pid_path } => run_status(pid_path),
    }
}

fn run_server(cli: config::Cli) -> std::process::ExitCode {
    let config = match config::load_config(cli) {
        Ok(config) => config,
        Err(e) => {
            // Logging is not yet initialized (we need the config's log level
            // first), so a startup configuration error goes to stderr directly.
            eprintln!("gracefuld: {e}");
            return std::process::ExitCode::FAILURE;
        }
    };

    init_logging(&config.log_level);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(event = "supervisor.startup.runtime_init_failed", error = %e);
            return std::process::ExitCode::FAILURE;
        }
    };

    let handler: Arc<dyn gracefuld::ConnectionHandler> = Arc::new(EchoHandler);
    match runtime.block_on(supervisor::run(config, handler)) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(event = "supervisor.startup.fatal", error = %e, error_code = e.error_code());
            std::process::ExitCode::FAILURE
        }
    }
}

fn run_status(pid_path: Option<PathBuf>) -> std::process::ExitCode {
    let pid_path = pid_path.unwrap_or_else(default_status_pid_path);
    match pid::check_running(&pid_path) {
        Some(running_pid) => {
            println!("running (pid {running_pid})");
            std::process::ExitCode::SUCCESS
        }
        None => {
            println!("not running");
            std::process::ExitCode::FAILURE
        }
    }
}

fn default_status_pid_path() -> PathBuf {
    let program = std::env::current_exe()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_os_string()))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("gracefuld"));
    let mut path = program;
    path.set_extension("pid");
    PathBuf::from(".").join(path)
}

fn init_logging(configured_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(configured_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
