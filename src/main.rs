//! Paper trader - main entry point
//!
//! Subcommands:
//! - run: continuous signal cycles with stop-loss / take-profit monitoring
//! - cycle, check-exits, trade: single engine actions
//! - status, risk, history, performance, audit, export: ledger inspection

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "paper-trader")]
#[command(about = "Simulated single-symbol spot trading with indicator signals and risk gates", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "config.json")]
    config: String,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the trading loop until Ctrl+C
    Run,

    /// Run a single signal cycle
    Cycle,

    /// Show the current portfolio
    Status {
        /// Fetch a fresh price before valuing the position
        #[arg(long)]
        refresh: bool,
    },

    /// Show exposure, concentration and the daily profit status
    Risk {
        /// Fetch a fresh price before measuring
        #[arg(long)]
        refresh: bool,
    },

    /// Submit a manual trade through the risk gates
    Trade {
        /// BUY or SELL
        #[arg(short, long)]
        side: String,

        /// Base-asset quantity (default: BUY sizes to the position limit, SELL closes)
        #[arg(short, long)]
        quantity: Option<String>,
    },

    /// List recorded trades, newest first
    History {
        /// Maximum number of trades
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Summarize performance over the trade log
    Performance,

    /// Check the open position against its stop-loss and take-profit
    CheckExits,

    /// Replay the trade log and verify stored balances
    Audit,

    /// Export the ledger as JSON
    Export {
        /// Output file (default: storage.json_backup_path)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn setup_logging(verbose: bool, command_name: &str, console: bool) -> Result<()> {
    // Create logs directory
    std::fs::create_dir_all("logs")?;

    // Create log file with naming pattern: {command}_{date}.log
    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    // Set log level - filter out noisy external crates
    let level = if verbose { "debug" } else { "info" };
    let filter_str = format!(
        "{},hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn,h2=warn",
        level
    );
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    if console {
        let file_appender = tracing_appender::rolling::never("logs", &log_filename);
        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_appender)
            .with_target(true)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(false);

        let console_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(true);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .init();
    } else {
        let file_appender = tracing_appender::rolling::never("logs", &log_filename);
        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_appender)
            .with_target(true)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(false);

        // stdout carries JSON for one-shot commands; keep it clean
        let stderr_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_ansi(true);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .with(file_layer)
            .init();
    }

    info!("Log file: {}", log_path.display());
    Ok(())
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let (command_name, console) = match &cli.command {
        Commands::Run => ("run", true),
        Commands::Cycle => ("cycle", false),
        Commands::Status { .. } => ("status", false),
        Commands::Risk { .. } => ("risk", false),
        Commands::Trade { .. } => ("trade", false),
        Commands::History { .. } => ("history", false),
        Commands::Performance => ("performance", false),
        Commands::CheckExits => ("check_exits", false),
        Commands::Audit => ("audit", false),
        Commands::Export { .. } => ("export", false),
    };

    setup_logging(cli.verbose, command_name, console)?;

    let config = cli.config;
    match cli.command {
        Commands::Run => commands::run::run(config),
        Commands::Cycle => commands::ledger::cycle(config),
        Commands::Status { refresh } => commands::ledger::status(config, refresh),
        Commands::Risk { refresh } => commands::ledger::risk(config, refresh),
        Commands::Trade { side, quantity } => commands::ledger::trade(config, side, quantity),
        Commands::History { limit } => commands::ledger::history(config, limit),
        Commands::Performance => commands::ledger::performance(config),
        Commands::CheckExits => commands::ledger::check_exits(config),
        Commands::Audit => commands::ledger::audit(config),
        Commands::Export { output } => commands::ledger::export(config, output),
    }
}
