use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "calsync", version, about = "Calendar/sheet sync CLI")]
struct Cli {
    /// Log sync activity to stderr (overrides CALSYNC_LOG)
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the data directory, config, state database and side files
    Setup,
    /// Run a sync pass
    Sync {
        #[command(subcommand)]
        action: commands::sync::SyncAction,
    },
    /// Show the last committed pass and recent history
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
        /// Number of recent passes to show
        #[arg(long, default_value_t = 5)]
        history: usize,
    },
    /// Forget the record mapping and cursor
    Reset {
        /// Confirm the reset
        #[arg(long)]
        yes: bool,
    },
    /// Extension field definitions
    Fields {
        #[command(subcommand)]
        action: commands::fields::FieldsAction,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: commands::config::ConfigAction,
    },
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env("CALSYNC_LOG").unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Commands::Setup => commands::setup::run(),
        Commands::Sync { action } => commands::sync::run(action),
        Commands::Status { json, history } => commands::status::run(json, history),
        Commands::Reset { yes } => commands::reset::run(yes),
        Commands::Fields { action } => commands::fields::run(action),
        Commands::Config { action } => commands::config::run(action),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
