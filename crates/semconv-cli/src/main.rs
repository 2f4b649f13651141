use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use semconv_migrate::{EngineConfig, DEFAULT_CONFIG_FILE};
use tracing_subscriber::EnvFilter;

mod commands;
mod json;

/// semconv: schema-version tooling for trade-event records.
///
/// Ingest, migrate, query and export records whose attribute names change
/// between semantic-convention versions.
#[derive(Parser)]
#[command(name = "semconv", version, about, long_about = None)]
struct Cli {
    /// Path to the engine configuration.
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show record counts per schema version.
    Status {
        /// Path to the SQLite database file.
        db: String,
    },

    /// Load records from a JSON-lines file ("-" for stdin).
    Ingest {
        /// Path to the SQLite database file.
        db: String,

        file: String,

        /// Version for records that carry none.
        #[arg(long)]
        version: Option<String>,
    },

    /// Print the attribute rename table between two versions.
    Mapping { from: String, to: String },

    /// Migrate stored records from one version to another.
    Migrate {
        /// Path to the SQLite database file.
        db: String,

        from: String,

        to: String,

        /// Only records observed at or after this time (ms since epoch).
        #[arg(long)]
        since: Option<u64>,

        /// Only records observed before this time (ms since epoch).
        #[arg(long)]
        until: Option<u64>,
    },

    /// Run a query against both old and new attribute locations.
    Resolve {
        /// Path to the SQLite database file.
        db: String,

        /// Version whose attribute paths the query uses.
        target: String,

        /// Predicate such as `attributes.trade.type=arbitrage`. Repeatable.
        #[arg(short = 'w', long = "where")]
        predicates: Vec<String>,

        /// Always query old locations too and merge.
        #[arg(long)]
        both: bool,
    },

    /// Store a saved query definition.
    SaveQuery {
        /// Path to the SQLite database file.
        db: String,

        id: String,

        name: String,

        /// Version whose attribute paths the query uses.
        #[arg(long)]
        version: String,

        /// Predicate such as `attributes.trade.type=arbitrage`. Repeatable.
        #[arg(short = 'w', long = "where")]
        predicates: Vec<String>,
    },

    /// Rewrite saved queries to a version.
    UpdateQueries {
        /// Path to the SQLite database file.
        db: String,

        to: String,

        /// Read each renamed attribute from both locations.
        #[arg(long)]
        both_locations: bool,
    },

    /// Export records as JSON lines.
    Export {
        /// Path to the SQLite database file.
        db: String,

        /// Only records at this version.
        #[arg(long)]
        version: Option<String>,

        /// Write to a file instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    // Commands that only touch storage run without a config file.
    let config = || EngineConfig::load(&cli.config);

    match cli.command {
        Commands::Status { db } => commands::status(&config()?, &db).await,
        Commands::Ingest { db, file, version } => {
            commands::ingest(&config()?, &db, &file, version.as_deref()).await
        }
        Commands::Mapping { from, to } => commands::mapping(&config()?, &from, &to).await,
        Commands::Migrate {
            db,
            from,
            to,
            since,
            until,
        } => commands::migrate(&config()?, &db, &from, &to, since, until).await,
        Commands::Resolve {
            db,
            target,
            predicates,
            both,
        } => commands::resolve(&config()?, &db, &target, &predicates, both).await,
        Commands::SaveQuery {
            db,
            id,
            name,
            version,
            predicates,
        } => commands::save_query(&db, &id, &name, &version, &predicates).await,
        Commands::UpdateQueries {
            db,
            to,
            both_locations,
        } => commands::update_queries(&config()?, &db, &to, both_locations).await,
        Commands::Export { db, version, output } => {
            commands::export(&db, version.as_deref(), output.as_deref()).await
        }
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("error: {e}");
        process::exit(1);
    }
}
