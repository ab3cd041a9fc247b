//! migsync command-line interface.
//!
//! Registers storage backends from flags, drives the reconciliation
//! runner, and renders state transitions plus a final counters table.

mod observer;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use comfy_table::Table;
use parking_lot::Mutex;

use migsync_core::{MigrationRunner, RunStats};
use migsync_files::FilesHandler;
use migsync_sled::SledHandler;
use migsync_sqlite::SqliteHandler;
use observer::{ConsoleObserver, ConsoleSink, RenderMode};

/// migsync command-line interface.
#[derive(Parser, Debug)]
#[command(name = "migsync")]
#[command(version, about = "Synchronize migration definitions with storage backends")]
struct Args {
    /// Project root to scan for modules and definition files
    #[arg(short = 'p', long, default_value = ".")]
    project_root: PathBuf,

    /// Environment string matched by definition filters
    /// (falls back to $ENVIRONMENT)
    #[arg(short = 'e', long)]
    environment: Option<String>,

    /// Validation key for script signatures
    #[arg(short = 'k', long, default_value = "")]
    key: String,

    /// Register the file-based ledger backend at this storage directory
    #[arg(long)]
    files_dir: Option<PathBuf>,

    /// Register the SQLite backend at this database path
    #[arg(long)]
    sqlite_db: Option<PathBuf>,

    /// Register the sled backend at this database path
    #[arg(long)]
    sled_db: Option<PathBuf>,

    /// Verbose progress output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show all migrations (applied, wait for rollback, prepare to apply)
    Status,
    /// Apply or roll back migrations to synchronize with the code state
    Migrate,
    /// Generate a definition file template for a new migration
    Create {
        /// Base name of the new definition file
        #[arg(long)]
        name: String,
        /// Target service recorded in the template
        #[arg(long)]
        service: Option<String>,
        /// Directory for the new file (defaults to the project root)
        #[arg(long)]
        directory: Option<PathBuf>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("migsync=warn".parse().expect("static directive")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    std::process::exit(run(args));
}

fn run(args: Args) -> i32 {
    let environment = args
        .environment
        .clone()
        .or_else(|| std::env::var("ENVIRONMENT").ok())
        .unwrap_or_else(|| migsync_core::DEFAULT_ENVIRONMENT.to_string());

    let mut runner = MigrationRunner::new(&args.project_root, args.key.clone())
        .with_environment(environment)
        .with_sink(Arc::new(Mutex::new(ConsoleSink)));

    if let Some(dir) = &args.files_dir {
        runner.register_handler(Box::new(FilesHandler::new(dir)));
    }
    if let Some(path) = &args.sqlite_db {
        match SqliteHandler::open(path) {
            Ok(handler) => runner.register_handler(Box::new(handler)),
            Err(error) => {
                eprintln!("Error: cannot open sqlite database: {error}");
                return 1;
            }
        }
    }
    if let Some(path) = &args.sled_db {
        match SledHandler::open_path(path) {
            Ok(handler) => runner.register_handler(Box::new(handler)),
            Err(error) => {
                eprintln!("Error: cannot open sled database: {error}");
                return 1;
            }
        }
    }

    match &args.command {
        Command::Status => {
            runner.attach(Box::new(ConsoleObserver::new(RenderMode::Status, args.verbose)));
            let stats = runner.status();
            println!();
            print_summary(&stats);
            i32::from(stats.errors > 0)
        }
        Command::Migrate => {
            runner.attach(Box::new(ConsoleObserver::new(
                RenderMode::Migrate,
                args.verbose,
            )));
            let stats = runner.migrate();
            println!();
            if stats.errors > 0 {
                println!("Number of errors: {}", stats.errors);
            } else {
                println!("Migration process completed.");
            }
            if args.verbose {
                print_summary(&stats);
            }
            i32::from(stats.errors > 0)
        }
        Command::Create {
            name,
            service,
            directory,
        } => match runner.create(name, service.as_deref(), directory.as_deref()) {
            Ok(path) => {
                println!("Created {}", path.display());
                0
            }
            Err(error) => {
                eprintln!("Error: {error}");
                1
            }
        },
    }
}

fn print_summary(stats: &RunStats) {
    let mut table = Table::new();
    table.set_header(vec!["counter", "value"]);
    table.add_row(vec!["definitions found".to_string(), stats.total.to_string()]);
    table.add_row(vec!["already applied".to_string(), stats.stored().to_string()]);
    table.add_row(vec![
        "for rollback".to_string(),
        stats.for_rollback.to_string(),
    ]);
    table.add_row(vec!["for commit".to_string(), stats.for_commit.to_string()]);
    table.add_row(vec!["rejected".to_string(), stats.rejected.to_string()]);
    table.add_row(vec!["applied".to_string(), stats.applied.to_string()]);
    table.add_row(vec!["errors".to_string(), stats.errors.to_string()]);
    println!("{table}");
}
