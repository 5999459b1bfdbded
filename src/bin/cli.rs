//! buddykv CLI
//!
//! Command-line interface for inspecting and editing a buddykv file.

use std::path::PathBuf;

use buddykv::{Config, Store};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

/// buddykv CLI
#[derive(Parser, Debug)]
#[command(name = "buddykv-cli")]
#[command(about = "CLI for the buddykv single-file key-value store")]
#[command(version)]
struct Args {
    /// Store file
    #[arg(short, long, default_value = "./buddykv.db")]
    path: PathBuf,

    /// Override the atomic-write granularity in bytes
    #[arg(long)]
    sector_size: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Get a value by key
    Get {
        /// The key to get
        key: String,
    },

    /// Set a key-value pair
    Set {
        /// The key to set
        key: String,

        /// The value to set
        value: String,
    },

    /// Delete a key
    Del {
        /// The key to delete
        key: String,
    },

    /// Print store figures
    Stats,

    /// Verify the file's structural invariants
    Fsck,

    /// Discard every record
    Reset,
}

fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,buddykv=info"));

    fmt().with_env_filter(filter).with_target(true).init();

    let args = Args::parse();

    if let Err(e) = run(args) {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> buddykv::Result<()> {
    let mut builder = Config::builder().path(&args.path);
    if let Some(size) = args.sector_size {
        builder = builder.sector_size(size);
    }
    let mut store = Store::open(builder.build())?;

    if let Some(report) = store.recovery_report() {
        tracing::warn!(
            "Recovered after unclean shutdown: {} records kept, {} duplicates dropped",
            report.records_kept,
            report.duplicates_dropped
        );
    }

    match args.command {
        Commands::Get { key } => match store.get(key.as_bytes())? {
            Some(value) => println!("{}", String::from_utf8_lossy(value)),
            None => println!("(nil)"),
        },
        Commands::Set { key, value } => {
            store.insert(key.as_bytes(), value.as_bytes())?;
            println!("OK");
        }
        Commands::Del { key } => {
            let removed = store.remove(key.as_bytes())?;
            println!("{}", if removed { 1 } else { 0 });
        }
        Commands::Stats => {
            let stats = store.stats();
            println!("file_len:    {}", stats.file_len);
            println!("entries:     {}", stats.entries);
            println!("load:        {}", stats.load);
            println!("slots:       {}", stats.slots);
            println!("sector_size: {}", stats.sector_size);
        }
        Commands::Fsck => {
            let report = store.fsck()?;
            println!(
                "ok: {} records ({} bytes), {} free blocks ({} bytes), {} slots, {} tombstones",
                report.data_blocks,
                report.data_bytes,
                report.free_blocks,
                report.free_bytes,
                report.index_slots,
                report.tombstones
            );
        }
        Commands::Reset => {
            store.reset()?;
            println!("OK");
        }
    }

    store.close()
}
