use anyhow::Result;
use clap::{Parser, Subcommand};
use pagedb::access::tuple::Schema;
use pagedb::database::Database;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "pagedb", about = "Offline tooling for pagedb data directories")]
struct Cli {
    /// Database directory (holds the log file and table files).
    #[arg(short, long, default_value = "data")]
    dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print every log record.
    LogDump,
    /// Replay the log after a crash. Table files are named by the tables
    /// they back; list them in creation order.
    Recover {
        /// Table names in their original creation order.
        #[arg(required = true)]
        tables: Vec<String>,
    },
    /// Append a checkpoint record so future recoveries scan less log.
    Checkpoint,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::LogDump => {
            let db = Database::open(&cli.dir)?;
            for line in db.log().dump()? {
                println!("{line}");
            }
        }
        Command::Recover { tables } => {
            let db = Database::open(&cli.dir)?;
            // Recovery replays whole page images, so the declared schema
            // is irrelevant; only the id-to-file mapping matters.
            for name in &tables {
                db.create_table(name, Schema::new(1))?;
            }
            db.recover()?;
            println!("recovery complete");
        }
        Command::Checkpoint => {
            let db = Database::open(&cli.dir)?;
            db.checkpoint()?;
            println!("checkpoint written");
        }
    }
    Ok(())
}
