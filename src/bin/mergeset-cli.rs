use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mergeset::{Table, TableOptions, TableSearch};

#[derive(Parser, Debug)]
#[command(about = "Inspect and modify a mergeset table")]
struct Args {
    /// Table directory
    #[arg(short, long, default_value = "mergeset.db")]
    path: PathBuf,
    /// JSON file with table options; defaults apply to missing fields
    #[arg(long)]
    options: Option<PathBuf>,
    #[arg(long, default_value = "info")]
    log_level: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Add items given as arguments, or one per stdin line when none are given
    Add { items: Vec<String> },
    /// Print items greater or equal to KEY
    Seek {
        key: String,
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
    /// Print the first item starting with PREFIX
    Prefix { prefix: String },
    Stats,
    /// Merge all parts into one
    Merge,
}

fn load_options(path: Option<&PathBuf>) -> Result<TableOptions> {
    let Some(path) = path else {
        return Ok(TableOptions::default());
    };
    let data = std::fs::read(path).with_context(|| format!("cannot read {}", path.display()))?;
    serde_json::from_slice(&data).with_context(|| format!("cannot parse {}", path.display()))
}

fn main() -> Result<()> {
    let args = Args::parse();
    structured_logger::Builder::with_level(&args.log_level).init();

    let options = load_options(args.options.as_ref())?;
    let table = Table::open(&args.path, options)
        .with_context(|| format!("cannot open table {}", args.path.display()))?;
    let mut out = io::stdout().lock();

    match args.command {
        Command::Add { items } => {
            let items = if items.is_empty() {
                io::stdin().lock().lines().collect::<io::Result<Vec<_>>>()?
            } else {
                items
            };
            table.add_items(&items)?;
            writeln!(out, "added {} items", items.len())?;
        }
        Command::Seek { key, limit } => {
            table.flush_pending_items()?;
            let mut ts = TableSearch::new(&table);
            ts.seek(key.as_bytes())?;
            let mut n = 0;
            while n < limit && ts.next_item()? {
                writeln!(out, "{}", String::from_utf8_lossy(ts.item()))?;
                n += 1;
            }
        }
        Command::Prefix { prefix } => {
            table.flush_pending_items()?;
            let mut ts = TableSearch::new(&table);
            match ts.first_item_with_prefix(prefix.as_bytes())? {
                Some(item) => writeln!(out, "{}", String::from_utf8_lossy(&item))?,
                None => writeln!(out, "(none)")?,
            }
        }
        Command::Stats => {
            writeln!(out, "{:#?}", table.stats())?;
        }
        Command::Merge => {
            table.force_merge_all()?;
            writeln!(out, "{:#?}", table.stats())?;
        }
    }
    table.close()?;
    Ok(())
}
