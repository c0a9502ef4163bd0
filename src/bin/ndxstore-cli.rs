//! Thin command-line harness exercising `ndxstore::BlobStore` end to end:
//! put/get/remove/list/stats on a named resource. Carries no parsing, no
//! REPL, no SQL — it exists only to drive the library from outside.

use clap::{Parser, Subcommand};
use ndxstore::BlobStore;
use std::fs::OpenOptions;
use std::io::Read;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "ndxstore-cli", version = VERSION, about = "Embedded B-tree + LZO-blob store harness.")]
struct Cli {
    /// Directory holding the `<resource>.0`/`<resource>.1` file pair.
    #[arg(long, env = "NDXSTORE_DATA_DIR")]
    data_dir: Option<PathBuf>,
    /// Resource name (base name, without the `.0`/`.1` extensions).
    #[arg(long, env = "NDXSTORE_RESOURCE", default_value = "ndxstore")]
    resource: String,
    /// Path to the log file; defaults under the data directory.
    #[arg(long, env = "NDXSTORE_LOG_FILE")]
    log_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a fresh store, overwriting any existing one of the same name.
    Create,
    /// Store `value` (or stdin, if `--stdin` is passed) under `name`.
    Put {
        name: String,
        value: Option<String>,
        #[arg(long)]
        stdin: bool,
    },
    /// Print the bytes stored under `name`.
    Get { name: String },
    /// Remove `name`, reporting whether it existed.
    Remove { name: String },
    /// List every name in sorted order.
    List,
    /// Print entry count, file size, and free bytes.
    Stats,
}

fn data_dir(cli: &Cli) -> PathBuf {
    cli.data_dir.clone().unwrap_or_else(|| dirs::data_local_dir().unwrap_or_else(|| PathBuf::from(".")))
}

fn init_logging(cli: &Cli) {
    let default_log = data_dir(cli).join("ndxstore-cli.log");
    let log_path = cli.log_file.clone().unwrap_or(default_log);
    let file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(&log_path)
        .unwrap_or_else(|e| panic!("failed to open log file {:?}: {}", log_path, e));

    tracing_subscriber::fmt()
        .with_writer(file)
        .with_ansi(false)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    let dir = data_dir(&cli);
    if let Err(e) = std::fs::create_dir_all(&dir) {
        eprintln!("failed to create data directory {:?}: {}", dir, e);
        std::process::exit(1);
    }
    let base = dir.join(&cli.resource);

    let result = match &cli.command {
        Command::Create => BlobStore::create(&base).map(|_| ()),
        _ => run(&base, &cli.command),
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

fn run(base: &PathBuf, command: &Command) -> ndxstore::Result<()> {
    let mut store = BlobStore::open(base)?;
    match command {
        Command::Create => unreachable!("handled in main"),
        Command::Put { name, value, stdin } => {
            let bytes = if *stdin {
                let mut buf = Vec::new();
                std::io::stdin().read_to_end(&mut buf)?;
                buf
            } else {
                value.clone().unwrap_or_default().into_bytes()
            };
            store.put(name.as_bytes(), &bytes)?;
        }
        Command::Get { name } => match store.get(name.as_bytes())? {
            Some(bytes) => {
                use std::io::Write;
                std::io::stdout().write_all(&bytes)?;
            }
            None => {
                eprintln!("no such entry: {}", name);
                std::process::exit(1);
            }
        },
        Command::Remove { name } => {
            let removed = store.remove(name.as_bytes())?;
            println!("{}", removed);
        }
        Command::List => {
            for name in store.list()? {
                println!("{}", String::from_utf8_lossy(&name));
            }
        }
        Command::Stats => {
            let stats = store.stats()?;
            println!(
                "entries={} filesize={} free_bytes={}",
                stats.entry_count, stats.filesize, stats.free_bytes
            );
        }
    }
    store.close()?;
    Ok(())
}
