use anyhow::{anyhow, Result};
use chrono::Local;
use log::LevelFilter;
use std::io::{self, Write};

use clap::ArgMatches;
use env_logger::{Builder, Target};

/// Environment variable naming a file that receives the log instead of stderr.
pub const LOG_FILE_ENV: &str = "SERVO_POWER_LOG_FILE";

/// Logging setup shared by every entrypoint.
pub fn init_common() {
    match std::env::var(LOG_FILE_ENV) {
        Ok(path) => {
            if let Err(err) = init_file_logger(&path) {
                eprintln!("Failed to initialize file logger at '{path}': {err}");
                env_logger::init();
            }
        }
        Err(_) => env_logger::init(),
    }
}

/// Run the selected command on a single-threaded runtime.
pub fn start(matches: &ArgMatches) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| anyhow!("Failed to create tokio runtime: {e}"))?;
    runtime.block_on(crate::cli::actions::dispatch(matches))
}

fn init_file_logger(path: &str) -> io::Result<()> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;

    let mut builder = Builder::new();
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{}:{} {} [{}] - {}",
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.args()
            )
        })
        .target(Target::Pipe(Box::new(file)))
        .filter_level(LevelFilter::Debug)
        .parse_default_env()
        .init();

    log::info!("File logger initialized at {path}");

    Ok(())
}
