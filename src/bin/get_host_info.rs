use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use thousands::Separable;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

use memload::topology::{MAX_CACHE_LEVEL, MIN_CACHE_LEVEL, read_topology};

/// Print the processor, cache and NUMA layout of this host.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Where sysfs is mounted
    #[arg(long, default_value = "/sys", value_parser = clap::value_parser!(PathBuf))]
    sysfs_root: PathBuf,
}

fn main() -> ExitCode {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    match read_topology(&args.sysfs_root) {
        Ok(topology) => {
            let cache_bytes: u64 = (MIN_CACHE_LEVEL..=MAX_CACHE_LEVEL).map(|level| topology.cache_level(level).total_bytes).sum();
            debug!(cache_bytes = %cache_bytes.separate_with_commas(), "read topology");
            print!("{topology}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(root = %args.sysfs_root.display(), error = %e, "could not read host topology");
            ExitCode::FAILURE
        }
    }
}
