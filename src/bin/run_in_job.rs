#[cfg(not(target_os = "linux"))]
compile_error!("run_in_job confines jobs with cgroup v2, which only Linux has");

use std::path::PathBuf;
use std::process::{Command, ExitCode};

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use memload::job::{JobLimits, run_in_job};

/// Run a command confined to a memory ceiling, a CPU-rate cap, and optionally one CPU.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Memory ceiling in MB
    #[arg(long)]
    memory_mb: Option<f64>,

    /// Fraction of the whole machine's CPU time the job may use
    #[arg(long)]
    cpu_rate_hard_cap: Option<f64>,

    /// Pin the job to the second processor
    #[arg(long)]
    affinitize: bool,

    /// Parent directory for the job's cgroup
    #[arg(long, default_value = "/sys/fs/cgroup", value_parser = clap::value_parser!(PathBuf))]
    cgroup_root: PathBuf,

    /// The program to run, and its arguments
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let limits = match JobLimits::new(args.memory_mb, args.cpu_rate_hard_cap, args.affinitize) {
        Ok(limits) => limits,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(2);
        }
    };

    let (program, rest) = match args.command.split_first() {
        Some(split) => split,
        None => return ExitCode::from(2),
    };
    let mut command = Command::new(program);
    command.args(rest);

    match run_in_job(&args.cgroup_root, &limits, &mut command) {
        Ok((pid, code)) => {
            println!("PID: {pid}");
            ExitCode::from(code as u8)
        }
        Err(e) => {
            error!(error = %e, "run_in_job failed");
            eprintln!("run_in_job: {e}");
            ExitCode::FAILURE
        }
    }
}
