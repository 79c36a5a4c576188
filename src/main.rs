#[cfg(not(target_os = "linux"))]
compile_error!("make_memory_load only knows how to reserve memory on Linux");

use std::panic;
use std::process::ExitCode;

use clap::Parser;
use thousands::Separable;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use memload::plat::vendor::{Mapping, allocation_granularity};
use memload::units::{conv, fraction_to_percent, round_down_to_nearest};
use memload::{ControlConfig, Controller, Maintainer, MemLoadError, MemoryStatus, ProcMeminfo, Reservation, TargetState};

/// Drive system-wide memory load to a target percentage and hold it there until killed.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Target load, as a percentage of physical memory in (0, 99]
    #[arg(short, long, value_parser = parse_percent)]
    percent: f64,

    /// Only ever grow our footprint, even when the load overshoots
    #[arg(long)]
    never_release: bool,

    /// Stop adjusting once startup has converged
    #[arg(long)]
    no_readjust: bool,

    /// Debug logging on stdout (RUST_LOG takes precedence)
    #[arg(short, long)]
    verbose: bool,
}

fn parse_percent(s: &str) -> Result<f64, String> {
    let p: f64 = s.parse().map_err(|e| format!("{e}"))?;
    if p.is_finite() && 0.0 < p && p <= 99.0 {
        Ok(p)
    } else {
        Err(format!("{p} is not in (0, 99]"))
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    match run(&args) {
        Ok(never) => match never {},
        Err(e) => {
            error!(error = %e, "make_memory_load failed");
            eprintln!("{e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

fn run(args: &Args) -> Result<std::convert::Infallible, MemLoadError> {
    let mut telemetry = ProcMeminfo::new();
    let memory = telemetry.read()?;
    let granularity = allocation_granularity();
    let total_memory = round_down_to_nearest(memory.total_physical_bytes, granularity);

    let target = TargetState::new(args.percent, memory.total_physical_bytes, args.never_release, !args.no_readjust)?;
    info!(
        total = %conv(memory.total_physical_bytes),
        available = %conv(memory.available_bytes),
        desired_available = %conv(target.desired_available_bytes()),
        granularity,
        "starting up"
    );

    let mapping = Mapping::reserve(total_memory)?;
    let reservation = Reservation::new(mapping, total_memory, granularity);
    let controller = Controller::new(telemetry, reservation, target, ControlConfig::default());
    let mut maintainer = Maintainer::new(controller);

    let state = maintainer.converge()?;
    eprintln!("{}", state.signal_line());

    let committed = maintainer.controller().reservation().committed_bytes();
    let now = maintainer.controller_mut().telemetry_mut().read()?;
    info!(
        load = fraction_to_percent(now.used_fraction()),
        total = %conv(now.total_physical_bytes),
        available = %conv(now.available_bytes),
        committed_bytes = %committed.separate_with_commas(),
        "memory status"
    );

    maintainer.hold()
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    // stderr belongs to the startup lines.
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stdout).init();
    set_panic_hook();
}

fn set_panic_hook() {
    panic::set_hook(Box::new(|panic_info| {
        tracing::error!(
            message = "panic occurred",
            panic = %panic_info
        );
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_invocations_are_rejected() {
        for argv in [
            &["make_memory_load"][..],
            &["make_memory_load", "--percent", "0"],
            &["make_memory_load", "--percent", "100"],
            &["make_memory_load", "--percent", "-5"],
            &["make_memory_load", "--percent", "nan"],
            &["make_memory_load", "--percent", "inf"],
            &["make_memory_load", "--percent", "abc"],
            &["make_memory_load", "--percent", "50", "--bogus"],
        ] {
            let err = Args::try_parse_from(argv).unwrap_err();
            assert_eq!(err.exit_code(), 2, "{argv:?}");
        }
    }

    #[test]
    fn good_invocations_map_to_fields() {
        let args = Args::try_parse_from(["make_memory_load", "--percent", "99"]).unwrap();
        assert_eq!(args.percent, 99.0);
        assert!(!args.never_release && !args.no_readjust && !args.verbose);

        let args = Args::try_parse_from(["make_memory_load", "--percent", "0.001", "--never-release", "--no-readjust"]).unwrap();
        assert_eq!(args.percent, 0.001);
        assert!(args.never_release);
        assert!(args.no_readjust);

        let args = Args::try_parse_from(["make_memory_load", "-p", "12.5", "-v"]).unwrap();
        assert_eq!(args.percent, 12.5);
        assert!(args.verbose);
    }

    #[test]
    fn percent_parser_names_the_bad_value() {
        assert_eq!(parse_percent("0"), Err("0 is not in (0, 99]".to_string()));
        assert_eq!(parse_percent("99.5"), Err("99.5 is not in (0, 99]".to_string()));
        assert!(parse_percent("lots").is_err());
        assert_eq!(parse_percent("33.3"), Ok(33.3));
    }
}
