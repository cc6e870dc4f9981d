//! Command-line entry point for the benchmark/verification driver.

use std::env;
use std::process::ExitCode;

use hexbit_harness::runner::{self, RunConfig, RunReport};

const USAGE: &str = "\
hexbit-bench [options]

Options:
  --workers <n>         insert-phase worker threads (even write, odd read; default 16)
  --verify-threads <n>  verification lookup threads (default 16)
  --versions <n>        versions to insert (default 256)
  --hamming <n>         bits set between adjacent versions (default 1)
  --seed <n>            master seed (default 42)
  --active-cap <n>      active-CSN list capacity (default: retain everything)
  -h, --help            print this help
";

fn main() -> ExitCode {
    let args: Vec<String> = env::args().skip(1).collect();
    match run_cli(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) if error.is_empty() => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("ERROR hexbit-bench failed: {error}");
            ExitCode::from(2)
        }
    }
}

fn run_cli(args: &[String]) -> Result<(), String> {
    let config = parse_config(args)?;
    let report = runner::run(config).map_err(|error| error.to_string())?;
    print_report(&report);
    Ok(())
}

fn parse_config(args: &[String]) -> Result<RunConfig, String> {
    let mut config = RunConfig::default();
    let mut index = 0;
    while index < args.len() {
        let flag = args[index].as_str();
        match flag {
            "-h" | "--help" => {
                print!("{USAGE}");
                return Err(String::new());
            }
            "--workers" => config.worker_threads = parse_value(args, &mut index)?,
            "--verify-threads" => config.verify_threads = parse_value(args, &mut index)?,
            "--versions" => config.versions = parse_value(args, &mut index)?,
            "--hamming" => config.hamming_step = parse_value(args, &mut index)?,
            "--seed" => config.seed = parse_value(args, &mut index)?,
            "--active-cap" => config.active_cap = Some(parse_value(args, &mut index)?),
            other => return Err(format!("unknown argument: {other}")),
        }
        index += 1;
    }
    Ok(config)
}

fn parse_value<T: std::str::FromStr>(args: &[String], index: &mut usize) -> Result<T, String> {
    let flag = args[*index].clone();
    *index += 1;
    let raw = args
        .get(*index)
        .ok_or_else(|| format!("{flag} requires a value"))?;
    raw.parse()
        .map_err(|_| format!("{flag}: cannot parse {raw:?}"))
}

fn print_report(report: &RunReport) {
    println!(
        "insert: {} versions in {:.3}s ({:.0} versions/s)",
        report.config.versions, report.insert_seconds, report.inserts_per_sec
    );
    println!(
        "concurrent reads during insert: {}",
        report.reads_during_insert
    );
    println!(
        "verify: {} lookups in {:.3}s ({:.0} lookups/s), all exact",
        report.verified_lookups, report.verify_seconds, report.verify_per_sec
    );
    println!(
        "reclaim at horizon {}: {} groups / {} versions",
        report.oldest_visible_csn, report.reclaimed.groups_reclaimed, report.reclaimed.versions_retired
    );
    println!("metrics: {}", report.metrics);
    match serde_json::to_string(report) {
        Ok(json) => println!("{json}"),
        Err(error) => eprintln!("report serialization failed: {error}"),
    }
}
