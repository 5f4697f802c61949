//! CLI argument definitions

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "rp",
    about = "Serve on-demand CPU, heap, contention and trace captures over HTTP",
    after_help = "\
EXAMPLES:
    rp                                       Defaults: port 10029, 30s captures in ./
    rp --config profile.json --module billing/src/main.rs
    rp --random-port --seconds 5 --workload  Self-profile a synthetic load

TRIGGER:
    curl 'http://127.0.0.1:10029/rp?mode=1,2'   0=all 1=cpu 2=mem 3=block 4=trace"
)]
pub struct Args {
    /// Module table (JSON) to resolve capture settings from
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Caller source path matched against module names (defaults to this binary's entry point)
    #[arg(short, long, value_name = "CALLER")]
    pub module: Option<String>,

    /// Listen port, overriding the module table
    #[arg(short, long, conflicts_with = "random_port")]
    pub port: Option<u16>,

    /// Pick a random port in [7000, 9999) when no module entry matches
    #[arg(long)]
    pub random_port: bool,

    /// Capture duration in seconds, overriding the module table
    #[arg(short, long, value_parser = clap::value_parser!(u64).range(1..))]
    pub seconds: Option<u64>,

    /// Directory for artifacts, overriding the module table
    #[arg(short, long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Run a synthetic workload so captures have something to record
    #[arg(long)]
    pub workload: bool,

    /// Suppress non-essential output
    #[arg(short, long)]
    pub quiet: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::try_parse_from(["rp"]).unwrap();
        assert!(args.config.is_none());
        assert!(args.port.is_none());
        assert!(!args.random_port);
        assert!(!args.workload);
    }

    #[test]
    fn test_port_conflicts_with_random_port() {
        let err = Args::try_parse_from(["rp", "--port", "8080", "--random-port"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn test_zero_seconds_rejected() {
        assert!(Args::try_parse_from(["rp", "--seconds", "0"]).is_err());
        let args = Args::try_parse_from(["rp", "-s", "5", "-o", "/tmp/prof"]).unwrap();
        assert_eq!(args.seconds, Some(5));
        assert_eq!(args.output_dir, Some(PathBuf::from("/tmp/prof")));
    }
}
