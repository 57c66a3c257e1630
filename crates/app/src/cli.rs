use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use pose_core::PostureLabel;
use sleep_monitor::MonitorCliArgs;

#[derive(Debug, Parser)]
#[command(name = "sleepwatch", version, about = "Camera-based sleep posture monitor")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a monitoring session until Ctrl+C or the requested duration.
    Run(RunArgs),
    /// Print the posture labels with their guidance.
    Guide,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub monitor: MonitorCliArgs,
    /// Use the built-in synthetic camera and scripted providers.
    #[arg(long)]
    pub synthetic: bool,
    /// Seconds between printed state reports.
    #[arg(long, value_name = "SECS", default_value_t = 5)]
    pub report_interval_secs: u64,
    /// Stop automatically after this many seconds.
    #[arg(long, value_name = "SECS")]
    pub duration_secs: Option<u64>,
    /// Print reports as JSON instead of a one-line summary.
    #[arg(long)]
    pub json: bool,
    /// Print Prometheus metrics on exit.
    #[arg(long)]
    pub dump_metrics: bool,
    /// Write the last annotated frame as JPEG on exit.
    #[arg(long, value_name = "PATH")]
    pub snapshot_jpeg: Option<PathBuf>,
    /// Disable a feature (posture, emotion, wake); repeatable.
    #[arg(long = "disable", value_name = "FEATURE")]
    pub disabled_features: Vec<String>,
}

pub fn print_guide() {
    for label in PostureLabel::TRACKED {
        let guidance = label.guidance();
        println!("{label}");
        println!("  {}", guidance.description);
        println!("  {}", guidance.suggestion);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_flags_parse() {
        let cli = Cli::try_parse_from([
            "sleepwatch",
            "run",
            "--synthetic",
            "--device",
            "2",
            "--device",
            "0",
            "--workers",
            "3",
            "--duration-secs",
            "10",
            "--disable",
            "emotion",
            "--json",
        ])
        .expect("valid flags");
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert!(args.synthetic && args.json);
        assert_eq!(args.monitor.devices, vec![2, 0]);
        assert_eq!(args.monitor.workers, Some(3));
        assert_eq!(args.duration_secs, Some(10));
        assert_eq!(args.report_interval_secs, 5);
        assert_eq!(args.disabled_features, vec!["emotion".to_string()]);
    }

    #[test]
    fn test_unknown_flag_is_rejected() {
        assert!(Cli::try_parse_from(["sleepwatch", "run", "--bogus"]).is_err());
    }
}
