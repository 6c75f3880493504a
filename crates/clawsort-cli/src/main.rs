//! Clawsort CLI
//!
//! Runs the crane scheduler headless and prints run metrics, policy
//! comparisons or scan-duration sweeps.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use clawsort_core::config::SimConfig;
use clawsort_core::fixed::{SimTime, millis_to_secs, secs_to_millis};
use clawsort_core::policy::AssignmentPolicy;
use clawsort_stats::{ComparisonRow, RunMetrics, SweepPoint, SweepSpec, compare_policies, measure, sweep};

/// Diamond-sorting crane scheduler
#[derive(Parser, Debug)]
#[command(name = "clawsort", version)]
#[command(about = "Simulate two gantry cranes feeding diamond scanners", long_about = None)]
struct Cli {
    /// Debug-level logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// JSON output on stdout
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one configuration and report its metrics
    Run(RunArgs),
    /// Compare First and Last, each with pre-emptive positioning on and off
    Compare(RunArgs),
    /// Sweep scan durations across both policies
    Sweep {
        #[command(flatten)]
        run: RunArgs,
        /// Scan durations to try, in seconds
        #[arg(long, value_delimiter = ',', default_values_t = [10.0, 15.0, 20.0, 30.0])]
        scans: Vec<f64>,
    },
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    /// Load a JSON configuration; flags below override its fields
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    scanners: Option<u8>,

    #[arg(long)]
    diamonds: Option<u32>,

    /// Crane speed in mm/s
    #[arg(long)]
    speed: Option<f64>,

    /// Scan duration in seconds
    #[arg(long)]
    scan: Option<f64>,

    /// Hoist lower/raise duration in seconds
    #[arg(long)]
    hoist: Option<f64>,

    /// first | last
    #[arg(long)]
    policy: Option<AssignmentPolicy>,

    /// Disable hoist timing (top view)
    #[arg(long)]
    top_view: bool,

    /// Disable pre-emptive positioning
    #[arg(long)]
    reactive: bool,

    #[arg(long)]
    seed: Option<u64>,

    /// Shuffle the Start Point draw order
    #[arg(long)]
    shuffle: bool,

    /// Stop at this simulated time (seconds) instead of running to completion
    #[arg(long)]
    horizon: Option<f64>,
}

impl RunArgs {
    fn build(&self) -> Result<SimConfig, String> {
        let mut config = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .map_err(|e| format!("reading {}: {e}", path.display()))?;
                serde_json::from_str(&text)
                    .map_err(|e| format!("parsing {}: {e}", path.display()))?
            }
            None => SimConfig::default(),
        };
        if let Some(n) = self.scanners {
            config.scanner_count = n;
        }
        if let Some(n) = self.diamonds {
            config.diamond_count = n;
        }
        if let Some(v) = self.speed {
            config.crane_speed = v;
        }
        if let Some(s) = self.scan {
            config.scan_duration = secs_to_millis(s);
        }
        if let Some(s) = self.hoist {
            config.hoist_duration = secs_to_millis(s);
        }
        if let Some(p) = self.policy {
            config.policy = p;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        config.side_view &= !self.top_view;
        config.pre_emptive &= !self.reactive;
        config.shuffle |= self.shuffle;
        config.validate().map_err(|e| e.to_string())?;
        Ok(config)
    }

    fn horizon(&self) -> Option<SimTime> {
        self.horizon.map(secs_to_millis)
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), String> {
    let text = serde_json::to_string_pretty(value).map_err(|e| e.to_string())?;
    println!("{text}");
    Ok(())
}

fn print_metrics(config: &SimConfig, m: &RunMetrics) {
    println!(
        "{} scanners, policy {}, pre-emptive {}, scan {:.1} s",
        config.scanner_count,
        config.policy,
        if config.pre_emptive { "on" } else { "off" },
        millis_to_secs(config.scan_duration),
    );
    println!("  run time      {:>10.1} s", millis_to_secs(m.total_time));
    println!("  delivered     {:>10}", m.delivered);
    println!("  throughput    {:>10.2} /min", m.throughput_per_min);
    if let Some(interval) = m.mean_delivery_interval {
        println!("  interval      {:>10.2} s", interval);
    }
    println!("  ready-wait    {:>10.1} s", millis_to_secs(m.total_ready_wait));
    for (name, c) in ["blue", "red"].iter().zip(&m.cranes) {
        println!(
            "  {name:<5} idle {:.1} s, busy {:.1} s, blocked {:.1} s",
            millis_to_secs(c.idle),
            millis_to_secs(c.busy),
            millis_to_secs(c.blocked),
        );
    }
    for (i, s) in m.scanners.iter().enumerate() {
        println!(
            "  scanner {i}: {} scans, {:.0}% busy, ready-wait {:.1} s",
            s.scans,
            s.utilization * 100.0,
            millis_to_secs(s.ready_wait),
        );
    }
}

fn print_comparison(rows: &[ComparisonRow]) {
    println!("{:<8}{:<13}{:>12}{:>14}{:>14}", "policy", "pre-emptive", "run time s", "per minute", "ready-wait s");
    for row in rows {
        println!(
            "{:<8}{:<13}{:>12.1}{:>14.2}{:>14.1}",
            row.policy.name(),
            if row.pre_emptive { "on" } else { "off" },
            millis_to_secs(row.metrics.total_time),
            row.metrics.throughput_per_min,
            millis_to_secs(row.metrics.total_ready_wait),
        );
    }
}

fn print_sweep(points: &[SweepPoint]) {
    println!("{:>8}{:>8}{:>12}{:>14}{:>14}", "scan s", "policy", "run time s", "per minute", "interval s");
    for p in points {
        println!(
            "{:>8.1}{:>8}{:>12.1}{:>14.2}{:>14}",
            millis_to_secs(p.scan_duration),
            p.policy.name(),
            millis_to_secs(p.metrics.total_time),
            p.metrics.throughput_per_min,
            p.metrics
                .mean_delivery_interval
                .map(|i| format!("{i:.2}"))
                .unwrap_or_else(|| "-".into()),
        );
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn execute(cli: &Cli) -> Result<(), String> {
    match &cli.command {
        Command::Run(args) => {
            let config = args.build()?;
            info!(scanners = config.scanner_count, diamonds = config.diamond_count, "running");
            let metrics = measure(&config, args.horizon()).map_err(|e| e.to_string())?;
            if cli.json {
                print_json(&metrics)?;
            } else {
                print_metrics(&config, &metrics);
            }
        }
        Command::Compare(args) => {
            let config = args.build()?;
            let rows = compare_policies(&config, args.horizon()).map_err(|e| e.to_string())?;
            if cli.json {
                print_json(&rows)?;
            } else {
                print_comparison(&rows);
            }
        }
        Command::Sweep { run, scans } => {
            let config = run.build()?;
            let spec = SweepSpec {
                scan_durations: scans.iter().map(|&s| secs_to_millis(s)).collect(),
                policies: vec![AssignmentPolicy::First, AssignmentPolicy::Last],
                horizon: run.horizon(),
            };
            info!(points = spec.scan_durations.len() * spec.policies.len(), "sweeping");
            let points = sweep(&config, &spec).map_err(|e| e.to_string())?;
            if cli.json {
                print_json(&points)?;
            } else {
                print_sweep(&points);
            }
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match execute(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
