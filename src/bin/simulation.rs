//! Machine QA Simulation
//!
//! Generates synthetic daily QA results as CSV for testing qa-kpi.
//! Each (machine, test) series runs through three phases:
//! - Stable operation around the nominal value
//! - Gradual drift (output decay, positioning creep)
//! - Isolated glitches far outside tolerance
//!
//! A small share of rows is deliberately malformed to exercise rejection.
//!
//! # Usage
//! ```bash
//! ./simulation --days 365 --machines 3 --seed 7 > qa.csv
//! qa-kpi run qa.csv
//! ```

use anyhow::Result;
use chrono::{Datelike, Duration, NaiveDate, Weekday};
use clap::Parser;
use rand::prelude::*;
use rand_distr::{Distribution, Normal};
use std::io::{self, Write};

// ============================================================================
// QA Test Catalogue
// ============================================================================

struct TestSpec {
    name: &'static str,
    unit: &'static str,
    nominal: f64,
    noise_sd: f64,
    /// Drift per day once the drift phase starts
    drift_per_day: f64,
}

const TESTS: [TestSpec; 3] = [
    TestSpec {
        name: "output_6x",
        unit: "%",
        nominal: 100.0,
        noise_sd: 0.3,
        drift_per_day: -0.02,
    },
    TestSpec {
        name: "output_10x",
        unit: "%",
        nominal: 100.0,
        noise_sd: 0.35,
        drift_per_day: -0.015,
    },
    TestSpec {
        name: "mlc_position",
        unit: "mm",
        nominal: 0.0,
        noise_sd: 0.08,
        drift_per_day: 0.003,
    },
];

/// Glitch size in standard deviations
const GLITCH_SIGMA: f64 = 12.0;

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "qa-simulation")]
#[command(about = "Synthetic machine QA data for qa-kpi testing")]
#[command(version = "1.0")]
struct Args {
    /// Number of days to simulate
    #[arg(short, long, default_value = "180", value_parser = clap::value_parser!(u32).range(1..=3650))]
    days: u32,

    /// Number of machines
    #[arg(short, long, default_value = "2", value_parser = clap::value_parser!(u32).range(1..=50))]
    machines: u32,

    /// First simulated day (YYYY-MM-DD)
    #[arg(long, default_value = "2025-01-01")]
    start: NaiveDate,

    /// Fraction of the run after which drift starts (0-1)
    #[arg(long, default_value = "0.6")]
    drift_start: f64,

    /// Drift multiplier (0 disables drift)
    #[arg(long, default_value = "1.0")]
    drift: f64,

    /// Probability of a glitch per result
    #[arg(long, default_value = "0.01")]
    glitch_probability: f64,

    /// Probability of a malformed row per result
    #[arg(long, default_value = "0.005")]
    bad_row_probability: f64,

    /// Skip Saturdays and Sundays
    #[arg(long)]
    weekdays_only: bool,

    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,

    /// Suppress the summary on stderr
    #[arg(short, long)]
    quiet: bool,
}

// ============================================================================
// Simulation State
// ============================================================================

#[derive(Debug, Default)]
struct Stats {
    rows: u64,
    glitches: u64,
    bad_rows: u64,
}

struct Simulation {
    rng: StdRng,
    unit_noise: Normal<f64>,
    stats: Stats,
}

impl Simulation {
    fn new(seed: Option<u64>) -> Result<Self> {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            rng,
            unit_noise: Normal::new(0.0, 1.0)?,
            stats: Stats::default(),
        })
    }

    fn measure(&mut self, test: &TestSpec, drift_days: f64, drift: f64, glitch_probability: f64) -> f64 {
        let noise = self.unit_noise.sample(&mut self.rng) * test.noise_sd;
        let mut value = test.nominal + test.drift_per_day * drift_days * drift + noise;
        if self.rng.gen_bool(glitch_probability) {
            self.stats.glitches += 1;
            let sign = if self.rng.gen_bool(0.5) { 1.0 } else { -1.0 };
            value += sign * GLITCH_SIGMA * test.noise_sd;
        }
        value
    }

    /// One of the malformed shapes real exports contain.
    fn bad_row(&mut self, machine: &str, test: &TestSpec, date: NaiveDate) -> String {
        self.stats.bad_rows += 1;
        match self.rng.gen_range(0..4) {
            0 => format!(",{},{date}T08:00:00Z,{:.3},{}", test.name, test.nominal, test.unit),
            1 => format!("{machine},{},{date}T08:00:00Z,n/a,{}", test.name, test.unit),
            2 => format!("{machine},{},not-a-date,{:.3},{}", test.name, test.nominal, test.unit),
            _ => format!("{machine},{},{date}T08:00:00Z,,{}", test.name, test.unit),
        }
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[allow(clippy::cast_precision_loss)]
fn main() -> Result<()> {
    let args = Args::parse();
    anyhow::ensure!(
        (0.0..=1.0).contains(&args.drift_start),
        "--drift-start must be within 0 and 1"
    );
    anyhow::ensure!(
        (0.0..=1.0).contains(&args.glitch_probability) && (0.0..=1.0).contains(&args.bad_row_probability),
        "probabilities must be within 0 and 1"
    );

    let mut sim = Simulation::new(args.seed)?;
    let machines: Vec<String> = (1..=args.machines).map(|i| format!("LA{i}")).collect();
    let drift_from = (f64::from(args.days) * args.drift_start).floor();

    let stdout = io::stdout();
    let mut out = io::BufWriter::new(stdout.lock());
    writeln!(out, "machine_id,test_type,timestamp,value,unit")?;

    for day in 0..args.days {
        let date = args.start + Duration::days(i64::from(day));
        if args.weekdays_only && matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
            continue;
        }
        let drift_days = (f64::from(day) - drift_from).max(0.0);

        for (m, machine) in machines.iter().enumerate() {
            for test in &TESTS {
                if sim.rng.gen_bool(args.bad_row_probability) {
                    let row = sim.bad_row(machine, test, date);
                    writeln!(out, "{row}")?;
                    continue;
                }
                let value = sim.measure(test, drift_days, args.drift, args.glitch_probability);
                // Machines measure a few minutes apart
                writeln!(
                    out,
                    "{machine},{},{date}T08:{:02}:00Z,{value:.3},{}",
                    test.name,
                    m % 60,
                    test.unit
                )?;
                sim.stats.rows += 1;
            }
        }
    }
    out.flush()?;

    if !args.quiet {
        eprintln!(
            "Generated {} results ({} glitches) and {} malformed rows over {} days for {} machine(s)",
            sim.stats.rows, sim.stats.glitches, sim.stats.bad_rows, args.days, args.machines
        );
    }
    Ok(())
}
