//! Packet Counter: samples bridge-filter egress counters on a fixed
//! cadence and either writes a timestamped CSV row per sample (file mode)
//! or prints the instantaneous rate (stdout mode).

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use chrono::Utc;

use net_eval::clock::{Clock, SystemClock};
use net_eval::ebt::{add_rule, EbtCounterReader, Reading};
use net_eval::Stack;

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum StackArg {
    Ip,
    Xia,
}

/// Samples bridge-filter packet/byte counters for a set of interfaces.
#[derive(Parser, Debug)]
#[command(name = "pc")]
struct Cli {
    #[arg(long, value_enum)]
    stack: StackArg,

    /// Install the drop-on-egress ebtables rule for every interface first.
    #[arg(long)]
    add_rules: bool,

    #[arg(long, default_value = "/sbin/ebtables")]
    ebtables: PathBuf,

    /// Minimum seconds between samples.
    #[arg(long, default_value_t = 10)]
    sleep: u64,

    /// Create the output file's parent directories if missing.
    #[arg(long)]
    parents: bool,

    /// Detach into the background after opening the output file.
    #[arg(long)]
    daemon: bool,

    /// Write timestamped rows here instead of printing rates to stdout.
    #[arg(long)]
    file: Option<PathBuf>,

    /// Egress interfaces to track.
    #[arg(required = true)]
    ifnames: Vec<String>,
}

fn header_row(readings: &[Reading]) -> String {
    let mut row = String::from("time");
    for r in readings {
        row.push_str(&format!(" {}.pcnt {}.bcnt", r.out_if, r.out_if));
    }
    row
}

fn sample_row(timestamp: &str, readings: &[Reading]) -> String {
    let mut row = timestamp.to_string();
    for r in readings {
        row.push_str(&format!(" {} {}", r.pcnt, r.bcnt));
    }
    row
}

fn totals(readings: &[Reading]) -> (u64, u64) {
    readings.iter().fold((0u64, 0u64), |(p, b), r| (p + r.pcnt, b + r.bcnt))
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    if cli.sleep == 0 {
        anyhow::bail!("--sleep must be at least 1");
    }

    let stack: Stack = match cli.stack {
        StackArg::Ip => Stack::Ip,
        StackArg::Xia => Stack::Xia,
    };

    if cli.add_rules {
        for ifname in &cli.ifnames {
            add_rule(&cli.ebtables, stack.into(), ifname)
                .with_context(|| format!("installing ebtables rule for `{ifname}`"))?;
        }
    }

    let reader = EbtCounterReader::new().context("opening ebtables counter socket")?;

    let mut out = match &cli.file {
        Some(path) => {
            if cli.parents {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).with_context(|| format!("creating `{}`", parent.display()))?;
                }
            }
            let readings = reader.read(stack.into()).context("initial counter sample")?;
            let mut f: File = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(path)
                .with_context(|| format!("opening `{}`", path.display()))?;
            writeln!(f, "{}", header_row(&readings))?;
            f.flush()?;
            Some(f)
        }
        None => None,
    };

    if cli.daemon {
        daemonize::Daemonize::new().start().context("daemonizing")?;
    }

    let mut clock = SystemClock::default();
    let mut prev_totals = totals(&reader.read(stack.into()).context("sampling counters")?);
    let mut prev_time = clock.now();

    let mut behind_warned = false;
    loop {
        let next_due = prev_time + cli.sleep as f64;
        let now = clock.now();
        if now < next_due {
            clock.sleep(std::time::Duration::from_secs_f64(next_due - now));
            behind_warned = false;
        } else if !behind_warned {
            log::warn!("falling behind the configured sample interval");
            behind_warned = true;
        }

        let now = clock.now();
        let readings = reader.read(stack.into()).context("sampling counters")?;

        match &mut out {
            Some(f) => {
                let timestamp = Utc::now().format("%Y-%m-%d-%H-%M-%S").to_string();
                writeln!(f, "{}", sample_row(&timestamp, &readings))?;
                f.flush()?;
            }
            None => {
                let (pcnt, bcnt) = totals(&readings);
                let dt = now - prev_time;
                let pps = (pcnt.saturating_sub(prev_totals.0)) as f64 / dt;
                let bps = (bcnt.saturating_sub(prev_totals.1)) as f64 / dt;
                println!("{pps:.1} pps\t{bps:.1} Bps");
                prev_totals = (pcnt, bcnt);
            }
        }

        prev_time = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_readings() -> Vec<Reading> {
        vec![Reading { out_if: "veth0".to_string(), pcnt: 100, bcnt: 6400 }]
    }

    #[test]
    fn header_row_lists_pcnt_and_bcnt_columns() {
        assert_eq!(header_row(&sample_readings()), "time veth0.pcnt veth0.bcnt");
    }

    #[test]
    fn sample_row_ends_with_expected_counts_from_spec_scenario() {
        let row = sample_row("2026-08-01-00-00-00", &sample_readings());
        assert!(row.ends_with("100 6400"));
    }

    #[test]
    fn totals_sums_across_interfaces() {
        let readings = vec![
            Reading { out_if: "a".into(), pcnt: 10, bcnt: 20 },
            Reading { out_if: "b".into(), pcnt: 5, bcnt: 7 },
        ];
        assert_eq!(totals(&readings), (15, 27));
    }
}
