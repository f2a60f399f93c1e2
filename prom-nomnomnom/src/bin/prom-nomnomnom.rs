use std::{
    fs::File,
    io::{self, BufRead, BufReader},
    path::PathBuf,
};

use anyhow::{Context, Result};
use clap::Parser;
use itertools::Itertools;
use prom_nomnomnom::parser::{Metric, MetricValue};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[clap(about = "Dumps a Prometheus text exposition")]
struct Args {
    /// Exposition to read, stdin when omitted
    #[clap(short, long)]
    input: Option<PathBuf>,

    /// Print the parsed families as JSON
    #[clap(short, long)]
    json: bool,
}

fn describe(metric: &Metric) -> String {
    let value = match &metric.value {
        MetricValue::Counter(n)
        | MetricValue::Gauge(n)
        | MetricValue::Untyped(n)
        | MetricValue::Info(n) => n.to_string(),
        MetricValue::Summary(summary) => format!(
            "count={} sum={} [{}]",
            summary.count,
            summary.sum,
            summary
                .quantiles
                .iter()
                .map(|q| format!("{}: {}", q.quantile, q.value))
                .join(", ")
        ),
        MetricValue::Histogram(histogram) => format!(
            "count={} sum={} [{}]",
            histogram.count,
            histogram.sum,
            histogram
                .buckets
                .iter()
                .map(|b| format!("≤ {}: {}", b.upper_bound, b.cumulative_count))
                .join(", ")
        ),
    };

    match metric.timestamp_ms {
        Some(timestamp) => format!("{} {} @{}", metric.labels, value, timestamp),
        None => format!("{} {}", metric.labels, value),
    }
}

fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();

    let reader: Box<dyn BufRead> = match &args.input {
        Some(path) => Box::new(BufReader::new(
            File::open(path).with_context(|| format!("couldn't open {}", path.display()))?,
        )),
        None => Box::new(io::stdin().lock()),
    };

    let families = prom_nomnomnom::parse(reader).context("couldn't parse exposition")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&families)?);
        return Ok(());
    }

    for (name, family) in families.iter() {
        println!("{} ({})", name, family.metric_type);
        if let Some(help) = &family.help {
            println!("{}", help);
        }

        for metric in family.metrics.iter() {
            println!("  {}", describe(metric));
        }
        println!();
    }

    Ok(())
}
