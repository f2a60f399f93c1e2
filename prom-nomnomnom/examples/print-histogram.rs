use anyhow::{anyhow, Result};
use indoc::indoc;
use itertools::Itertools;
use prom_nomnomnom::parser::{MetricType, MetricValue};

const COLORS: &[&'static str] = &[
    "\u{2591}", "\u{2592}", "\u{2593}",
    "\u{25A3}", "\u{25A9}", "\u{25A4}"
];

fn main() -> Result<()> {
    let exposition = indoc! {r#"
        # HELP request_seconds Request latency
        # TYPE request_seconds histogram
        request_seconds_bucket{le="0.5"} 5
        request_seconds_bucket{le="1.0"} 7
        request_seconds_bucket{le="+Inf"} 15
        request_seconds_count 15
        request_seconds_sum 2
    "#};

    let mut args = std::env::args();

    let progname = args.next().ok_or(anyhow!("ARGV[0] was not set??"))?;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" => {
                println!("Usage: {} [--print-exposition]", progname);
                return Ok(());
            }
            "--print-exposition" => {
                println!("Exposition:\n\n{}", exposition);
            }
            arg => return Err(anyhow!("Unknown argument: {}", arg)),
        }
    }

    let families = prom_nomnomnom::parse_str(exposition)?;

    let family = families.values().next().ok_or(anyhow!("empty exposition?"))?;

    assert_eq!(MetricType::Histogram, family.metric_type);

    let histogram = match family.metrics.first().map(|metric| &metric.value) {
        Some(MetricValue::Histogram(histogram)) => histogram,
        _ => return Err(anyhow!("no histogram series?")),
    };

    let factor = match histogram.count {
        count if count < 25 => 2,
        _ => 1,
    };

    print!("Distribution of «{}»: ", family.name);
    histogram.buckets.iter().zip(COLORS).fold(0, |acc, (bucket, color)| {
        let cur_length = bucket.cumulative_count as usize;
        print!("{}", color.repeat(cur_length.saturating_sub(acc) * factor));
        cur_length
    });
    print!("\t");

    println!(
        "[ {}]",
        histogram
            .buckets
            .iter()
            .zip(COLORS.iter().cycle())
            .map(|(bucket, color)| format!("{} ≤ {} ", color, bucket.upper_bound))
            .join(" ")
    );

    Ok(())
}
