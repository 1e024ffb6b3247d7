//! Write one CSV row per message in a sipmsg.log, without producing a capture.

use anyhow::Context;
use chrono_tz::Tz;
use clap::Parser;
use env_logger::Env;
use sipmsg_pcap::*;
use std::path::PathBuf;

/// Dump the messages of an SBC `sipmsg.log` as CSV
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct DumpArgs {
    /// Path to the sipmsg.log file.
    #[arg(short, long)]
    file: PathBuf,

    /// Output path. Defaults to the input path with a `.csv` extension.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Timezone the log timestamps were written in.
    #[arg(short, long, default_value = "UTC", value_parser = parse_timezone)]
    timezone: Tz,
}

fn main() -> anyhow::Result<()> {
    let args = DumpArgs::parse();

    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    log::info!("Dumping {:?}", args.file);

    let messages = SipMsgLog::open(&args.file, args.timezone)
        .with_context(|| format!("Unable to read {}", args.file.display()))?;

    let out_path = args.output.clone().unwrap_or_else(|| {
        let mut out_path = args.file.clone();

        out_path.set_extension("csv");

        out_path
    });

    let mut wtr = csv::Writer::from_path(&out_path)
        .with_context(|| format!("Unable to create {}", out_path.display()))?;

    for (index, record) in messages.enumerate() {
        match MessageStat::new(index + 1, &record?) {
            Ok(stat) => wtr.serialize(stat)?,
            Err(e) => log::warn!("Skipping message {}: {}", index + 1, e),
        }
    }

    wtr.flush()?;

    log::info!("Done, wrote {:?}", out_path);

    Ok(())
}
