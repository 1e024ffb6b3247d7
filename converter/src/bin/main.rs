use anyhow::Context;
use clap::Parser;
use env_logger::Env;
use flate2::write::GzEncoder;
use flate2::Compression;
use sipmsg_pcap::*;
use std::fs::File;
use std::io::{self, BufRead, BufWriter, Write};

fn write_capture<R: BufRead, W: Write>(
    messages: SipMsgLog<R>,
    sink: W,
    args: &Args,
) -> anyhow::Result<(W, Summary)> {
    let mut writer = CaptureWriter::new(sink, args.capture_config())?;

    let summary = convert(messages, &mut writer, &args.network_config())?;

    Ok((writer.into_inner()?, summary))
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    log::info!("Converting {:?}", args.file);

    let messages = SipMsgLog::open(&args.file, args.timezone)
        .with_context(|| format!("Unable to read {}", args.file.display()))?;

    log::debug!("{:?}", messages);

    let output_path = args.output_path();

    let sink: Box<dyn Write> = match &output_path {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("Unable to create {}", path.display()))?,
        )),
        None => Box::new(io::stdout().lock()),
    };

    let summary = if args.compressed() {
        let (encoder, summary) =
            write_capture(messages, GzEncoder::new(sink, Compression::default()), &args)?;

        // Writes the gzip trailer
        encoder.finish()?.flush()?;

        summary
    } else {
        let (mut sink, summary) = write_capture(messages, sink, &args)?;

        sink.flush()?;

        summary
    };

    if summary.skipped > 0 {
        log::warn!("Skipped {} messages", summary.skipped);
    }

    match output_path {
        Some(path) => log::info!("Done, wrote {} frames to {:?}", summary.frames, path),
        None => log::info!("Done, wrote {} frames", summary.frames),
    }

    Ok(())
}
