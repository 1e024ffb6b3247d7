pub mod capture;
pub mod checksum;
mod error;
pub mod ip;
pub mod sipmsg;
pub mod udp;

pub use capture::{CaptureConfig, CaptureWriter, Frame, PacketCapture};
pub use error::Error;
pub use ip::NetworkConfig;
pub use sipmsg::{Direction, MessageRecord, SipMsgLog};

use chrono_tz::Tz;
use clap::Parser;
use clap_num::maybe_hex;
use pcap_file::Endianness;
use serde_with::serde_as;
use serde_with::DurationMicroSeconds;
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Convert an SBC `sipmsg.log` into a pcap file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the sipmsg.log file.
    #[arg(short, long)]
    pub file: PathBuf,

    /// Output path. Defaults to the input path with a `.pcap` extension. `-` writes to stdout.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Gzip the output. Implied by an output path ending in `.gz`.
    #[arg(short = 'z', long)]
    pub compress: bool,

    /// Timezone the log timestamps were written in.
    #[arg(short, long, default_value = "UTC", value_parser = parse_timezone)]
    pub timezone: Tz,

    /// TTL (IPv4) and hop limit (IPv6) of the generated packets.
    #[arg(long, default_value_t = ip::DEFAULT_TTL, value_parser = maybe_hex::<u8>)]
    pub ttl: u8,

    /// Write pcap headers big endian instead of in native byte order.
    #[arg(long)]
    pub big_endian: bool,
}

impl Args {
    /// Whether the output should be gzipped.
    pub fn compressed(&self) -> bool {
        self.compress
            || self
                .output
                .as_ref()
                .and_then(|path| path.extension())
                .is_some_and(|ext| ext == "gz")
    }

    /// Resolved output path, `None` for stdout.
    pub fn output_path(&self) -> Option<PathBuf> {
        match &self.output {
            Some(path) if path.as_os_str() == "-" => None,
            Some(path) => Some(path.clone()),
            None => {
                let mut path = self.file.clone();

                path.set_extension(if self.compressed() { "pcap.gz" } else { "pcap" });

                Some(path)
            }
        }
    }

    pub fn network_config(&self) -> NetworkConfig {
        NetworkConfig { ttl: self.ttl }
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            endianness: if self.big_endian {
                Endianness::Big
            } else {
                capture::native_endianness()
            },
            ..CaptureConfig::default()
        }
    }
}

pub fn parse_timezone(name: &str) -> Result<Tz, Error> {
    name.parse::<Tz>()
        .map_err(|_| Error::UnknownTimezone(name.to_string()))
}

/// A single message, also a single CSV row.
#[serde_as]
#[derive(Debug, serde::Serialize)]
pub struct MessageStat {
    /// Position of the message in the log, starting at 1.
    pub number: usize,

    #[serde_as(as = "DurationMicroSeconds")]
    #[serde(rename = "time_us")]
    pub time: Duration,

    pub direction: Direction,

    pub source: SocketAddr,

    pub destination: SocketAddr,

    /// Payload length in bytes.
    pub length: usize,

    pub start_line: String,
}

impl MessageStat {
    /// Fails for messages dated before the Unix epoch.
    pub fn new(number: usize, record: &MessageRecord) -> Result<Self, Error> {
        let seconds = u64::try_from(record.seconds)
            .map_err(|_| Error::TimestampOutOfRange(record.seconds))?;
        let time = Duration::from_secs(seconds) + Duration::from_micros(record.microseconds.into());

        Ok(Self {
            number,
            time,
            direction: record.direction,
            source: record.source(),
            destination: record.destination(),
            length: record.payload.len(),
            start_line: record.start_line(),
        })
    }
}

/// Totals from one conversion run.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Summary {
    pub frames: usize,
    pub skipped: usize,
}

/// Stream every record into `writer`.
///
/// Records that cannot be framed are logged and skipped. Read and write errors abort the run.
pub fn convert<I, W>(
    records: I,
    writer: &mut CaptureWriter<W>,
    network: &NetworkConfig,
) -> Result<Summary, Error>
where
    I: IntoIterator<Item = Result<MessageRecord, Error>>,
    W: Write,
{
    let mut summary = Summary::default();

    for record in records {
        let record = record?;

        match Frame::from_record(&record, network) {
            Ok(frame) => {
                writer.write_frame(&frame)?;

                summary.frames += 1;
            }
            Err(e) => {
                log::warn!(
                    "Skipping message {} -> {}: {}",
                    record.source(),
                    record.destination(),
                    e
                );

                summary.skipped += 1;
            }
        }
    }

    Ok(summary)
}
