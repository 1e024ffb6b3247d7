//! Classic pcap output.
//!
//! Useful resources:
//! * <https://wiki.wireshark.org/Development/LibpcapFileFormat>
//! * <https://www.tcpdump.org/linktypes.html>

use crate::ip::{IpPacket, NetworkConfig};
use crate::sipmsg::MessageRecord;
use crate::udp::UdpBuilder;
use crate::Error;
use pcap_file::{DataLink, Endianness};
use std::io::Write;

pub const MAGIC: u32 = 0xa1b2c3d4;
pub const VERSION_MAJOR: u16 = 2;
pub const VERSION_MINOR: u16 = 4;

pub const GLOBAL_HEADER_LEN: usize = 24;
pub const RECORD_HEADER_LEN: usize = 16;

/// File level settings.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Byte order of the pcap headers. Packet bytes are always in network order.
    pub endianness: Endianness,

    pub datalink: DataLink,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            endianness: native_endianness(),
            datalink: DataLink::RAW,
        }
    }
}

pub fn native_endianness() -> Endianness {
    if cfg!(target_endian = "big") {
        Endianness::Big
    } else {
        Endianness::Little
    }
}

/// One captured packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub seconds: u32,
    pub microseconds: u32,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn new(seconds: u32, microseconds: u32, packet: &IpPacket) -> Self {
        Self {
            seconds,
            microseconds,
            data: packet.serialize(),
        }
    }

    /// Wrap a message in UDP and IP headers, source and destination following its direction.
    pub fn from_record(record: &MessageRecord, config: &NetworkConfig) -> Result<Self, Error> {
        let seconds = u32::try_from(record.seconds)
            .map_err(|_| Error::TimestampOutOfRange(record.seconds))?;

        let udp = UdpBuilder::new(
            record.source().port(),
            record.destination().port(),
            record.payload.clone(),
        );

        let packet = IpPacket::new(record.addresses()?, udp, config)?;

        Ok(Self::new(seconds, record.microseconds, &packet))
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Streaming pcap writer. The global header goes out on construction, then one record per
/// [`write_frame`](Self::write_frame) call.
///
/// If a write fails the output is left truncated and no further writes should be made.
pub struct CaptureWriter<W: Write> {
    sink: W,
    config: CaptureConfig,
    frames: usize,
}

impl<W: Write> std::fmt::Debug for CaptureWriter<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureWriter")
            .field("config", &self.config)
            .field("frames", &self.frames)
            .finish()
    }
}

impl<W: Write> CaptureWriter<W> {
    pub fn new(mut sink: W, config: CaptureConfig) -> Result<Self, Error> {
        let mut header = Vec::with_capacity(GLOBAL_HEADER_LEN);

        put_u32(&mut header, config.endianness, MAGIC);
        put_u16(&mut header, config.endianness, VERSION_MAJOR);
        put_u16(&mut header, config.endianness, VERSION_MINOR);
        // Reserved, historically thiszone and sigfigs
        put_u32(&mut header, config.endianness, 0);
        put_u32(&mut header, config.endianness, 0);
        // Snaplen, zero meaning no limit
        put_u32(&mut header, config.endianness, 0);
        put_u32(&mut header, config.endianness, config.datalink.into());

        sink.write_all(&header)?;

        Ok(Self {
            sink,
            config,
            frames: 0,
        })
    }

    pub fn write_frame(&mut self, frame: &Frame) -> Result<(), Error> {
        // Packets are bounded by the IP length fields, well below u32::MAX.
        let len = frame.len() as u32;

        let mut header = Vec::with_capacity(RECORD_HEADER_LEN);

        put_u32(&mut header, self.config.endianness, frame.seconds);
        put_u32(&mut header, self.config.endianness, frame.microseconds);
        // Captured and original length are always the same, nothing is truncated
        put_u32(&mut header, self.config.endianness, len);
        put_u32(&mut header, self.config.endianness, len);

        self.sink.write_all(&header)?;
        self.sink.write_all(&frame.data)?;

        self.frames += 1;

        Ok(())
    }

    /// Number of frames written so far.
    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn get_ref(&self) -> &W {
        &self.sink
    }

    /// Flush and hand back the sink.
    pub fn into_inner(mut self) -> Result<W, Error> {
        self.sink.flush()?;

        Ok(self.sink)
    }
}

/// An in-memory capture: header settings plus frames in insertion order.
#[derive(Debug, Default, Clone)]
pub struct PacketCapture {
    config: CaptureConfig,
    frames: Vec<Frame>,
}

impl PacketCapture {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            frames: Vec::new(),
        }
    }

    pub fn add_frame(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn write<W: Write>(&self, sink: W) -> Result<W, Error> {
        let mut writer = CaptureWriter::new(sink, self.config)?;

        for frame in &self.frames {
            writer.write_frame(frame)?;
        }

        writer.into_inner()
    }
}

fn put_u16(buf: &mut Vec<u8>, endianness: Endianness, value: u16) {
    match endianness {
        Endianness::Big => buf.extend_from_slice(&value.to_be_bytes()),
        Endianness::Little => buf.extend_from_slice(&value.to_le_bytes()),
    }
}

fn put_u32(buf: &mut Vec<u8>, endianness: Endianness, value: u32) {
    match endianness {
        Endianness::Big => buf.extend_from_slice(&value.to_be_bytes()),
        Endianness::Little => buf.extend_from_slice(&value.to_le_bytes()),
    }
}
