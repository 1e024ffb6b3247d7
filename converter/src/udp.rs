//! UDP datagrams.
//!
//! A datagram is assembled in two steps. [`UdpBuilder`] holds the ports and payload, and
//! [`UdpBuilder::finalize`] consumes it against the enclosing network context, returning an
//! immutable [`UdpSegment`] that carries the checksum.

use crate::checksum::Checksum;
use crate::ip::{AddressPair, IpProtocol, NetworkContext};
use crate::Error;

/// UDP header length in bytes.
pub const HEADER_LEN: usize = 8;

/// Largest payload whose length still fits the 16 bit length field.
pub const MAX_PAYLOAD: usize = u16::MAX as usize - HEADER_LEN;

/// A UDP datagram that has not been checksummed yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpBuilder {
    pub source_port: u16,
    pub destination_port: u16,
    pub payload: Vec<u8>,
}

impl UdpBuilder {
    pub fn new(source_port: u16, destination_port: u16, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            source_port,
            destination_port,
            payload: payload.into(),
        }
    }

    /// Header plus payload length, as carried in the length field.
    pub fn len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Compute the checksum and freeze the datagram.
    ///
    /// With no network context the pseudo-header addresses count as zero, but the protocol
    /// number and UDP length are still summed.
    pub fn finalize(self, context: Option<&NetworkContext>) -> Result<UdpSegment, Error> {
        let Ok(length) = u16::try_from(self.len()) else {
            return Err(Error::PayloadTooLarge {
                len: self.payload.len(),
                max: MAX_PAYLOAD,
            });
        };

        let mut sum = Checksum::new();

        match context {
            Some(NetworkContext {
                protocol,
                addresses: AddressPair::V4 {
                    source,
                    destination,
                },
            }) => {
                sum.add_bytes(&source.octets())
                    .add_bytes(&destination.octets())
                    .add_u16(u16::from(u8::from(*protocol)))
                    .add_u16(length);
            }
            Some(NetworkContext {
                protocol,
                addresses: AddressPair::V6 {
                    source,
                    destination,
                },
            }) => {
                sum.add_bytes(&source.octets())
                    .add_bytes(&destination.octets())
                    .add_u32(u32::from(length))
                    .add_u32(u32::from(u8::from(*protocol)));
            }
            None => {
                sum.add_u16(u16::from(u8::from(IpProtocol::Udp)))
                    .add_u16(length);
            }
        }

        sum.add_u16(self.source_port)
            .add_u16(self.destination_port)
            .add_u16(length)
            .add_bytes(&self.payload);

        // A transmitted zero means "no checksum", so a real zero goes out as all ones.
        let checksum = match sum.finish() {
            0 => 0xffff,
            other => other,
        };

        Ok(UdpSegment {
            source_port: self.source_port,
            destination_port: self.destination_port,
            checksum,
            payload: self.payload,
        })
    }
}

/// A checksummed UDP datagram, ready to be written out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpSegment {
    source_port: u16,
    destination_port: u16,
    checksum: u16,
    payload: Vec<u8>,
}

impl UdpSegment {
    pub fn source_port(&self) -> u16 {
        self.source_port
    }

    pub fn destination_port(&self) -> u16 {
        self.destination_port
    }

    pub fn checksum(&self) -> u16 {
        self.checksum
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Append header and payload to `buf`.
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.source_port.to_be_bytes());
        buf.extend_from_slice(&self.destination_port.to_be_bytes());
        buf.extend_from_slice(&(self.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.checksum.to_be_bytes());
        buf.extend_from_slice(&self.payload);
    }
}
