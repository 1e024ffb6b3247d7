//! IPv4 and IPv6 envelopes around a UDP datagram.

use crate::checksum::Checksum;
use crate::udp::{UdpBuilder, UdpSegment};
use crate::Error;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

pub const IPV4_HEADER_LEN: usize = 20;
pub const IPV6_HEADER_LEN: usize = 40;

/// Default TTL / hop limit for synthesized packets.
pub const DEFAULT_TTL: u8 = 64;

#[derive(Debug, Copy, Clone, PartialEq, Eq, num_enum::FromPrimitive, num_enum::IntoPrimitive)]
#[repr(u8)]
pub enum IpProtocol {
    Udp = 17,
    #[num_enum(catch_all)]
    Unknown(u8),
}

/// Source and destination of one packet, always of the same family.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AddressPair {
    V4 {
        source: Ipv4Addr,
        destination: Ipv4Addr,
    },
    V6 {
        source: Ipv6Addr,
        destination: Ipv6Addr,
    },
}

impl AddressPair {
    /// Pair two addresses, failing if their families differ.
    pub fn new(source: IpAddr, destination: IpAddr) -> Result<Self, Error> {
        match (source, destination) {
            (IpAddr::V4(source), IpAddr::V4(destination)) => Ok(Self::V4 {
                source,
                destination,
            }),
            (IpAddr::V6(source), IpAddr::V6(destination)) => Ok(Self::V6 {
                source,
                destination,
            }),
            (source, destination) => Err(Error::MixedAddressFamilies(source, destination)),
        }
    }

    pub fn source(&self) -> IpAddr {
        match self {
            Self::V4 { source, .. } => IpAddr::V4(*source),
            Self::V6 { source, .. } => IpAddr::V6(*source),
        }
    }

    pub fn destination(&self) -> IpAddr {
        match self {
            Self::V4 { destination, .. } => IpAddr::V4(*destination),
            Self::V6 { destination, .. } => IpAddr::V6(*destination),
        }
    }
}

/// The network layer fields a transport checksum depends on.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NetworkContext {
    pub protocol: IpProtocol,
    pub addresses: AddressPair,
}

impl NetworkContext {
    pub fn udp(addresses: AddressPair) -> Self {
        Self {
            protocol: IpProtocol::Udp,
            addresses,
        }
    }
}

/// Network layer settings applied to every synthesized packet.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    /// IPv4 time to live, also used as the IPv6 hop limit.
    pub ttl: u8,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self { ttl: DEFAULT_TTL }
    }
}

/// An IP packet carrying exactly one finalized UDP datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpPacket {
    V4(Ipv4Packet),
    V6(Ipv6Packet),
}

impl IpPacket {
    /// Wrap `udp` in an IPv4 or IPv6 header depending on the address family.
    pub fn new(
        addresses: AddressPair,
        udp: UdpBuilder,
        config: &NetworkConfig,
    ) -> Result<Self, Error> {
        match addresses {
            AddressPair::V4 {
                source,
                destination,
            } => Ipv4Packet::new(source, destination, udp, config).map(Self::V4),
            AddressPair::V6 {
                source,
                destination,
            } => Ipv6Packet::new(source, destination, udp, config).map(Self::V6),
        }
    }

    pub fn source(&self) -> IpAddr {
        match self {
            Self::V4(packet) => IpAddr::V4(packet.source),
            Self::V6(packet) => IpAddr::V6(packet.source),
        }
    }

    pub fn destination(&self) -> IpAddr {
        match self {
            Self::V4(packet) => IpAddr::V4(packet.destination),
            Self::V6(packet) => IpAddr::V6(packet.destination),
        }
    }

    pub fn udp(&self) -> &UdpSegment {
        match self {
            Self::V4(packet) => &packet.udp,
            Self::V6(packet) => &packet.udp,
        }
    }

    /// Total length in bytes, headers included.
    pub fn len(&self) -> usize {
        match self {
            Self::V4(packet) => packet.len(),
            Self::V6(packet) => packet.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn serialize(&self) -> Vec<u8> {
        match self {
            Self::V4(packet) => packet.serialize(),
            Self::V6(packet) => packet.serialize(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Packet {
    source: Ipv4Addr,
    destination: Ipv4Addr,
    ttl: u8,
    checksum: u16,
    udp: UdpSegment,
}

impl Ipv4Packet {
    /// Largest UDP payload that still fits the 16 bit total length field.
    pub const MAX_PAYLOAD: usize = u16::MAX as usize - IPV4_HEADER_LEN - crate::udp::HEADER_LEN;

    pub fn new(
        source: Ipv4Addr,
        destination: Ipv4Addr,
        udp: UdpBuilder,
        config: &NetworkConfig,
    ) -> Result<Self, Error> {
        if udp.payload.len() > Self::MAX_PAYLOAD {
            return Err(Error::PayloadTooLarge {
                len: udp.payload.len(),
                max: Self::MAX_PAYLOAD,
            });
        }

        let context = NetworkContext::udp(AddressPair::V4 {
            source,
            destination,
        });

        let udp = udp.finalize(Some(&context))?;

        let mut packet = Self {
            source,
            destination,
            ttl: config.ttl,
            checksum: 0,
            udp,
        };

        let mut header = [0u8; IPV4_HEADER_LEN];
        packet.write_header(&mut header);
        packet.checksum = Checksum::new().add_bytes(&header).finish();

        Ok(packet)
    }

    pub fn source(&self) -> Ipv4Addr {
        self.source
    }

    pub fn destination(&self) -> Ipv4Addr {
        self.destination
    }

    pub fn ttl(&self) -> u8 {
        self.ttl
    }

    /// Header checksum.
    pub fn checksum(&self) -> u16 {
        self.checksum
    }

    pub fn udp(&self) -> &UdpSegment {
        &self.udp
    }

    pub fn len(&self) -> usize {
        IPV4_HEADER_LEN + self.udp.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    fn write_header(&self, header: &mut [u8; IPV4_HEADER_LEN]) {
        // Version 4, IHL 5 words
        header[0] = 0x45;
        // TOS, identification, flags and fragment offset stay zero
        header[2..4].copy_from_slice(&(self.len() as u16).to_be_bytes());
        header[8] = self.ttl;
        header[9] = IpProtocol::Udp.into();
        header[10..12].copy_from_slice(&self.checksum.to_be_bytes());
        header[12..16].copy_from_slice(&self.source.octets());
        header[16..20].copy_from_slice(&self.destination.octets());
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.len());

        let mut header = [0u8; IPV4_HEADER_LEN];
        self.write_header(&mut header);

        buf.extend_from_slice(&header);
        self.udp.write_to(&mut buf);

        buf
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv6Packet {
    source: Ipv6Addr,
    destination: Ipv6Addr,
    hop_limit: u8,
    udp: UdpSegment,
}

impl Ipv6Packet {
    /// Largest UDP payload that still fits the 16 bit payload length field.
    pub const MAX_PAYLOAD: usize = crate::udp::MAX_PAYLOAD;

    pub fn new(
        source: Ipv6Addr,
        destination: Ipv6Addr,
        udp: UdpBuilder,
        config: &NetworkConfig,
    ) -> Result<Self, Error> {
        let context = NetworkContext::udp(AddressPair::V6 {
            source,
            destination,
        });

        Ok(Self {
            source,
            destination,
            hop_limit: config.ttl,
            udp: udp.finalize(Some(&context))?,
        })
    }

    pub fn source(&self) -> Ipv6Addr {
        self.source
    }

    pub fn destination(&self) -> Ipv6Addr {
        self.destination
    }

    pub fn hop_limit(&self) -> u8 {
        self.hop_limit
    }

    pub fn udp(&self) -> &UdpSegment {
        &self.udp
    }

    pub fn len(&self) -> usize {
        IPV6_HEADER_LEN + self.udp.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.len());

        // Version 6, zero traffic class and flow label
        buf.extend_from_slice(&(6u32 << 28).to_be_bytes());
        buf.extend_from_slice(&(self.udp.len() as u16).to_be_bytes());
        buf.push(IpProtocol::Udp.into());
        buf.push(self.hop_limit);
        buf.extend_from_slice(&self.source.octets());
        buf.extend_from_slice(&self.destination.octets());

        self.udp.write_to(&mut buf);

        buf
    }
}
