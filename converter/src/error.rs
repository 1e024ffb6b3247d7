use std::net::IpAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown timezone {0:?}")]
    UnknownTimezone(String),

    #[error("address families differ: {0} and {1}")]
    MixedAddressFamilies(IpAddr, IpAddr),

    #[error("UDP payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("timestamp {0} cannot be stored in a pcap record")]
    TimestampOutOfRange(i64),
}
