//! Classification records and their fixed-size wire format.

use thiserror::Error;

/// Size of the address field in every record, regardless of family.
pub const ADDR_LEN: usize = 16;

/// Size of one record in the output buffer.
pub const RECORD_LEN: usize = core::mem::size_of::<RawRecord>();

/// Discriminator for the address bytes of a record.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "user", serde(rename_all = "lowercase"))]
pub enum AddressFamily {
    Ipv4 = 0,
    Ipv6 = 1,
}

impl TryFrom<u32> for AddressFamily {
    type Error = DecodeError;

    fn try_from(tag: u32) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(AddressFamily::Ipv4),
            1 => Ok(AddressFamily::Ipv6),
            other => Err(DecodeError::UnknownFamily(other)),
        }
    }
}

/// Source address copied verbatim (network byte order) out of an IP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceAddress {
    V4([u8; 4]),
    V6([u8; 16]),
}

impl SourceAddress {
    pub const fn family(&self) -> AddressFamily {
        match self {
            SourceAddress::V4(_) => AddressFamily::Ipv4,
            SourceAddress::V6(_) => AddressFamily::Ipv6,
        }
    }

    /// The address as it sits in a record: IPv4 in the first four bytes,
    /// zero padding after it.
    #[inline(always)]
    pub fn padded(&self) -> [u8; ADDR_LEN] {
        match *self {
            SourceAddress::V4([a, b, c, d]) => [a, b, c, d, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
            SourceAddress::V6(octets) => octets,
        }
    }
}

#[cfg(feature = "user")]
impl From<SourceAddress> for core::net::IpAddr {
    fn from(source: SourceAddress) -> Self {
        match source {
            SourceAddress::V4(octets) => core::net::IpAddr::from(octets),
            SourceAddress::V6(octets) => core::net::IpAddr::from(octets),
        }
    }
}

/// One classified frame: where it came in and who sent it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassificationRecord {
    pub ifindex: u32,
    pub source: SourceAddress,
}

impl ClassificationRecord {
    pub fn to_raw(&self) -> RawRecord {
        RawRecord {
            ifindex: self.ifindex,
            family: self.source.family() as u32,
            addr: self.source.padded(),
        }
    }

    /// Interprets a raw record. Address bytes past the family's length are
    /// ignored.
    pub fn from_raw(raw: &RawRecord) -> Result<Self, DecodeError> {
        let source = match AddressFamily::try_from(raw.family)? {
            AddressFamily::Ipv4 => {
                let [a, b, c, d, ..] = raw.addr;
                SourceAddress::V4([a, b, c, d])
            }
            AddressFamily::Ipv6 => SourceAddress::V6(raw.addr),
        };
        Ok(Self {
            ifindex: raw.ifindex,
            source,
        })
    }

    /// Decodes one record as read from the output buffer.
    pub fn from_wire(bytes: &[u8]) -> Result<Self, DecodeError> {
        let raw = RawRecord::from_bytes(bytes)?;
        Self::from_raw(&raw)
    }
}

/// Layout of a record inside the output buffer.
///
/// `ifindex` and `family` are little-endian on the wire (the eBPF target is
/// `bpfel` and writes them in native order); `addr` is raw network order.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawRecord {
    pub ifindex: u32,
    pub family: u32,
    pub addr: [u8; ADDR_LEN],
}

impl RawRecord {
    pub const ZERO: RawRecord = RawRecord {
        ifindex: 0,
        family: 0,
        addr: [0; ADDR_LEN],
    };

    pub fn to_bytes(&self) -> [u8; RECORD_LEN] {
        let mut out = [0u8; RECORD_LEN];
        out[0..4].copy_from_slice(&self.ifindex.to_le_bytes());
        out[4..8].copy_from_slice(&self.family.to_le_bytes());
        out[8..].copy_from_slice(&self.addr);
        out
    }

    /// Reads the first [`RECORD_LEN`] bytes. Trailing bytes are ignored.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let Some(record) = bytes.get(..RECORD_LEN) else {
            return Err(DecodeError::Truncated { len: bytes.len() });
        };
        let mut ifindex = [0u8; 4];
        let mut family = [0u8; 4];
        let mut addr = [0u8; ADDR_LEN];
        ifindex.copy_from_slice(&record[0..4]);
        family.copy_from_slice(&record[4..8]);
        addr.copy_from_slice(&record[8..]);
        Ok(Self {
            ifindex: u32::from_le_bytes(ifindex),
            family: u32::from_le_bytes(family),
            addr,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("record too short: {len} bytes, expected {}", RECORD_LEN)]
    Truncated { len: usize },
    #[error("unknown address family tag {0}")]
    UnknownFamily(u32),
}
