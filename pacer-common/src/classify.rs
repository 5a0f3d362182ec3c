//! Per-frame classification: link layer, then IPv4 or IPv6, then emit.
//!
//! The stages are kept as separate functions with their own result types so
//! that "was a record emitted" and "does the frame continue" stay independent.
//! Every path ends in [`Verdict::Pass`].

use network_types::{
    eth::{EthHdr, EtherType},
    ip::{Ipv4Hdr, Ipv6Hdr},
};

use crate::{
    emit::{emit, RecordBuffer},
    frame::Frame,
    record::{AddressFamily, ClassificationRecord, SourceAddress},
};

/// Host-order ethertype of IPv4.
pub const ETH_P_IP: u16 = u16::from_be(EtherType::Ipv4 as u16);
/// Host-order ethertype of IPv6.
pub const ETH_P_IPV6: u16 = u16::from_be(EtherType::Ipv6 as u16);

const ETH_PROTO_OFFSET: usize = 12;
const IPV4_SRC_OFFSET: usize = 12;
const IPV6_SRC_OFFSET: usize = 8;

/// What happens to the frame. There is only one answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
}

/// Header level at which a frame ran out of bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    Link,
    Ipv4,
    Ipv6,
}

/// Why no record was emitted for a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Skip {
    Truncated(Layer),
    /// Host-order ethertype that is neither IPv4 nor IPv6.
    Unsupported(u16),
    /// Classified, but the output buffer had no room.
    BufferFull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Emitted(AddressFamily),
    Skipped(Skip),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub verdict: Verdict,
    pub outcome: Outcome,
}

/// Result of reading the link-layer header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Ipv4 { offset: usize },
    Ipv6 { offset: usize },
    Unsupported(u16),
}

/// Reads the Ethernet header and picks the network-layer decoder.
#[inline(always)]
pub fn dispatch<F: Frame + ?Sized>(frame: &F) -> Result<Dispatch, Skip> {
    let eth = frame
        .window::<{ EthHdr::LEN }>(0)
        .map_err(|_| Skip::Truncated(Layer::Link))?;
    let proto = u16::from_be_bytes([eth[ETH_PROTO_OFFSET], eth[ETH_PROTO_OFFSET + 1]]);
    Ok(match proto {
        ETH_P_IP => Dispatch::Ipv4 {
            offset: EthHdr::LEN,
        },
        ETH_P_IPV6 => Dispatch::Ipv6 {
            offset: EthHdr::LEN,
        },
        other => Dispatch::Unsupported(other),
    })
}

/// Source address of the fixed 20-byte IPv4 header at `offset`. Options,
/// checksum and length fields are not looked at.
#[inline(always)]
pub fn decode_ipv4<F: Frame + ?Sized>(frame: &F, offset: usize) -> Result<SourceAddress, Skip> {
    let hdr = frame
        .window::<{ Ipv4Hdr::LEN }>(offset)
        .map_err(|_| Skip::Truncated(Layer::Ipv4))?;
    let s = IPV4_SRC_OFFSET;
    Ok(SourceAddress::V4([hdr[s], hdr[s + 1], hdr[s + 2], hdr[s + 3]]))
}

/// Source address of the fixed 40-byte IPv6 header at `offset`. Extension
/// headers are not followed.
#[inline(always)]
pub fn decode_ipv6<F: Frame + ?Sized>(frame: &F, offset: usize) -> Result<SourceAddress, Skip> {
    let hdr = frame
        .window::<{ Ipv6Hdr::LEN }>(offset)
        .map_err(|_| Skip::Truncated(Layer::Ipv6))?;
    let b = |i: usize| hdr[IPV6_SRC_OFFSET + i];
    Ok(SourceAddress::V6([
        b(0), b(1), b(2), b(3), b(4), b(5), b(6), b(7),
        b(8), b(9), b(10), b(11), b(12), b(13), b(14), b(15),
    ]))
}

/// Source address of the frame, if it is IPv4 or IPv6 and long enough.
#[inline(always)]
pub fn classify<F: Frame + ?Sized>(frame: &F) -> Result<SourceAddress, Skip> {
    match dispatch(frame)? {
        Dispatch::Ipv4 { offset } => decode_ipv4(frame, offset),
        Dispatch::Ipv6 { offset } => decode_ipv6(frame, offset),
        Dispatch::Unsupported(proto) => Err(Skip::Unsupported(proto)),
    }
}

/// Classifies one frame received on `ifindex` and, when it carries an IP
/// source address, publishes a record to `buffer`.
///
/// Never writes to the frame. Always returns [`Verdict::Pass`].
#[inline(always)]
pub fn observe<F, B>(frame: &F, ifindex: u32, buffer: &B) -> Observation
where
    F: Frame + ?Sized,
    B: RecordBuffer + ?Sized,
{
    let outcome = match classify(frame) {
        Ok(source) => {
            let record = ClassificationRecord { ifindex, source };
            match emit(buffer, &record) {
                Ok(()) => Outcome::Emitted(source.family()),
                Err(_) => Outcome::Skipped(Skip::BufferFull),
            }
        }
        Err(skip) => Outcome::Skipped(skip),
    };
    Observation {
        verdict: Verdict::Pass,
        outcome,
    }
}
