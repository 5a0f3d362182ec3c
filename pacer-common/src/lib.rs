#![no_std]

//! Frame classification shared by the XDP program and the userspace agent.
//!
//! The pipeline is generic over where frame bytes come from ([`Frame`]) and
//! where records go ([`RecordBuffer`]), so the exact code that runs in the
//! kernel is also what the unit tests drive against plain byte slices and a
//! [`SlotRing`].
//!
//! Nothing in here allocates, loops over frame-controlled lengths, or can
//! panic on the classification path.

pub mod classify;
pub mod emit;
pub mod frame;
pub mod record;
pub mod ring;

pub use classify::{observe, Observation, Outcome, Skip, Verdict};
pub use emit::{emit, BufferFull, RecordBuffer, RecordSlot};
pub use frame::{Frame, InsufficientData};
pub use record::{
    AddressFamily, ClassificationRecord, DecodeError, RawRecord, SourceAddress, ADDR_LEN,
    RECORD_LEN,
};
pub use ring::SlotRing;

/// Byte size of the kernel ring buffer holding records.
pub const RING_BYTES: u32 = 1 << 20;

/// Name of the XDP program inside the eBPF object.
pub const PROGRAM_NAME: &str = "pacer";

/// Name of the ring buffer map inside the eBPF object.
pub const MAP_NAME: &str = "PACKETS";
