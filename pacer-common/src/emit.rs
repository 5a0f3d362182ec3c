//! Reservation/commit protocol for the bounded output buffer.

use crate::record::{AddressFamily, ClassificationRecord, ADDR_LEN};

/// A shared, bounded buffer of fixed-size records.
///
/// Implementations must be safe for concurrent producers and must never
/// block: when the buffer is full, `reserve` returns `None`.
pub trait RecordBuffer {
    type Slot<'a>: RecordSlot
    where
        Self: 'a;

    fn reserve(&self) -> Option<Self::Slot<'_>>;
}

/// One reserved record slot.
///
/// Nothing written to the slot is observable until [`commit`](Self::commit).
/// A slot dropped without commit must never become visible.
pub trait RecordSlot {
    fn write_ifindex(&mut self, ifindex: u32);
    fn write_family(&mut self, family: AddressFamily);
    fn write_address(&mut self, addr: &[u8; ADDR_LEN]);
    fn commit(self);
}

/// The buffer had no free slot; the record was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferFull;

/// Publishes `record` into `buffer`, best effort.
///
/// Fields are written in wire order and `commit` is the last call, so the
/// record becomes visible as a whole or not at all.
#[inline(always)]
pub fn emit<B: RecordBuffer + ?Sized>(
    buffer: &B,
    record: &ClassificationRecord,
) -> Result<(), BufferFull> {
    let mut slot = buffer.reserve().ok_or(BufferFull)?;
    slot.write_ifindex(record.ifindex);
    slot.write_family(record.source.family());
    slot.write_address(&record.source.padded());
    slot.commit();
    Ok(())
}
