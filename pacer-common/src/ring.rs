//! In-process bounded record buffer with the kernel ring buffer's contract.
//!
//! Producers reserve a slot by advancing a shared counter, fill it, and
//! publish it with a single release store. The consumer walks slots in
//! reservation order and stops at the first one that is reserved but not
//! yet committed, so a record is either seen whole or not at all. No locks.

use core::{
    cell::UnsafeCell,
    sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
};

use crate::{
    emit::{RecordBuffer, RecordSlot},
    record::{AddressFamily, RawRecord, ADDR_LEN, RECORD_LEN},
};

const PENDING: u8 = 0;
const COMMITTED: u8 = 1;
const DISCARDED: u8 = 2;

struct Cell {
    state: AtomicU8,
    record: UnsafeCell<RawRecord>,
}

impl Cell {
    const EMPTY: Cell = Cell {
        state: AtomicU8::new(PENDING),
        record: UnsafeCell::new(RawRecord::ZERO),
    };
}

/// A ring of `N` record slots shared by many producers and one consumer.
pub struct SlotRing<const N: usize> {
    reserved: AtomicU64,
    consumed: AtomicU64,
    consumer_taken: AtomicBool,
    cells: [Cell; N],
}

// A cell's record is only touched by the holder of its reservation, then by
// the consumer after observing COMMITTED with acquire ordering.
unsafe impl<const N: usize> Sync for SlotRing<N> {}

impl<const N: usize> Default for SlotRing<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> SlotRing<N> {
    pub const fn new() -> Self {
        Self {
            reserved: AtomicU64::new(0),
            consumed: AtomicU64::new(0),
            consumer_taken: AtomicBool::new(false),
            cells: [Cell::EMPTY; N],
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Number of reserved slots not yet released by the consumer.
    pub fn len(&self) -> usize {
        let consumed = self.consumed.load(Ordering::Acquire);
        (self.reserved.load(Ordering::Acquire) - consumed) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claims the single consumer handle. Returns `None` while another
    /// handle is alive.
    pub fn consumer(&self) -> Option<Consumer<'_, N>> {
        self.consumer_taken
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| Consumer { ring: self })
    }

    fn cell(&self, pos: u64) -> &Cell {
        &self.cells[(pos % N as u64) as usize]
    }
}

impl<const N: usize> RecordBuffer for SlotRing<N> {
    type Slot<'a>
        = Reservation<'a, N>
    where
        Self: 'a;

    fn reserve(&self) -> Option<Reservation<'_, N>> {
        if N == 0 {
            return None;
        }
        let mut pos = self.reserved.load(Ordering::Relaxed);
        loop {
            // A stale `pos` can trail `consumed`; the CAS below rejects it.
            if pos.saturating_sub(self.consumed.load(Ordering::Acquire)) >= N as u64 {
                return None;
            }
            match self.reserved.compare_exchange_weak(
                pos,
                pos + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(Reservation { ring: self, pos }),
                Err(current) => pos = current,
            }
        }
    }
}

/// Exclusive write access to one slot until commit.
///
/// Dropping it without [`commit`](RecordSlot::commit) discards the slot.
pub struct Reservation<'a, const N: usize> {
    ring: &'a SlotRing<N>,
    pos: u64,
}

impl<const N: usize> Reservation<'_, N> {
    fn record(&mut self) -> &mut RawRecord {
        // The reservation counter handed `pos` to this reservation alone and
        // the consumer will not read the cell before it is published.
        unsafe { &mut *self.ring.cell(self.pos).record.get() }
    }

    fn publish(&self, state: u8) {
        self.ring.cell(self.pos).state.store(state, Ordering::Release);
    }
}

impl<const N: usize> RecordSlot for Reservation<'_, N> {
    fn write_ifindex(&mut self, ifindex: u32) {
        self.record().ifindex = ifindex;
    }

    fn write_family(&mut self, family: AddressFamily) {
        self.record().family = family as u32;
    }

    fn write_address(&mut self, addr: &[u8; ADDR_LEN]) {
        self.record().addr = *addr;
    }

    fn commit(self) {
        self.publish(COMMITTED);
        core::mem::forget(self);
    }
}

impl<const N: usize> Drop for Reservation<'_, N> {
    fn drop(&mut self) {
        self.publish(DISCARDED);
    }
}

/// The reading end of a [`SlotRing`].
pub struct Consumer<'a, const N: usize> {
    ring: &'a SlotRing<N>,
}

impl<const N: usize> Consumer<'_, N> {
    /// Next committed record in reservation order, as wire bytes.
    ///
    /// Returns `None` when the ring is empty or the oldest reservation has
    /// not been committed yet. Discarded slots are skipped.
    pub fn pop(&mut self) -> Option<[u8; RECORD_LEN]> {
        let ring = self.ring;
        // At most N discarded slots can be skipped before reaching the end.
        for _ in 0..=N {
            let pos = ring.consumed.load(Ordering::Relaxed);
            if pos == ring.reserved.load(Ordering::Acquire) {
                return None;
            }
            let cell = ring.cell(pos);
            let state = cell.state.load(Ordering::Acquire);
            let bytes = match state {
                PENDING => return None,
                COMMITTED => Some(unsafe { (*cell.record.get()).to_bytes() }),
                _ => None,
            };
            cell.state.store(PENDING, Ordering::Relaxed);
            ring.consumed.store(pos + 1, Ordering::Release);
            if bytes.is_some() {
                return bytes;
            }
        }
        None
    }
}

impl<const N: usize> Drop for Consumer<'_, N> {
    fn drop(&mut self) {
        self.ring.consumer_taken.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::{collections::BTreeSet, thread, vec::Vec};

    use super::*;
    use crate::{
        emit::emit,
        record::{ClassificationRecord, SourceAddress},
    };

    fn record(ifindex: u32, last: u8) -> ClassificationRecord {
        ClassificationRecord {
            ifindex,
            source: SourceAddress::V4([10, 1, 2, last]),
        }
    }

    fn decode(bytes: [u8; RECORD_LEN]) -> ClassificationRecord {
        ClassificationRecord::from_wire(&bytes).unwrap()
    }

    #[test]
    fn reserve_fails_when_full() {
        let ring = SlotRing::<2>::new();
        assert!(emit(&ring, &record(1, 1)).is_ok());
        assert!(emit(&ring, &record(1, 2)).is_ok());
        assert!(emit(&ring, &record(1, 3)).is_err());
        assert_eq!(ring.len(), 2);
    }

    #[test]
    fn consuming_frees_slots() {
        let ring = SlotRing::<2>::new();
        let mut consumer = ring.consumer().unwrap();
        for i in 0..10u8 {
            emit(&ring, &record(1, i)).unwrap();
            assert_eq!(consumer.pop().map(decode), Some(record(1, i)));
        }
        assert!(ring.is_empty());
    }

    #[test]
    fn uncommitted_reservation_blocks_later_commits() {
        let ring = SlotRing::<4>::new();
        let mut consumer = ring.consumer().unwrap();
        let mut first = ring.reserve().unwrap();
        first.write_ifindex(1);
        emit(&ring, &record(2, 2)).unwrap();

        // The second record is committed but sits behind an open reservation.
        assert_eq!(consumer.pop(), None);

        first.write_family(AddressFamily::Ipv4);
        first.write_address(&record(1, 1).source.padded());
        first.commit();
        assert_eq!(consumer.pop().map(decode), Some(record(1, 1)));
        assert_eq!(consumer.pop().map(decode), Some(record(2, 2)));
        assert_eq!(consumer.pop(), None);
    }

    #[test]
    fn dropped_reservation_is_never_visible() {
        let ring = SlotRing::<4>::new();
        let mut consumer = ring.consumer().unwrap();
        {
            let mut slot = ring.reserve().unwrap();
            slot.write_ifindex(99);
        }
        emit(&ring, &record(3, 3)).unwrap();
        assert_eq!(consumer.pop().map(decode), Some(record(3, 3)));
        assert_eq!(consumer.pop(), None);
        assert!(ring.is_empty());
    }

    #[test]
    fn single_consumer_handle() {
        let ring = SlotRing::<1>::new();
        let consumer = ring.consumer();
        assert!(consumer.is_some());
        assert!(ring.consumer().is_none());
        drop(consumer);
        assert!(ring.consumer().is_some());
    }

    #[test]
    fn zero_capacity_never_reserves() {
        let ring = SlotRing::<0>::new();
        assert!(ring.reserve().is_none());
    }

    #[test]
    fn concurrent_producers_never_tear_or_overfill() {
        const PRODUCERS: u32 = 4;
        const PER_PRODUCER: u8 = 200;
        let ring = SlotRing::<64>::new();

        let (emitted, received) = thread::scope(|s| {
            let producers: Vec<_> = (0..PRODUCERS)
                .map(|p| {
                    let ring = &ring;
                    s.spawn(move || {
                        let mut ok = Vec::new();
                        for i in 0..PER_PRODUCER {
                            // ifindex mirrors the address so a torn record is detectable.
                            let rec = ClassificationRecord {
                                ifindex: p * 1000 + i as u32,
                                source: SourceAddress::V4([p as u8, i, p as u8, i]),
                            };
                            if emit(ring, &rec).is_ok() {
                                ok.push(rec);
                            }
                        }
                        ok
                    })
                })
                .collect();

            let mut consumer = ring.consumer().unwrap();
            let mut received = Vec::new();
            while producers.iter().any(|h| !h.is_finished()) {
                received.extend(core::iter::from_fn(|| consumer.pop()).map(decode));
                assert!(ring.len() <= ring.capacity());
            }
            received.extend(core::iter::from_fn(|| consumer.pop()).map(decode));

            let emitted: Vec<_> = producers
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect();
            (emitted, received)
        });

        for rec in &received {
            let SourceAddress::V4([p, i, p2, i2]) = rec.source else {
                panic!("unexpected family");
            };
            assert_eq!((p, i), (p2, i2));
            assert_eq!(rec.ifindex, p as u32 * 1000 + i as u32);
        }
        let emitted: BTreeSet<_> = emitted.iter().map(|r| r.ifindex).collect();
        let received_set: BTreeSet<_> = received.iter().map(|r| r.ifindex).collect();
        assert_eq!(received.len(), received_set.len());
        assert_eq!(emitted, received_set);
    }
}
