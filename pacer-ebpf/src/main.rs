#![no_std]
#![no_main]

use aya_ebpf::{
    bindings::xdp_action,
    macros::{map, xdp},
    maps::{ring_buf::RingBufEntry, RingBuf},
    programs::XdpContext,
};
use core::ptr;
use pacer_common::{
    observe, AddressFamily, Frame, InsufficientData, RawRecord, RecordBuffer, RecordSlot,
    Verdict, ADDR_LEN, RING_BYTES,
};

#[no_mangle]
#[link_section = "license"]
pub static _license: [u8; 4] = *b"GPL\0";

#[map]
static PACKETS: RingBuf = RingBuf::with_byte_size(RING_BYTES, 0);

/// XDP entry point. Records the source address of IPv4/IPv6 frames and lets
/// every frame through.
#[xdp]
pub fn pacer(ctx: XdpContext) -> u32 {
    let ifindex = unsafe { (*ctx.ctx).ingress_ifindex };
    let frame = XdpFrame(&ctx);
    match observe(&frame, ifindex, &Records(&PACKETS)).verdict {
        Verdict::Pass => xdp_action::XDP_PASS,
    }
}

/// Packet bytes between `data` and `data_end`.
struct XdpFrame<'a>(&'a XdpContext);

impl Frame for XdpFrame<'_> {
    #[inline(always)]
    fn window<const N: usize>(&self, offset: usize) -> Result<&[u8; N], InsufficientData> {
        // The comparison against data_end must stay on packet pointers so the
        // verifier can track the range.
        let start = self.0.data() + offset;
        if start + N > self.0.data_end() {
            return Err(InsufficientData);
        }
        Ok(unsafe { &*(start as *const [u8; N]) })
    }
}

struct Records(&'static RingBuf);

impl RecordBuffer for Records {
    type Slot<'a>
        = RingSlot
    where
        Self: 'a;

    #[inline(always)]
    fn reserve(&self) -> Option<RingSlot> {
        self.0.reserve::<RawRecord>(0).map(RingSlot)
    }
}

/// Fields are written one by one: a whole-struct write lowers to a `memcpy`
/// call in `.text`, which the loader cannot relocate into the program section.
struct RingSlot(RingBufEntry<RawRecord>);

impl RecordSlot for RingSlot {
    #[inline(always)]
    fn write_ifindex(&mut self, ifindex: u32) {
        let p = self.0.as_mut_ptr();
        unsafe { ptr::write(ptr::addr_of_mut!((*p).ifindex), ifindex) };
    }

    #[inline(always)]
    fn write_family(&mut self, family: AddressFamily) {
        let p = self.0.as_mut_ptr();
        unsafe { ptr::write(ptr::addr_of_mut!((*p).family), family as u32) };
    }

    #[inline(always)]
    fn write_address(&mut self, addr: &[u8; ADDR_LEN]) {
        let p = self.0.as_mut_ptr();
        let hi = u64::from_ne_bytes([
            addr[0], addr[1], addr[2], addr[3], addr[4], addr[5], addr[6], addr[7],
        ]);
        let lo = u64::from_ne_bytes([
            addr[8], addr[9], addr[10], addr[11], addr[12], addr[13], addr[14], addr[15],
        ]);
        unsafe {
            let dst = ptr::addr_of_mut!((*p).addr) as *mut u64;
            ptr::write_unaligned(dst, hi);
            ptr::write_unaligned(dst.add(1), lo);
        }
    }

    #[inline(always)]
    fn commit(self) {
        self.0.submit(0);
    }
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
