//! Bounds-checked access to frame bytes.
//!
//! Every header decoder goes through [`Frame::window`]. It is the only place
//! where frame memory is turned into a readable view, so the in-bounds
//! invariant can be audited here and nowhere else.

/// The requested window extends past the end of the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsufficientData;

/// A received frame, borrowed for the duration of one invocation.
pub trait Frame {
    /// Returns the `N` bytes starting at `offset`, or [`InsufficientData`] if
    /// `offset + N` is past the end of the frame.
    ///
    /// Each call validates independently; implementations must not cache a
    /// previously validated range.
    fn window<const N: usize>(&self, offset: usize) -> Result<&[u8; N], InsufficientData>;
}

impl Frame for [u8] {
    #[inline(always)]
    fn window<const N: usize>(&self, offset: usize) -> Result<&[u8; N], InsufficientData> {
        let end = offset.checked_add(N).ok_or(InsufficientData)?;
        self.get(offset..end)
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or(InsufficientData)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_inside_frame() {
        let frame = [1u8, 2, 3, 4, 5];
        assert_eq!(frame[..].window::<2>(1), Ok(&[2, 3]));
        assert_eq!(frame[..].window::<5>(0), Ok(&frame));
    }

    #[test]
    fn window_touching_end_is_valid() {
        let frame = [0u8; 14];
        assert!(frame[..].window::<4>(10).is_ok());
        assert_eq!(frame[..].window::<4>(11), Err(InsufficientData));
    }

    #[test]
    fn empty_frame_rejects_everything_but_zero_length() {
        let frame: [u8; 0] = [];
        assert_eq!(frame[..].window::<1>(0), Err(InsufficientData));
        assert!(frame[..].window::<0>(0).is_ok());
    }

    #[test]
    fn offset_overflow_is_insufficient_data() {
        let frame = [0u8; 8];
        assert_eq!(frame[..].window::<2>(usize::MAX), Err(InsufficientData));
    }
}
