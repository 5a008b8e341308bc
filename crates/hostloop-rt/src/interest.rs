//! Readiness mask for registered descriptors.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Which I/O conditions should trigger a descriptor's callback.
///
/// Combine with `|`:
///
/// ```
/// use hostloop_rt::Interest;
///
/// let both = Interest::READABLE | Interest::WRITABLE;
/// assert!(both.is_readable() && both.is_writable());
/// ```
///
/// Error and hang-up conditions are always reported by the OS, so a
/// registration with only [`Interest::ERROR`] still fires when the descriptor
/// fails.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READABLE: Interest = Interest(0b001);
    pub const WRITABLE: Interest = Interest(0b010);
    pub const ERROR: Interest = Interest(0b100);

    /// Build a mask from raw bits. Unknown bits are dropped.
    pub const fn from_bits(bits: u8) -> Interest {
        Interest(bits & 0b111)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    pub const fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    pub const fn is_error(self) -> bool {
        self.0 & Self::ERROR.0 != 0
    }

    pub const fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }

    /// The `polling` interest for this mask, keyed by `key`.
    pub(crate) fn to_event(self, key: usize) -> polling::Event {
        polling::Event::new(key, self.is_readable(), self.is_writable())
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

impl BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Interest) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.is_readable() {
            names.push("READABLE");
        }
        if self.is_writable() {
            names.push("WRITABLE");
        }
        if self.is_error() {
            names.push("ERROR");
        }
        if names.is_empty() {
            f.write_str("NONE")
        } else {
            f.write_str(&names.join(" | "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_and_query() {
        let mask = Interest::READABLE | Interest::ERROR;
        assert!(mask.is_readable());
        assert!(!mask.is_writable());
        assert!(mask.is_error());
        assert!(mask.contains(Interest::ERROR));
        assert!(!mask.contains(Interest::WRITABLE));
    }

    #[test]
    fn from_bits_drops_unknown_bits() {
        assert_eq!(Interest::from_bits(0xff).bits(), 0b111);
        assert_eq!(Interest::from_bits(0), Interest::NONE);
    }

    #[test]
    fn debug_lists_flags() {
        assert_eq!(format!("{:?}", Interest::NONE), "NONE");
        assert_eq!(
            format!("{:?}", Interest::READABLE | Interest::WRITABLE),
            "READABLE | WRITABLE"
        );
    }

    #[test]
    fn error_only_maps_to_empty_poll_interest() {
        let ev = Interest::ERROR.to_event(7);
        assert_eq!(ev.key, 7);
        assert!(!ev.readable);
        assert!(!ev.writable);
    }
}
