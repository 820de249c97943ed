use std::fmt;
use std::ops;

/// Readiness / event-kind bitmask.
///
/// The low bits classify what *kind* of event this is (fd readiness, timer,
/// asynch work/cleanup, or recurrent); fd events may additionally carry
/// [`Interest::READ`], [`Interest::WRITE`] and [`Interest::EXCEPTION`] at the
/// same time. The bit values are part of this crate's wire/ABI contract with
/// existing callers and must not be renumbered.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Default)]
#[repr(transparent)]
pub struct Interest(u32);

impl Interest {
    pub const NONE: Interest = Interest(0x00);
    pub const READ: Interest = Interest(0x01);
    pub const WRITE: Interest = Interest(0x02);
    pub const EXCEPTION: Interest = Interest(0x04);
    pub const TIMER: Interest = Interest(0x08);
    pub const ASYNCH_WORK: Interest = Interest(0x10);
    pub const ASYNCH_CLEANUP: Interest = Interest(0x20);
    pub const ASYNCH: Interest = Interest(0x30);
    pub const RECURRENT: Interest = Interest(0x80);
    pub const EVIL_BRUTAL: Interest = Interest(0x100);
    pub const CANCEL_DEFERRED: Interest = Interest(0x200);
    pub const CANCEL_ASYNCH: Interest = Interest(0x400);
    pub const CANCEL: Interest = Interest(0x200 | 0x400);
    pub const CROSS_THREAD_TRIGGER: Interest = Interest(0x8000_0000);
    pub const RESERVED_MASK: Interest = Interest(0xfff0_0000);

    /// Build an `Interest` from a raw bit-set. No validation is performed;
    /// unrecognized bits are preserved (callers may stash private bits in
    /// the reserved range, as the source project does).
    #[inline]
    pub const fn from_bits(bits: u32) -> Interest {
        Interest(bits)
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn intersects(self, other: Interest) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub const fn is_fd(self) -> bool {
        self.intersects(Interest(
            Self::READ.0 | Self::WRITE.0 | Self::EXCEPTION.0,
        )) && !self.intersects(Interest(
            Self::TIMER.0 | Self::ASYNCH.0 | Self::RECURRENT.0,
        ))
    }

    #[inline]
    pub const fn is_timer(self) -> bool {
        self.contains(Self::TIMER)
    }

    #[inline]
    pub const fn is_asynch(self) -> bool {
        self.intersects(Self::ASYNCH)
    }

    #[inline]
    pub const fn is_recurrent(self) -> bool {
        self.contains(Self::RECURRENT)
    }
}

impl ops::BitOr for Interest {
    type Output = Interest;
    #[inline]
    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

impl ops::BitOrAssign for Interest {
    #[inline]
    fn bitor_assign(&mut self, rhs: Interest) {
        self.0 |= rhs.0;
    }
}

impl ops::BitAnd for Interest {
    type Output = Interest;
    #[inline]
    fn bitand(self, rhs: Interest) -> Interest {
        Interest(self.0 & rhs.0)
    }
}

impl ops::Not for Interest {
    type Output = Interest;
    #[inline]
    fn not(self) -> Interest {
        Interest(!self.0)
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut write_flag = |f: &mut fmt::Formatter<'_>, name: &str, bit: Interest| -> fmt::Result {
            if self.contains(bit) {
                if !first {
                    f.write_str(" | ")?;
                }
                f.write_str(name)?;
                first = false;
            }
            Ok(())
        };

        if self.is_empty() {
            return f.write_str("NONE");
        }

        write_flag(f, "READ", Self::READ)?;
        write_flag(f, "WRITE", Self::WRITE)?;
        write_flag(f, "EXCEPTION", Self::EXCEPTION)?;
        write_flag(f, "TIMER", Self::TIMER)?;
        write_flag(f, "ASYNCH_WORK", Self::ASYNCH_WORK)?;
        write_flag(f, "ASYNCH_CLEANUP", Self::ASYNCH_CLEANUP)?;
        write_flag(f, "RECURRENT", Self::RECURRENT)?;
        write_flag(f, "EVIL_BRUTAL", Self::EVIL_BRUTAL)?;
        write_flag(f, "CANCEL_DEFERRED", Self::CANCEL_DEFERRED)?;
        write_flag(f, "CANCEL_ASYNCH", Self::CANCEL_ASYNCH)?;
        write_flag(f, "CROSS_THREAD_TRIGGER", Self::CROSS_THREAD_TRIGGER)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_bit_values_match_the_wire_contract() {
        assert_eq!(Interest::READ.bits(), 0x01);
        assert_eq!(Interest::WRITE.bits(), 0x02);
        assert_eq!(Interest::EXCEPTION.bits(), 0x04);
        assert_eq!(Interest::TIMER.bits(), 0x08);
        assert_eq!(Interest::ASYNCH_WORK.bits(), 0x10);
        assert_eq!(Interest::ASYNCH_CLEANUP.bits(), 0x20);
        assert_eq!(Interest::ASYNCH.bits(), 0x30);
        assert_eq!(Interest::RECURRENT.bits(), 0x80);
        assert_eq!(Interest::EVIL_BRUTAL.bits(), 0x100);
        assert_eq!(Interest::CANCEL_DEFERRED.bits(), 0x200);
        assert_eq!(Interest::CANCEL_ASYNCH.bits(), 0x400);
        assert_eq!(Interest::CROSS_THREAD_TRIGGER.bits(), 0x8000_0000);
        assert_eq!(Interest::RESERVED_MASK.bits(), 0xfff0_0000);
    }

    #[test]
    fn fd_interests_combine() {
        let m = Interest::READ | Interest::WRITE;
        assert!(m.contains(Interest::READ));
        assert!(m.contains(Interest::WRITE));
        assert!(!m.contains(Interest::EXCEPTION));
        assert!(m.is_fd());
    }

    #[test]
    fn classification_bits_are_mutually_exclusive_by_convention() {
        assert!(Interest::TIMER.is_timer());
        assert!(!Interest::TIMER.is_fd());
        assert!(Interest::ASYNCH_WORK.is_asynch());
        assert!(Interest::RECURRENT.is_recurrent());
    }
}
