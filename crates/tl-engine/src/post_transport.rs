//! Post-transport work flags
//!
//! The process thread ORs bits in as it makes transport decisions; whoever
//! performs the deferred work (process thread or butler) clears exactly the
//! bits it satisfied. Neither side ever does a plain read-modify-write store,
//! so a bit set by a later cycle cannot be lost by an earlier clear.

use std::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

bitflags! {
    /// Pending deferred actions
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PostTransportWork: u32 {
        const STOP = 0x1;
        const LOCATE = 0x2;
        const ABORT = 0x8;
        const OVERWRITE = 0x10;
        const AUDITION = 0x20;
        const REVERSE = 0x40;
        const CLEAR_SUBSTATE = 0x80;
        const ADJUST_PLAYBACK_BUFFERING = 0x100;
        const ADJUST_CAPTURE_BUFFERING = 0x200;
        const LOOP_CHANGED = 0x400;
    }
}

impl PostTransportWork {
    /// Bits that block further transport motion until the butler is done
    pub const BLOCKS_PROCESS: Self = Self::LOCATE.union(Self::STOP).union(Self::AUDITION);
}

/// `PostTransportWork` in an atomic cell
#[derive(Debug, Default)]
pub struct AtomicPostTransportWork(AtomicU32);

impl AtomicPostTransportWork {
    pub fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    #[inline]
    pub fn load(&self) -> PostTransportWork {
        PostTransportWork::from_bits_truncate(self.0.load(Ordering::Acquire))
    }

    /// OR `bits` in; returns the set before the call
    #[inline]
    pub fn add(&self, bits: PostTransportWork) -> PostTransportWork {
        PostTransportWork::from_bits_truncate(self.0.fetch_or(bits.bits(), Ordering::AcqRel))
    }

    /// Clear `bits`; returns the set before the call
    #[inline]
    pub fn clear(&self, bits: PostTransportWork) -> PostTransportWork {
        PostTransportWork::from_bits_truncate(self.0.fetch_and(!bits.bits(), Ordering::AcqRel))
    }

    /// Drop everything (engine halt)
    #[inline]
    pub fn clear_all(&self) -> PostTransportWork {
        PostTransportWork::from_bits_truncate(self.0.swap(0, Ordering::AcqRel))
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.load(Ordering::Acquire) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_flag_values() {
        assert_eq!(PostTransportWork::STOP.bits(), 0x1);
        assert_eq!(PostTransportWork::LOCATE.bits(), 0x2);
        assert_eq!(PostTransportWork::LOOP_CHANGED.bits(), 0x400);
    }

    #[test]
    fn test_take_leaves_empty_set() {
        let mut work = PostTransportWork::LOCATE | PostTransportWork::REVERSE;
        let taken = std::mem::take(&mut work);
        assert_eq!(taken, PostTransportWork::LOCATE | PostTransportWork::REVERSE);
        assert!(work.is_empty());
        assert_eq!(PostTransportWork::default(), PostTransportWork::empty());
    }

    #[test]
    fn test_clear_leaves_other_bits() {
        let ptw = AtomicPostTransportWork::new();
        ptw.add(PostTransportWork::STOP | PostTransportWork::LOCATE);
        ptw.add(PostTransportWork::LOOP_CHANGED);

        let before = ptw.clear(PostTransportWork::STOP);
        assert!(before.contains(PostTransportWork::STOP));
        assert_eq!(
            ptw.load(),
            PostTransportWork::LOCATE | PostTransportWork::LOOP_CHANGED
        );
    }

    #[test]
    fn test_concurrent_set_and_clear_never_loses_bits() {
        let ptw = Arc::new(AtomicPostTransportWork::new());
        let setter = {
            let ptw = Arc::clone(&ptw);
            thread::spawn(move || {
                for _ in 0..10_000 {
                    ptw.add(PostTransportWork::OVERWRITE);
                }
            })
        };
        for _ in 0..10_000 {
            ptw.clear(PostTransportWork::STOP);
        }
        setter.join().unwrap();

        assert!(ptw.load().contains(PostTransportWork::OVERWRITE));
    }
}
