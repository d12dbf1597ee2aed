//! # Flagmarks
//!
//! A flagmark is a 32-bit set of per-subject flags. The low five bits are
//! reserved for the engine, bits 5 to 30 are free for user code, and bit 31
//! is unused (ignored when records are loaded).
//!
//! | Bit | Flag |
//! |----:|------|
//! | 0 | `STALE` |
//! | 1 | `BOOTED` |
//! | 2 | `ONLINE` |
//! | 3 | `EDITOR` |
//! | 4 | `DEFERRED_DESPAWN` |
//! | 5..=30 | `A` ... `Z` |
//!
//! Live flagmarks are stored in an [`AtomicFlagmark`]; every mutation is a
//! single atomic read-modify-write so concurrent workers may flip flags on
//! the same subject.

use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::engine::error::{ApparatusError, ApparatusResult};


/// Set of subject flags.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Flagmark(pub u32);

impl Flagmark {
    /// No flags.
    pub const NONE: Flagmark = Flagmark(0);
    /// Row kept in place after its subject left it.
    pub const STALE: Flagmark = Flagmark(1 << 0);
    /// Subject finished booting.
    pub const BOOTED: Flagmark = Flagmark(1 << 1);
    /// Subject is online.
    pub const ONLINE: Flagmark = Flagmark(1 << 2);
    /// Subject belongs to editor tooling.
    pub const EDITOR: Flagmark = Flagmark(1 << 3);
    /// Subject is queued for despawn.
    pub const DEFERRED_DESPAWN: Flagmark = Flagmark(1 << 4);

    /// Index of the first user flag.
    pub const FIRST_USER_BIT: u32 = 5;
    /// Index of the last user flag.
    pub const LAST_USER_BIT: u32 = 30;

    /// Every engine-reserved flag.
    pub const ALL_SYSTEM_LEVEL: Flagmark = Flagmark(0b1_1111);
    /// Every user flag, `A` through `Z`.
    pub const ALL_USER_LEVEL: Flagmark = Flagmark(((1u32 << 26) - 1) << 5);
    /// Flags that only the engine may change.
    pub const PROTECTED: Flagmark = Flagmark(Self::STALE.0 | Self::DEFERRED_DESPAWN.0);
    /// Flags user code may change.
    pub const USER_SETTABLE: Flagmark = Flagmark(!Self::PROTECTED.0 & Self::KNOWN.0);
    /// Every defined flag.
    pub const KNOWN: Flagmark = Flagmark(Self::ALL_SYSTEM_LEVEL.0 | Self::ALL_USER_LEVEL.0);
    /// Flags a chain never visits.
    pub const ITERATION_EXCLUDED: Flagmark = Flagmark(Self::STALE.0 | Self::DEFERRED_DESPAWN.0);

    /// User flag `A`.
    pub const A: Flagmark = Flagmark::user(0);
    /// User flag `B`.
    pub const B: Flagmark = Flagmark::user(1);
    /// User flag `C`.
    pub const C: Flagmark = Flagmark::user(2);
    /// User flag `D`.
    pub const D: Flagmark = Flagmark::user(3);
    /// User flag `E`.
    pub const E: Flagmark = Flagmark::user(4);
    /// User flag `F`.
    pub const F: Flagmark = Flagmark::user(5);
    /// User flag `G`.
    pub const G: Flagmark = Flagmark::user(6);
    /// User flag `H`.
    pub const H: Flagmark = Flagmark::user(7);
    /// User flag `Z`.
    pub const Z: Flagmark = Flagmark::user(25);

    /// User flag number `n` (0 for `A`, 25 for `Z`).
    #[inline]
    pub const fn user(n: u32) -> Flagmark {
        Flagmark(1 << (Self::FIRST_USER_BIT + n))
    }

    /// Flag at raw bit index `bit`.
    #[inline]
    pub const fn bit(bit: u32) -> Flagmark {
        Flagmark(1 << bit)
    }

    /// Raw bits.
    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// `true` if every flag in `other` is set.
    #[inline]
    pub const fn contains(self, other: Flagmark) -> bool {
        self.0 & other.0 == other.0
    }

    /// `true` if any flag in `other` is set.
    #[inline]
    pub const fn intersects(self, other: Flagmark) -> bool {
        self.0 & other.0 != 0
    }

    /// `true` if no flag is set.
    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Drops bits that are not defined flags.
    #[inline]
    pub const fn known_only(self) -> Flagmark {
        Flagmark(self.0 & Self::KNOWN.0)
    }

    /// Fails with `NoPermission` if any protected flag is set.
    pub fn ensure_user_settable(self) -> ApparatusResult<()> {
        if self.intersects(Self::PROTECTED) || !Self::KNOWN.contains(self) {
            return Err(ApparatusError::NoPermission(format!(
                "flags {self:?} are reserved for the engine"
            )));
        }
        Ok(())
    }
}

impl BitOr for Flagmark {
    type Output = Flagmark;
    fn bitor(self, rhs: Flagmark) -> Flagmark {
        Flagmark(self.0 | rhs.0)
    }
}

impl BitOrAssign for Flagmark {
    fn bitor_assign(&mut self, rhs: Flagmark) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Flagmark {
    type Output = Flagmark;
    fn bitand(self, rhs: Flagmark) -> Flagmark {
        Flagmark(self.0 & rhs.0)
    }
}

impl BitAndAssign for Flagmark {
    fn bitand_assign(&mut self, rhs: Flagmark) {
        self.0 &= rhs.0;
    }
}

impl Not for Flagmark {
    type Output = Flagmark;
    fn not(self) -> Flagmark {
        Flagmark(!self.0)
    }
}

impl fmt::Debug for Flagmark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [&str; 5] = ["Stale", "Booted", "Online", "Editor", "DeferredDespawn"];
        let mut set = f.debug_set();
        for bit in 0..32u32 {
            if self.0 & (1 << bit) == 0 {
                continue;
            }
            match bit {
                0..=4 => set.entry(&NAMES[bit as usize]),
                5..=30 => set.entry(&((b'A' + (bit - 5) as u8) as char)),
                _ => set.entry(&bit),
            };
        }
        set.finish()
    }
}


/// Atomic flagmark cell.
///
/// Every method is a single atomic operation; methods that change the value
/// return what was there before.
#[derive(Default)]
pub struct AtomicFlagmark(AtomicU32);

impl AtomicFlagmark {
    /// Creates a cell holding `flagmark`.
    #[inline]
    pub const fn new(flagmark: Flagmark) -> Self {
        Self(AtomicU32::new(flagmark.0))
    }

    /// Current value.
    #[inline]
    pub fn get(&self) -> Flagmark {
        Flagmark(self.0.load(Ordering::Acquire))
    }

    /// Overwrites the whole value; returns the previous one.
    #[inline]
    pub fn set(&self, flagmark: Flagmark) -> Flagmark {
        Flagmark(self.0.swap(flagmark.0, Ordering::AcqRel))
    }

    /// Overwrites only the bits in `mask`; returns the previous value.
    #[inline]
    pub fn set_masked(&self, flagmark: Flagmark, mask: Flagmark) -> Flagmark {
        let previous = self.0.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            Some((current & !mask.0) | (flagmark.0 & mask.0))
        });
        Flagmark(previous.unwrap_or_else(|current| current))
    }

    /// `true` if every flag in `flag` is set.
    #[inline]
    pub fn has(&self, flag: Flagmark) -> bool {
        self.get().contains(flag)
    }

    /// Sets or clears `flag`; returns whether it was set before.
    #[inline]
    pub fn set_flag(&self, flag: Flagmark, state: bool) -> bool {
        let previous = if state {
            self.0.fetch_or(flag.0, Ordering::AcqRel)
        } else {
            self.0.fetch_and(!flag.0, Ordering::AcqRel)
        };
        previous & flag.0 == flag.0
    }

    /// Flips `flag`; returns whether it was set before.
    #[inline]
    pub fn toggle_flag(&self, flag: Flagmark) -> bool {
        let previous = self.0.fetch_xor(flag.0, Ordering::AcqRel);
        previous & flag.0 == flag.0
    }
}

impl fmt::Debug for AtomicFlagmark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.get().fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_matches_reserved_bits() {
        assert_eq!(Flagmark::BOOTED.bits(), 0x2);
        assert_eq!(Flagmark::DEFERRED_DESPAWN.bits(), 0x10);
        assert_eq!(Flagmark::A.bits(), 1 << 5);
        assert_eq!(Flagmark::Z.bits(), 1 << 30);
        assert!(!Flagmark::KNOWN.contains(Flagmark::bit(31)));
        assert!(!Flagmark::ALL_SYSTEM_LEVEL.intersects(Flagmark::ALL_USER_LEVEL));
    }

    #[test]
    fn protected_flags_are_rejected() {
        assert!(Flagmark::BOOTED.ensure_user_settable().is_ok());
        assert!((Flagmark::A | Flagmark::ONLINE).ensure_user_settable().is_ok());
        assert!(Flagmark::DEFERRED_DESPAWN.ensure_user_settable().is_err());
        assert!(Flagmark::STALE.ensure_user_settable().is_err());
    }

    #[test]
    fn atomic_operations_return_previous_state() {
        let cell = AtomicFlagmark::new(Flagmark::BOOTED);
        assert!(!cell.set_flag(Flagmark::A, true));
        assert!(cell.set_flag(Flagmark::A, true));
        assert!(cell.toggle_flag(Flagmark::A));
        assert!(!cell.has(Flagmark::A));
        let previous = cell.set_masked(Flagmark::ONLINE, Flagmark::ONLINE | Flagmark::BOOTED);
        assert_eq!(previous, Flagmark::BOOTED);
        assert_eq!(cell.get(), Flagmark::ONLINE);
    }
}
