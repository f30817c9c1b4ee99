//! The packed reference count shared by every handle to one allocation.
//!
//! A single `AtomicU64` holds two 32-bit halves: the strong count in the high
//! half and the weak count in the low half. Every strong handle also owns one
//! weak unit, so cloning or dropping a strong handle moves both halves with a
//! single add of [`STRONG_INCR`]. Because the weak half never drops below the
//! strong half, the word as a whole reaches zero exactly when the last
//! reference of either kind is gone, and that one observation is enough to
//! decide that the memory can be freed.
//!
//! ```text
//!  63            32 31             0
//! +----------------+----------------+
//! |     strong     |      weak      |
//! +----------------+----------------+
//! ```
use crate::sync::{
    AtomicU64,
    Ordering::{AcqRel, Relaxed},
};

const WEAK_UNIT: u64 = 1;
const STRONG_UNIT: u64 = 1 << 32;

/// Set in the top bit of the strong half while `Shared::new_cyclic` is still
/// building the value. The strong count itself never gets this high.
const UNBORN: u64 = 1 << 63;

/// One strong handle: a strong unit plus the weak unit it carries.
pub(crate) const STRONG_INCR: u64 = STRONG_UNIT + WEAK_UNIT;

/// Largest value either half may reach. Half of the 32-bit range is kept as
/// headroom, so a racing increment can never carry into the other half before
/// the overflow is noticed.
pub const MAX_REFCOUNT: u32 = i32::MAX as u32;

#[inline]
fn strong(state: u64) -> u32 {
    ((state & !UNBORN) >> 32) as u32
}

#[inline]
fn weak(state: u64) -> u32 {
    state as u32
}

pub(crate) struct State(AtomicU64);

impl State {
    /// One strong handle and the weak unit it owns.
    pub(crate) fn new() -> Self {
        State(AtomicU64::new(STRONG_INCR))
    }

    /// No strong handle yet, one weak unit, and the unborn flag. Used while a
    /// value is still being built by `Shared::new_cyclic`.
    pub(crate) fn new_unborn() -> Self {
        State(AtomicU64::new(UNBORN | WEAK_UNIT))
    }

    pub(crate) fn strong_copy_increment(&self) {
        // Relaxed: a new reference can only be made from an existing one, so
        // whoever clones already has whatever synchronization it needs.
        let prev = self.0.fetch_add(STRONG_INCR, Relaxed);
        if weak(prev) >= MAX_REFCOUNT {
            self.0.fetch_sub(STRONG_INCR, Relaxed);
            overflow();
        }
    }

    /// Give up one strong handle.
    ///
    /// Returns `true` if this was the last strong handle. In that case only
    /// the strong unit has been removed: the caller still owns one weak unit,
    /// must destroy the value, and then call [`State::weak_release`]. Keeping
    /// the weak unit alive across the destructor stops a racing `Weak` drop
    /// from freeing the allocation underneath it.
    pub(crate) fn strong_release(&self) -> bool {
        // AcqRel: release publishes writes made through this handle; the
        // acquire half lets the thread that goes on to run the destructor
        // see writes made through every other, already dropped, handle.
        let prev = self.0.fetch_update(AcqRel, Relaxed, |cur| {
            debug_assert!(strong(cur) > 0, "strong release on a dead value");
            if strong(cur) == 1 {
                Some(cur - STRONG_UNIT)
            } else {
                Some(cur - STRONG_INCR)
            }
        });
        match prev {
            Ok(prev) | Err(prev) => strong(prev) == 1,
        }
    }

    pub(crate) fn weak_increment(&self) {
        let prev = self.0.fetch_add(WEAK_UNIT, Relaxed);
        if weak(prev) >= MAX_REFCOUNT {
            self.0.fetch_sub(WEAK_UNIT, Relaxed);
            overflow();
        }
    }

    /// Give up one weak unit. Returns `true` when no reference of either kind
    /// is left and the caller must free the allocation.
    ///
    /// Subtracting one from the combined word only touches the low half: the
    /// weak half is never zero while a weak unit is outstanding.
    pub(crate) fn weak_release(&self) -> bool {
        // AcqRel so that freeing happens-after the value destructor, which
        // released its guard unit with the same ordering.
        self.0.fetch_sub(WEAK_UNIT, AcqRel) & !UNBORN == WEAK_UNIT
    }

    /// Take a new strong handle if the value is still alive.
    ///
    /// Never retries once a zero strong count is seen, and a count seen at
    /// zero never rises again, so a dead value fails at once.
    pub(crate) fn try_promote(&self) -> bool {
        self.0
            .fetch_update(AcqRel, Relaxed, |cur| {
                if strong(cur) == 0 {
                    None
                } else if weak(cur) >= MAX_REFCOUNT {
                    overflow()
                } else {
                    Some(cur + STRONG_INCR)
                }
            })
            .is_ok()
    }

    /// Publish the first strong handle of a value built under
    /// [`State::new_unborn`]. The weak unit held during construction becomes
    /// the one that handle owns.
    pub(crate) fn revive(&self) {
        // Clears `UNBORN` and adds one strong unit in a single step. Concurrent
        // weak traffic only touches the low half.
        let prev = self.0.fetch_xor(UNBORN | STRONG_UNIT, AcqRel);
        debug_assert_eq!(strong(prev), 0, "No prior strong references should exist");
        debug_assert_ne!(prev & UNBORN, 0, "value was already born");
    }

    /// The value under construction will never exist. From here on the
    /// allocation counts as expired.
    pub(crate) fn abandon(&self) {
        self.0.fetch_and(!UNBORN, AcqRel);
    }

    /// No strong handle is left, or ever will be. A value still being built
    /// is not expired.
    pub(crate) fn is_expired(&self) -> bool {
        let cur = self.0.load(Relaxed);
        strong(cur) == 0 && cur & UNBORN == 0
    }

    pub(crate) fn peek_strong(&self) -> u32 {
        // relaxed ordering as this is only advisory
        strong(self.0.load(Relaxed))
    }

    /// Weak units not owned by a strong handle, from a single snapshot.
    pub(crate) fn peek_weak_handles(&self) -> u32 {
        let cur = self.0.load(Relaxed);
        weak(cur) - strong(cur)
    }

    #[cfg(all(test, not(loom)))]
    fn peek_weak(&self) -> u32 {
        weak(self.0.load(Relaxed))
    }
}

#[cold]
#[inline(never)]
fn overflow() -> ! {
    panic!("reference count overflow");
}
