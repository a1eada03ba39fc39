//! Bounded frame rings with an explicit slot state machine.
//!
//! Both pipeline rings (ingress: image frames, egress: result frames) are
//! instances of [`FrameRing`]. Every slot is in exactly one of four states:
//!
//! ```text
//! empty -> writing -> full -> reading -> empty
//!            |  (commit invalid)
//!            +-> empty
//! ```
//!
//! The state machine guarantees no concurrent access to any slot payload, so
//! payloads live in `UnsafeCell`s and are handed out as plain references
//! through RAII guards. A [`PutSlot`] is obtained from `acquire_put` and must
//! be committed (valid or invalid) exactly once; dropping it uncommitted
//! releases the slot as invalid. A [`GetSlot`] transitions the slot back to
//! `empty` on drop. Because the guards consume themselves, a mismatched
//! acquire/commit pair cannot be expressed in safe code.
//!
//! Two policies configure a ring:
//!
//! - `last_mode` — `acquire_get` returns the most recently committed slot
//!   instead of FIFO order, trading order for freshness. With overwrite
//!   disabled it also clears older full slots so they can be refilled.
//! - `allow_overwrite` — `acquire_put` may claim a full (not yet read) slot,
//!   dropping the frame it held. Each overwrite bumps the drop counter.
//!
//! All four operations are O(1) apart from the last-mode back-scan, take a
//! single lock, and never block.

// Slot payloads are handed out through raw pointers; exclusivity is
// guaranteed by the slot state machine below.
#![allow(unsafe_code)]

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{StereoError, StereoResult};

/// Slot occupancy state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SlotState {
    Empty,
    Writing,
    Full,
    Reading,
}

/// Index/state bookkeeping, guarded by a single mutex.
struct RingState {
    states: Vec<SlotState>,
    timestamps: Vec<u64>,
    write_index: usize,
    read_index: usize,
    put_active: bool,
    get_active: bool,
}

/// A bounded ring of reusable payload slots.
///
/// # Safety
///
/// Payloads are stored in `Box<UnsafeCell<T>>` so slot addresses stay stable.
/// A payload pointer is only handed out while its slot is in the `writing`
/// (mutable) or `reading` (shared) state, and each state admits exactly one
/// guard, so no two references to the same payload coexist.
pub struct FrameRing<T> {
    slots: Vec<Box<UnsafeCell<T>>>,
    state: Mutex<RingState>,
    last_mode: bool,
    allow_overwrite: bool,
    dropped: AtomicU64,
}

// SAFETY: payload access is serialized by the slot state machine; the state
// itself is behind a Mutex. T: Send allows payloads to cross threads.
unsafe impl<T: Send> Send for FrameRing<T> {}
unsafe impl<T: Send> Sync for FrameRing<T> {}

impl<T: Send + 'static> FrameRing<T> {
    /// Create a ring of `count` slots, each payload built by `factory`.
    ///
    /// # Panics
    /// Panics if `count` is 0.
    pub fn new<F>(last_mode: bool, allow_overwrite: bool, count: usize, factory: F) -> Arc<Self>
    where
        F: Fn() -> T,
    {
        assert!(count > 0, "ring must have at least one slot");

        Arc::new(Self {
            slots: (0..count).map(|_| Box::new(UnsafeCell::new(factory()))).collect(),
            state: Mutex::new(RingState {
                states: vec![SlotState::Empty; count],
                timestamps: vec![0; count],
                write_index: 0,
                read_index: 0,
                put_active: false,
                get_active: false,
            }),
            last_mode,
            allow_overwrite,
            dropped: AtomicU64::new(0),
        })
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Frames lost to overwriting since creation or the last `clear`.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Number of committed (full) slots.
    pub fn committed(&self) -> usize {
        let st = self.state.lock();
        st.states.iter().filter(|s| **s == SlotState::Full).count()
    }

    /// Reset every slot to empty. Fails while any guard is outstanding.
    pub fn clear(&self) -> StereoResult<()> {
        let mut st = self.state.lock();
        if st.put_active || st.get_active {
            return Err(StereoError::Protocol(
                "clear while a ring slot is checked out".to_string(),
            ));
        }
        for s in st.states.iter_mut() {
            *s = SlotState::Empty;
        }
        for t in st.timestamps.iter_mut() {
            *t = 0;
        }
        st.write_index = 0;
        st.read_index = 0;
        self.dropped.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Claim the next writable slot.
    ///
    /// Fails with `NoSlot` when the target slot is being read, or (without
    /// overwrite) when it is not empty. Overwriting a full slot counts the
    /// frame it held as dropped.
    pub fn acquire_put(self: &Arc<Self>, timestamp: u64) -> StereoResult<PutSlot<T>> {
        let mut st = self.state.lock();

        if st.put_active {
            return Err(StereoError::Protocol(
                "a put slot is already checked out".to_string(),
            ));
        }

        let idx = st.write_index;
        match st.states[idx] {
            SlotState::Reading | SlotState::Writing => return Err(StereoError::NoSlot),
            SlotState::Full => {
                if !self.allow_overwrite {
                    return Err(StereoError::NoSlot);
                }
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            SlotState::Empty => {}
        }

        st.states[idx] = SlotState::Writing;
        st.timestamps[idx] = timestamp;
        st.put_active = true;

        // SAFETY: slot idx just moved to Writing; only this guard may touch it.
        let ptr = self.slots[idx].get();

        Ok(PutSlot {
            ring: Arc::clone(self),
            idx,
            ptr,
            committed: false,
        })
    }

    /// Claim the next readable slot.
    ///
    /// In last-mode the most recently committed slot is returned and, when
    /// overwrite is disabled, older full slots are released so the producer
    /// can refill them. Fails with `NoData` when nothing is committed.
    pub fn acquire_get(self: &Arc<Self>) -> StereoResult<GetSlot<T>> {
        let mut st = self.state.lock();

        if st.get_active {
            return Err(StereoError::Protocol(
                "a get slot is already checked out".to_string(),
            ));
        }

        let idx = st.read_index;
        if st.states[idx] != SlotState::Full {
            return Err(StereoError::NoData);
        }

        st.states[idx] = SlotState::Reading;
        st.get_active = true;
        let timestamp = st.timestamps[idx];

        let count = self.slots.len();
        if self.last_mode {
            if !self.allow_overwrite {
                // Release every older committed slot behind the one we took.
                let mut i = (idx + count - 1) % count;
                while i != idx && st.states[i] == SlotState::Full {
                    st.states[i] = SlotState::Empty;
                    i = (i + count - 1) % count;
                }
            }
        } else {
            st.read_index = (idx + 1) % count;
        }

        // SAFETY: slot idx just moved to Reading; only this guard may touch it.
        let ptr = self.slots[idx].get();

        Ok(GetSlot {
            ring: Arc::clone(self),
            idx,
            ptr,
            timestamp,
        })
    }

    fn finish_put(&self, idx: usize, valid: bool) {
        let mut st = self.state.lock();
        debug_assert_eq!(st.states[idx], SlotState::Writing);

        if valid {
            st.states[idx] = SlotState::Full;
            if self.last_mode {
                st.read_index = idx;
            }
            st.write_index = (idx + 1) % self.slots.len();
        } else {
            st.states[idx] = SlotState::Empty;
        }
        st.put_active = false;
    }

    fn finish_get(&self, idx: usize) {
        let mut st = self.state.lock();
        debug_assert_eq!(st.states[idx], SlotState::Reading);
        st.states[idx] = SlotState::Empty;
        st.get_active = false;
    }
}

/// Writable claim on a ring slot (`writing` state).
///
/// Commit with [`PutSlot::commit`]; dropping the guard uncommitted releases
/// the slot as invalid.
pub struct PutSlot<T: Send + 'static> {
    ring: Arc<FrameRing<T>>,
    idx: usize,
    ptr: *mut T,
    committed: bool,
}

// SAFETY: the guard holds exclusive access to its slot via the state machine.
unsafe impl<T: Send + 'static> Send for PutSlot<T> {}

impl<T: Send + 'static> PutSlot<T> {
    /// Slot index (diagnostics only).
    pub fn index(&self) -> usize {
        self.idx
    }

    /// Commit the slot. `valid` publishes it to the reader side; `!valid`
    /// returns it to the empty pool.
    pub fn commit(mut self, valid: bool) {
        self.ring.finish_put(self.idx, valid);
        self.committed = true;
    }
}

impl<T: Send + 'static> Deref for PutSlot<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: exclusive access, see state machine invariant.
        unsafe { &*self.ptr }
    }
}

impl<T: Send + 'static> DerefMut for PutSlot<T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: exclusive access, see state machine invariant.
        unsafe { &mut *self.ptr }
    }
}

impl<T: Send + 'static> Drop for PutSlot<T> {
    fn drop(&mut self) {
        if !self.committed {
            self.ring.finish_put(self.idx, false);
        }
    }
}

/// Read claim on a ring slot (`reading` state). Releases on drop.
pub struct GetSlot<T: Send + 'static> {
    ring: Arc<FrameRing<T>>,
    idx: usize,
    ptr: *const T,
    timestamp: u64,
}

// SAFETY: the guard holds the only reference to its slot while it exists.
unsafe impl<T: Send + 'static> Send for GetSlot<T> {}

impl<T: Send + 'static> GetSlot<T> {
    /// Slot index (diagnostics only).
    pub fn index(&self) -> usize {
        self.idx
    }

    /// Timestamp recorded at `acquire_put`.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }
}

impl<T: Send + 'static> Deref for GetSlot<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: shared access while Reading; no writer can claim the slot.
        unsafe { &*self.ptr }
    }
}

impl<T: Send + 'static> Drop for GetSlot<T> {
    fn drop(&mut self) {
        self.ring.finish_get(self.idx);
    }
}
