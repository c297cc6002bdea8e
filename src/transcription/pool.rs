//! # Context Pool
//!
//! Fixed-capacity pool of loaded inference contexts, addressed by client handles.
//!
//! ## Handle Layout:
//! A handle packs a slot number and a generation counter into one integer:
//!
//! ```text
//!   raw = (generation << 16) | (slot_index + 1)
//! ```
//!
//! The first context placed in a slot has generation 0, so a fresh pool hands
//! out the plain handles `1..=N`. Every time a slot is reoccupied its generation
//! moves on, and handles issued for the previous occupant stop resolving. The
//! raw value `0` never names a slot.
//!
//! ## Slot Lifecycle:
//! Empty → Occupied (successful load) → Lent (job running) → Occupied (job joined)
//! → Empty (release). A lent slot still counts as occupied; its context lives on
//! the worker thread until the coordinator hands it back.

use crate::error::{AcquireError, DispatchError};
use serde::Serialize;
use std::fmt;

/// Largest supported capacity (slot numbers must fit in 16 bits).
pub const MAX_CAPACITY: usize = 0xFFFF;

const SLOT_BITS: u32 = 16;
const SLOT_MASK: u64 = (1 << SLOT_BITS) - 1;

/// Opaque client identifier for one pool slot occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ContextHandle(u64);

impl ContextHandle {
    /// The "no handle" sentinel.
    pub const NONE: ContextHandle = ContextHandle(0);

    fn new(slot_index: usize, generation: u32) -> Self {
        ContextHandle(((generation as u64) << SLOT_BITS) | (slot_index as u64 + 1))
    }

    pub fn from_raw(raw: u64) -> Self {
        ContextHandle(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn is_none(&self) -> bool {
        self.slot_index().is_none()
    }

    /// Zero-based slot index, or `None` for the sentinel.
    pub fn slot_index(&self) -> Option<usize> {
        match self.0 & SLOT_MASK {
            0 => None,
            slot => Some(slot as usize - 1),
        }
    }

    /// Generation tag, or `None` when the upper bits are wider than any
    /// generation the pool issues.
    pub fn generation(&self) -> Option<u32> {
        u32::try_from(self.0 >> SLOT_BITS).ok()
    }

    /// Slot index and generation, if this could be a handle the pool issued.
    fn parts(&self) -> Option<(usize, u32)> {
        Some((self.slot_index()?, self.generation()?))
    }
}

impl fmt::Display for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

enum Slot<C> {
    Empty { next_generation: u32 },
    Occupied { generation: u32, context: C },
    Lent { generation: u32 },
}

impl<C> Slot<C> {
    fn generation(&self) -> Option<u32> {
        match self {
            Slot::Empty { .. } => None,
            Slot::Occupied { generation, .. } | Slot::Lent { generation } => Some(*generation),
        }
    }
}

/// Owner of every live context.
///
/// The pool knows nothing about threads. Callers are responsible for joining any
/// running job before they call a mutating method; the context a job works on
/// is taken out with [`ContextPool::lend`] and put back with
/// [`ContextPool::restore`].
pub struct ContextPool<C> {
    slots: Vec<Slot<C>>,
}

impl<C> ContextPool<C> {
    /// Create a pool with `capacity` empty slots (clamped to [`MAX_CAPACITY`]).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.min(MAX_CAPACITY);
        let slots = (0..capacity).map(|_| Slot::Empty { next_generation: 0 }).collect();
        Self { slots }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots that own a context, lent or not.
    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|slot| slot.generation().is_some()).count()
    }

    /// Handles of every occupied slot, in slot order.
    pub fn handles(&self) -> Vec<ContextHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.generation().map(|generation| ContextHandle::new(index, generation)))
            .collect()
    }

    /// Place a new context in the first empty slot.
    ///
    /// `load` is only called when a slot is free; when it fails the slot stays
    /// empty and keeps its generation.
    pub fn acquire_with<F>(&mut self, load: F) -> Result<ContextHandle, AcquireError>
    where
        F: FnOnce() -> anyhow::Result<C>,
    {
        let (index, generation) = self
            .slots
            .iter()
            .enumerate()
            .find_map(|(index, slot)| match slot {
                Slot::Empty { next_generation } => Some((index, *next_generation)),
                _ => None,
            })
            .ok_or(AcquireError::PoolFull)?;

        let context = load().map_err(|e| AcquireError::LoadFailed(format!("{:#}", e)))?;
        self.slots[index] = Slot::Occupied { generation, context };

        Ok(ContextHandle::new(index, generation))
    }

    /// Check that `handle` addresses the slot's current occupant.
    fn locate(&self, handle: ContextHandle) -> Result<(usize, u32), DispatchError> {
        let (index, wanted) = handle
            .parts()
            .filter(|(index, _)| *index < self.slots.len())
            .ok_or(DispatchError::OutOfRange)?;

        match self.slots[index].generation() {
            Some(generation) if generation == wanted => Ok((index, generation)),
            _ => Err(DispatchError::NoContext),
        }
    }

    /// Borrow the context behind `handle`.
    pub fn resolve(&self, handle: ContextHandle) -> Result<&C, DispatchError> {
        let (index, _) = self.locate(handle)?;
        match &self.slots[index] {
            Slot::Occupied { context, .. } => Ok(context),
            _ => Err(DispatchError::NoContext),
        }
    }

    /// Take the context out of its slot for the duration of a job.
    pub fn lend(&mut self, handle: ContextHandle) -> Result<C, DispatchError> {
        let (index, generation) = self.locate(handle)?;
        match std::mem::replace(&mut self.slots[index], Slot::Lent { generation }) {
            Slot::Occupied { context, .. } => Ok(context),
            previous => {
                self.slots[index] = previous;
                Err(DispatchError::NoContext)
            }
        }
    }

    /// Return a lent context.
    ///
    /// If the slot no longer waits for this context (it was released or forfeited
    /// meanwhile) the context is handed back to the caller to be dropped.
    pub fn restore(&mut self, handle: ContextHandle, context: C) -> Option<C> {
        let Some((index, wanted)) = handle.parts().filter(|(index, _)| *index < self.slots.len()) else {
            return Some(context);
        };

        match self.slots[index] {
            Slot::Lent { generation } if generation == wanted => {
                self.slots[index] = Slot::Occupied { generation, context };
                None
            }
            _ => Some(context),
        }
    }

    /// Give up on a lent context that will never come back.
    pub fn forfeit(&mut self, handle: ContextHandle) {
        if let Some((index, wanted)) = handle.parts().filter(|(index, _)| *index < self.slots.len()) {
            if let Slot::Lent { generation } = self.slots[index] {
                if generation == wanted {
                    self.slots[index] = Slot::Empty { next_generation: generation.wrapping_add(1) };
                }
            }
        }
    }

    /// Empty the slot behind `handle` and return its context.
    ///
    /// Out-of-range, empty and stale handles are ignored.
    pub fn release(&mut self, handle: ContextHandle) -> Option<C> {
        let (index, generation) = self.locate(handle).ok()?;
        match std::mem::replace(&mut self.slots[index], Slot::Empty { next_generation: generation.wrapping_add(1) }) {
            Slot::Occupied { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Empty every slot and return the contexts that were still held.
    pub fn drain(&mut self) -> Vec<C> {
        let mut contexts = Vec::new();
        for slot in self.slots.iter_mut() {
            if let Some(generation) = slot.generation() {
                let previous = std::mem::replace(slot, Slot::Empty { next_generation: generation.wrapping_add(1) });
                if let Slot::Occupied { context, .. } = previous {
                    contexts.push(context);
                }
            }
        }
        contexts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    fn loaded(name: &str) -> impl FnOnce() -> anyhow::Result<String> + '_ {
        move || Ok(name.to_string())
    }

    #[test]
    fn test_handle_layout() {
        let first = ContextHandle::new(0, 0);
        assert_eq!(first.raw(), 1);
        assert_eq!(first.slot_index(), Some(0));

        let reused = ContextHandle::new(0, 1);
        assert_eq!(reused.raw(), 65537);
        assert_eq!(reused.generation(), Some(1));
        assert_eq!(reused.slot_index(), Some(0));

        assert!(ContextHandle::NONE.is_none());
        assert!(ContextHandle::from_raw(1 << 16).is_none());
    }

    #[test]
    fn test_acquire_fills_slots_in_order() {
        let mut pool = ContextPool::new(4);
        let handles: Vec<_> = (0..4).map(|_| pool.acquire_with(loaded("ctx")).unwrap()).collect();

        assert_eq!(handles.iter().map(|h| h.raw()).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        assert_eq!(pool.occupied(), 4);
        assert_eq!(pool.acquire_with(loaded("ctx")), Err(AcquireError::PoolFull));
    }

    #[test]
    fn test_full_pool_does_not_call_loader() {
        let mut pool = ContextPool::new(1);
        pool.acquire_with(loaded("a")).unwrap();

        let mut called = false;
        let result = pool.acquire_with(|| {
            called = true;
            Ok("b".to_string())
        });
        assert_eq!(result, Err(AcquireError::PoolFull));
        assert!(!called);
    }

    #[test]
    fn test_failed_load_leaves_slot_empty() {
        let mut pool: ContextPool<String> = ContextPool::new(2);
        let result = pool.acquire_with(|| Err(anyhow!("no such file")));

        assert!(matches!(result, Err(AcquireError::LoadFailed(msg)) if msg.contains("no such file")));
        assert_eq!(pool.occupied(), 0);
        assert_eq!(pool.acquire_with(loaded("a")).unwrap().raw(), 1);
    }

    #[test]
    fn test_resolve_reports_range_and_emptiness() {
        let mut pool = ContextPool::new(2);
        let handle = pool.acquire_with(loaded("a")).unwrap();

        assert_eq!(pool.resolve(handle).unwrap(), "a");
        assert_eq!(pool.resolve(ContextHandle::NONE).unwrap_err(), DispatchError::OutOfRange);
        assert_eq!(pool.resolve(ContextHandle::from_raw(3)).unwrap_err(), DispatchError::OutOfRange);
        assert_eq!(pool.resolve(ContextHandle::from_raw(2)).unwrap_err(), DispatchError::NoContext);
    }

    #[test]
    fn test_release_empties_slot_and_ignores_bad_handles() {
        let mut pool = ContextPool::new(2);
        let handle = pool.acquire_with(loaded("a")).unwrap();

        assert_eq!(pool.release(ContextHandle::NONE), None);
        assert_eq!(pool.release(ContextHandle::from_raw(99)), None);
        assert_eq!(pool.release(handle).as_deref(), Some("a"));
        assert_eq!(pool.occupied(), 0);
        assert_eq!(pool.release(handle), None);
    }

    #[test]
    fn test_stale_handle_is_detected_after_reuse() {
        let mut pool = ContextPool::new(1);
        let old = pool.acquire_with(loaded("old")).unwrap();
        pool.release(old);
        let new = pool.acquire_with(loaded("new")).unwrap();

        assert_ne!(old, new);
        assert_eq!(old.slot_index(), new.slot_index());
        assert_eq!(pool.resolve(old).unwrap_err(), DispatchError::NoContext);
        assert_eq!(pool.release(old), None);
        assert_eq!(pool.resolve(new).unwrap(), "new");
    }

    #[test]
    fn test_oversized_generation_never_matches() {
        let mut pool = ContextPool::new(2);
        let handle = pool.acquire_with(loaded("a")).unwrap();

        // Same slot bits and truncated generation as `handle`, but bits above 48 set
        let forged = ContextHandle::from_raw((1 << 48) | handle.raw());
        assert_eq!(forged.slot_index(), Some(0));
        assert_eq!(forged.generation(), None);

        assert_eq!(pool.resolve(forged).unwrap_err(), DispatchError::OutOfRange);
        assert_eq!(pool.lend(forged).unwrap_err(), DispatchError::OutOfRange);
        assert_eq!(pool.release(forged), None);
        assert_eq!(pool.resolve(handle).unwrap(), "a");

        let context = pool.lend(handle).unwrap();
        pool.forfeit(forged);
        assert_eq!(pool.occupied(), 1);
        assert_eq!(pool.restore(forged, context).as_deref(), Some("a"));
    }

    #[test]
    fn test_lend_and_restore() {
        let mut pool = ContextPool::new(2);
        let handle = pool.acquire_with(loaded("a")).unwrap();

        let context = pool.lend(handle).unwrap();
        assert_eq!(pool.occupied(), 1);
        assert_eq!(pool.handles(), vec![handle]);
        assert_eq!(pool.resolve(handle).unwrap_err(), DispatchError::NoContext);

        // The lent slot is not free for acquire.
        let other = pool.acquire_with(loaded("b")).unwrap();
        assert_eq!(other.slot_index(), Some(1));

        assert_eq!(pool.restore(handle, context), None);
        assert_eq!(pool.resolve(handle).unwrap(), "a");
    }

    #[test]
    fn test_forfeit_frees_lent_slot() {
        let mut pool = ContextPool::new(1);
        let handle = pool.acquire_with(loaded("a")).unwrap();
        let context = pool.lend(handle).unwrap();

        pool.forfeit(handle);
        assert_eq!(pool.occupied(), 0);
        assert_eq!(pool.restore(handle, context).as_deref(), Some("a"));
    }

    #[test]
    fn test_drain_returns_held_contexts() {
        let mut pool = ContextPool::new(3);
        let a = pool.acquire_with(loaded("a")).unwrap();
        pool.acquire_with(loaded("b")).unwrap();
        let _lent = pool.lend(a).unwrap();

        let drained = pool.drain();
        assert_eq!(drained, vec!["b".to_string()]);
        assert_eq!(pool.occupied(), 0);
    }

    #[test]
    fn test_occupancy_never_exceeds_capacity() {
        let mut pool = ContextPool::new(3);
        let mut live = Vec::new();

        for step in 0..30 {
            if step % 4 == 3 {
                if let Some(handle) = live.pop() {
                    assert!(pool.release(handle).is_some());
                }
            } else {
                let was_full = pool.occupied() == pool.capacity();
                match pool.acquire_with(loaded("ctx")) {
                    Ok(handle) => {
                        assert!(!was_full);
                        assert!(!live.contains(&handle));
                        live.push(handle);
                    }
                    Err(err) => {
                        assert!(was_full);
                        assert_eq!(err, AcquireError::PoolFull);
                    }
                }
            }
            assert!(pool.occupied() <= pool.capacity());
            assert_eq!(pool.occupied(), live.len());
        }
    }
}
