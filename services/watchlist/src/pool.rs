//! Item stream pool and stream-id allocation
//!
//! Item streams are recycled: a released stream is reset and kept as a spare
//! for the next acquire. The pool starts with `initial_size` slots and
//! doubles up to `max_streams`; growth failure is reported, never fatal.
//!
//! Consumer stream ids count up from [`FIRST_ITEM_STREAM_ID`] and skip ids
//! still in use after wrapping. Provider-driven ids come from a separate
//! counter ([`ProviderIdAllocator`]) that counts down from -1.

use std::collections::BTreeMap;

use feed_types::ids::{StreamId, FIRST_ITEM_STREAM_ID};
use tracing::{debug, info, warn};

use crate::arena::{Arena, Handle};
use crate::error::PoolError;

/// Objects the pool can recycle.
pub trait Poolable: Default {
    /// Drop every reference the object holds so it can be reused.
    fn reset(&mut self);
}

/// Pool of item streams addressed by handle or by wire stream id.
#[derive(Debug)]
pub struct StreamPool<T> {
    streams: Arena<T>,
    /// Wire stream id -> live handle
    by_id: BTreeMap<StreamId, Handle>,
    /// Reset objects waiting to be reused
    spares: Vec<T>,
    capacity: usize,
    max_streams: usize,
    next_id: StreamId,
}

impl<T: Poolable> StreamPool<T> {
    pub fn new(initial_size: usize, max_streams: usize) -> Self {
        let initial_size = initial_size.max(1);
        let mut spares = Vec::with_capacity(initial_size);
        spares.resize_with(initial_size, T::default);
        Self {
            streams: Arena::with_capacity(initial_size),
            by_id: BTreeMap::new(),
            spares,
            capacity: initial_size,
            max_streams: max_streams.max(initial_size),
            next_id: FIRST_ITEM_STREAM_ID,
        }
    }

    /// Take a stream from the pool under a freshly assigned id.
    ///
    /// `init` fills the recycled object before it becomes visible.
    pub fn acquire(
        &mut self,
        init: impl FnOnce(&mut T, StreamId),
    ) -> Result<(Handle, StreamId), PoolError> {
        if self.streams.len() >= self.capacity {
            self.grow()?;
        }

        let stream_id = self.allocate_id();
        let mut stream = self.spares.pop().unwrap_or_default();
        init(&mut stream, stream_id);

        let handle = self.streams.insert(stream);
        self.by_id.insert(stream_id, handle);
        debug!(stream_id, in_use = self.streams.len(), "Stream acquired");
        Ok((handle, stream_id))
    }

    /// Return a stream to the pool. Its id becomes free for reuse.
    pub fn release(&mut self, handle: Handle, stream_id: StreamId) -> Result<(), PoolError> {
        let mut stream = self.streams.remove(handle).ok_or(PoolError::UnknownHandle)?;
        if self.by_id.get(&stream_id) == Some(&handle) {
            self.by_id.remove(&stream_id);
        }
        stream.reset();
        self.spares.push(stream);
        debug!(stream_id, in_use = self.streams.len(), "Stream released");
        Ok(())
    }

    fn grow(&mut self) -> Result<(), PoolError> {
        let target = self.capacity.saturating_mul(2).min(self.max_streams);
        if target <= self.capacity {
            warn!(capacity = self.capacity, "Stream pool exhausted");
            return Err(PoolError::Exhausted {
                capacity: self.capacity,
            });
        }

        let additional = target - self.capacity;
        if self.spares.try_reserve(additional).is_err() {
            warn!(capacity = self.capacity, target, "Stream pool growth failed");
            return Err(PoolError::GrowthFailed {
                capacity: self.capacity,
            });
        }
        self.streams.reserve(additional);

        info!(from = self.capacity, to = target, "Stream pool grown");
        self.capacity = target;
        Ok(())
    }

    fn allocate_id(&mut self) -> StreamId {
        loop {
            let candidate = self.next_id;
            self.next_id = if candidate == StreamId::MAX {
                FIRST_ITEM_STREAM_ID
            } else {
                candidate + 1
            };
            if !self.by_id.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.streams.get(handle)
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        self.streams.get_mut(handle)
    }

    /// Handle of the live stream using `stream_id`.
    pub fn handle_for(&self, stream_id: StreamId) -> Option<Handle> {
        self.by_id.get(&stream_id).copied()
    }

    /// Live handles ordered by stream id.
    pub fn handles(&self) -> Vec<Handle> {
        self.by_id.values().copied().collect()
    }

    /// Streams in use
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Streams that can be in use before the pool must grow.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Reset objects ready for reuse
    pub fn spare_count(&self) -> usize {
        self.spares.len()
    }
}

/// Counter for provider-driven (negative) stream ids.
///
/// Counts down from -1, wraps back to -1 after `i32::MIN` and skips ids
/// the caller reports as in use.
#[derive(Debug, Clone)]
pub struct ProviderIdAllocator {
    next: StreamId,
}

impl Default for ProviderIdAllocator {
    fn default() -> Self {
        Self { next: -1 }
    }
}

impl ProviderIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self, in_use: impl Fn(StreamId) -> bool) -> StreamId {
        loop {
            let candidate = self.next;
            self.next = if candidate == StreamId::MIN {
                -1
            } else {
                candidate - 1
            };
            if !in_use(candidate) {
                return candidate;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feed_types::ids::{DIRECTORY_STREAM_ID, LOGIN_STREAM_ID};
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    #[derive(Debug, Default)]
    struct Slot {
        id: StreamId,
        payload: Vec<u8>,
    }

    impl Poolable for Slot {
        fn reset(&mut self) {
            self.id = 0;
            self.payload.clear();
        }
    }

    fn open(pool: &mut StreamPool<Slot>) -> (Handle, StreamId) {
        pool.acquire(|slot, id| {
            slot.id = id;
            slot.payload.push(1);
        })
        .unwrap()
    }

    #[test]
    fn test_ids_start_after_control_streams() {
        let mut pool = StreamPool::<Slot>::new(4, 16);
        let (_, first) = open(&mut pool);
        let (_, second) = open(&mut pool);
        assert_eq!(first, FIRST_ITEM_STREAM_ID);
        assert_eq!(second, FIRST_ITEM_STREAM_ID + 1);
        assert_ne!(first, LOGIN_STREAM_ID);
        assert_ne!(first, DIRECTORY_STREAM_ID);
    }

    #[test]
    fn test_release_recycles_object() {
        let mut pool = StreamPool::<Slot>::new(2, 2);
        assert_eq!(pool.spare_count(), 2);
        let (handle, id) = open(&mut pool);
        assert_eq!(pool.get(handle).map(|s| s.id), Some(id));
        assert_eq!(pool.handle_for(id), Some(handle));

        pool.release(handle, id).unwrap();
        assert!(pool.get(handle).is_none());
        assert_eq!(pool.handle_for(id), None);
        assert_eq!(pool.spare_count(), 2);
        assert_eq!(pool.release(handle, id), Err(PoolError::UnknownHandle));
    }

    #[test]
    fn test_released_id_not_reused_until_wrap() {
        let mut pool = StreamPool::<Slot>::new(4, 16);
        let (handle, id) = open(&mut pool);
        pool.release(handle, id).unwrap();
        let (_, next) = open(&mut pool);
        assert_eq!(next, id + 1);
    }

    #[test]
    fn test_growth_doubles_until_max() {
        let mut pool = StreamPool::<Slot>::new(2, 5);
        for _ in 0..5 {
            open(&mut pool);
        }
        assert_eq!(pool.capacity(), 5);
        assert_eq!(
            pool.acquire(|_, _| {}).unwrap_err(),
            PoolError::Exhausted { capacity: 5 }
        );
    }

    #[test]
    fn test_id_wrap_skips_live_ids() {
        let mut pool = StreamPool::<Slot>::new(4, 16);
        let (_, kept) = open(&mut pool);
        pool.next_id = StreamId::MAX;
        let (h, max) = open(&mut pool);
        assert_eq!(max, StreamId::MAX);
        pool.release(h, max).unwrap();

        let (_, wrapped) = open(&mut pool);
        assert_eq!(kept, FIRST_ITEM_STREAM_ID);
        assert_eq!(wrapped, FIRST_ITEM_STREAM_ID + 1);
    }

    #[test]
    fn test_provider_ids_count_down_and_skip() {
        let mut ids = ProviderIdAllocator::new();
        assert_eq!(ids.next_id(|_| false), -1);
        assert_eq!(ids.next_id(|id| id == -2), -3);

        ids.next = StreamId::MIN;
        assert_eq!(ids.next_id(|_| false), StreamId::MIN);
        assert_eq!(ids.next_id(|_| false), -1);
    }

    proptest! {
        #[test]
        fn prop_live_ids_are_unique(ops in prop::collection::vec(any::<bool>(), 1..200)) {
            let mut pool = StreamPool::<Slot>::new(1, 64);
            let mut live: Vec<(Handle, StreamId)> = Vec::new();

            for acquire in ops {
                if acquire || live.is_empty() {
                    if let Ok(entry) = pool.acquire(|slot, id| slot.id = id) {
                        live.push(entry);
                    }
                } else {
                    let (handle, id) = live.remove(0);
                    pool.release(handle, id).unwrap();
                }

                let ids: BTreeSet<_> = live.iter().map(|(_, id)| *id).collect();
                prop_assert_eq!(ids.len(), live.len());
                prop_assert!(ids.iter().all(|id| *id >= FIRST_ITEM_STREAM_ID));
                prop_assert_eq!(pool.len(), live.len());
                prop_assert!(pool.len() <= pool.capacity());
            }
        }
    }
}
