//! Item groups
//!
//! Providers tag item streams with an opaque group id so that one directory
//! status can address many items. Groups are scoped per service. Group-id
//! storage comes from [`GroupIdPool`], which buckets buffers by power-of-two
//! capacity so ids of varying length reuse allocations.

use std::collections::{BTreeSet, HashMap};

use feed_types::ids::{GroupId, ServiceId, StreamId};
use tracing::debug;

/// Power-of-two bucketed pool of group-id buffers.
#[derive(Debug)]
pub struct GroupIdPool {
    /// buckets[n] holds empty buffers of capacity 2^n
    buckets: Vec<Vec<Vec<u8>>>,
    max_pooled_len: usize,
}

impl GroupIdPool {
    pub fn new(max_pooled_len: usize) -> Self {
        let bucket_count = Self::bucket_index(max_pooled_len.max(1)) + 1;
        Self {
            buckets: vec![Vec::new(); bucket_count],
            max_pooled_len,
        }
    }

    fn bucket_index(len: usize) -> usize {
        len.max(1).next_power_of_two().trailing_zeros() as usize
    }

    /// Buffer holding a copy of `bytes`.
    ///
    /// Ids longer than the pooling limit get an ad hoc allocation.
    pub fn get(&mut self, bytes: &[u8]) -> GroupId {
        if bytes.len() > self.max_pooled_len {
            return GroupId::from(bytes);
        }
        let index = Self::bucket_index(bytes.len());
        let mut buffer = self
            .buckets
            .get_mut(index)
            .and_then(Vec::pop)
            .unwrap_or_else(|| Vec::with_capacity(1 << index));
        buffer.extend_from_slice(bytes);
        GroupId::from(buffer)
    }

    /// Return a group id's buffer for reuse.
    pub fn put(&mut self, group: GroupId) {
        let mut buffer = group.into_bytes();
        let capacity = buffer.capacity();
        if capacity == 0 || !capacity.is_power_of_two() || capacity > self.max_pooled_len.next_power_of_two() {
            return;
        }
        buffer.clear();
        if let Some(bucket) = self.buckets.get_mut(Self::bucket_index(capacity)) {
            bucket.push(buffer);
        }
    }

    /// Buffers waiting for reuse
    pub fn pooled_count(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }
}

/// Streams tagged with one group id.
#[derive(Debug, Default)]
pub struct ItemGroup {
    streams: BTreeSet<StreamId>,
}

impl ItemGroup {
    pub fn streams(&self) -> impl Iterator<Item = StreamId> + '_ {
        self.streams.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

/// Group membership of item streams, per service.
#[derive(Debug)]
pub struct ItemGroupTable {
    services: HashMap<ServiceId, HashMap<GroupId, ItemGroup>>,
    /// Stream -> (service, group) it currently belongs to
    membership: HashMap<StreamId, (ServiceId, GroupId)>,
    pool: GroupIdPool,
}

impl ItemGroupTable {
    pub fn new(max_pooled_len: usize) -> Self {
        Self {
            services: HashMap::new(),
            membership: HashMap::new(),
            pool: GroupIdPool::new(max_pooled_len),
        }
    }

    /// Group `group` of a service, created with a pooled id on first use.
    fn get_group(&mut self, service_id: ServiceId, group: &[u8]) -> Option<&mut ItemGroup> {
        let groups = self.services.entry(service_id).or_default();
        if !groups.contains_key(group) {
            groups.insert(self.pool.get(group), ItemGroup::default());
        }
        groups.get_mut(group)
    }

    fn return_group(&mut self, id: GroupId) {
        self.pool.put(id);
    }

    /// Tag `stream_id` with `group`, moving it out of its previous group.
    ///
    /// Returns false if it was already a member.
    pub fn add_stream(&mut self, service_id: ServiceId, group: &[u8], stream_id: StreamId) -> bool {
        if let Some((current_service, current)) = self.membership.get(&stream_id) {
            if *current_service == service_id && current.as_bytes() == group {
                return false;
            }
        }
        self.remove_stream(stream_id);

        if let Some(item_group) = self.get_group(service_id, group) {
            item_group.streams.insert(stream_id);
        }
        let id = self.pool.get(group);
        self.membership.insert(stream_id, (service_id, id));
        true
    }

    /// Drop `stream_id` from its group. Empty groups are returned to the pool.
    pub fn remove_stream(&mut self, stream_id: StreamId) -> bool {
        let Some((service_id, group)) = self.membership.remove(&stream_id) else {
            return false;
        };

        let mut emptied = None;
        if let Some(groups) = self.services.get_mut(&service_id) {
            if let Some(item_group) = groups.get_mut(group.as_bytes()) {
                item_group.streams.remove(&stream_id);
                if item_group.is_empty() {
                    emptied = groups.remove_entry(group.as_bytes()).map(|(id, _)| id);
                }
            }
            if groups.is_empty() {
                self.services.remove(&service_id);
            }
        }
        if let Some(id) = emptied {
            self.return_group(id);
        }
        self.pool.put(group);
        true
    }

    /// Streams currently tagged with `group`.
    pub fn members(&self, service_id: ServiceId, group: &[u8]) -> Vec<StreamId> {
        self.services
            .get(&service_id)
            .and_then(|groups| groups.get(group))
            .map(|g| g.streams().collect())
            .unwrap_or_default()
    }

    /// Move every member of `from` into `to`. Returns how many moved.
    pub fn merge(&mut self, service_id: ServiceId, from: &[u8], to: &[u8]) -> usize {
        if from == to {
            return 0;
        }
        let moved = self.members(service_id, from);
        for stream_id in &moved {
            self.add_stream(service_id, to, *stream_id);
        }
        debug!(
            service_id,
            from = %GroupId::from(from),
            to = %GroupId::from(to),
            moved = moved.len(),
            "Item group merged"
        );
        moved.len()
    }

    /// Group of a stream, if any.
    pub fn group_of(&self, stream_id: StreamId) -> Option<(ServiceId, &GroupId)> {
        self.membership
            .get(&stream_id)
            .map(|(service_id, group)| (*service_id, group))
    }

    /// Forget every group of a service. Returns the streams that were tagged.
    pub fn remove_service(&mut self, service_id: ServiceId) -> Vec<StreamId> {
        let mut streams: Vec<StreamId> = self
            .membership
            .iter()
            .filter(|(_, (service, _))| *service == service_id)
            .map(|(stream_id, _)| *stream_id)
            .collect();
        streams.sort_unstable();
        for stream_id in &streams {
            self.remove_stream(*stream_id);
        }
        streams
    }

    pub fn clear(&mut self) {
        let streams: Vec<StreamId> = self.membership.keys().copied().collect();
        for stream_id in streams {
            self.remove_stream(stream_id);
        }
    }

    pub fn group_count(&self, service_id: ServiceId) -> usize {
        self.services.get(&service_id).map(HashMap::len).unwrap_or(0)
    }

    pub fn pooled_buffers(&self) -> usize {
        self.pool.pooled_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_buckets_by_power_of_two() {
        let mut pool = GroupIdPool::new(256);
        let a = pool.get(&[1, 2, 3]);
        assert_eq!(a.as_bytes(), &[1, 2, 3]);
        pool.put(a);
        assert_eq!(pool.pooled_count(), 1);

        // Same bucket (4 bytes) reuses the buffer.
        let b = pool.get(&[9, 9, 9, 9]);
        assert_eq!(pool.pooled_count(), 0);
        assert_eq!(b.as_bytes(), &[9, 9, 9, 9]);
    }

    #[test]
    fn test_oversized_ids_not_pooled() {
        let mut pool = GroupIdPool::new(8);
        let big = pool.get(&[0u8; 20]);
        assert_eq!(big.len(), 20);
        pool.put(big);
        assert_eq!(pool.pooled_count(), 0);
    }

    #[test]
    fn test_add_and_members() {
        let mut table = ItemGroupTable::new(256);
        assert!(table.add_stream(1, b"g1", 3));
        assert!(table.add_stream(1, b"g1", 4));
        assert!(!table.add_stream(1, b"g1", 4));
        assert!(table.add_stream(2, b"g1", 5));

        assert_eq!(table.members(1, b"g1"), vec![3, 4]);
        assert_eq!(table.members(2, b"g1"), vec![5]);
        assert_eq!(table.group_of(3).map(|(s, g)| (s, g.as_bytes().to_vec())), Some((1, b"g1".to_vec())));
    }

    #[test]
    fn test_reassign_moves_stream() {
        let mut table = ItemGroupTable::new(256);
        table.add_stream(1, b"a", 3);
        table.add_stream(1, b"b", 3);
        assert!(table.members(1, b"a").is_empty());
        assert_eq!(table.members(1, b"b"), vec![3]);
        assert_eq!(table.group_count(1), 1);
    }

    #[test]
    fn test_remove_returns_empty_group() {
        let mut table = ItemGroupTable::new(256);
        table.add_stream(1, b"a", 3);
        assert!(table.remove_stream(3));
        assert!(!table.remove_stream(3));
        assert_eq!(table.group_count(1), 0);
        assert!(table.pooled_buffers() > 0);
    }

    #[test]
    fn test_merge_moves_members() {
        let mut table = ItemGroupTable::new(256);
        table.add_stream(1, b"old", 3);
        table.add_stream(1, b"old", 4);
        table.add_stream(1, b"new", 5);

        assert_eq!(table.merge(1, b"old", b"new"), 2);
        assert_eq!(table.members(1, b"new"), vec![3, 4, 5]);
        assert!(table.members(1, b"old").is_empty());
    }

    #[test]
    fn test_remove_service() {
        let mut table = ItemGroupTable::new(256);
        table.add_stream(1, b"a", 3);
        table.add_stream(1, b"b", 4);
        table.add_stream(2, b"a", 5);

        assert_eq!(table.remove_service(1), vec![3, 4]);
        assert_eq!(table.group_count(1), 0);
        assert_eq!(table.members(2, b"a"), vec![5]);

        table.clear();
        assert!(table.group_of(5).is_none());
    }
}
