//! # Kademlia Routing Table
//!
//! 160 buckets, one per bit of the HostID space. Bucket `i` holds entries
//! whose XOR distance from the local ID has exactly `i` leading zero bits, so
//! deeper buckets hold nearer hosts. Each bucket keeps at most `k` entries.
//!
//! Unlike a classic kademlia table there is no liveness probing: entries are
//! live links, removed when the link closes. When a bucket is full the
//! farthest entry yields to a strictly nearer candidate.

use std::cmp::Ordering;

use crate::identity::{distance_cmp, HostId, HOST_ID_LEN};

/// Number of buckets (bits in a HostID).
pub const ID_BITS: usize = HOST_ID_LEN * 8;

/// Anything stored in a [`KBucket`] is addressed by a HostID.
pub trait BucketEntry: Clone {
    fn host_id(&self) -> HostId;
}

impl BucketEntry for HostId {
    fn host_id(&self) -> HostId {
        *self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome<T> {
    Inserted,
    /// The bucket was full; the returned entry was evicted to make room.
    Replaced(T),
    /// The bucket was full and every entry is at least as near as the candidate.
    Full,
    /// Same ID already present, or the local ID itself.
    Duplicate,
}

impl<T> InsertOutcome<T> {
    pub fn is_inserted(&self) -> bool {
        matches!(self, InsertOutcome::Inserted | InsertOutcome::Replaced(_))
    }
}

/// Index of the bucket holding `other` relative to `self_id`. Equal IDs map
/// to [`ID_BITS`], which is outside the table.
pub fn bucket_index(self_id: &HostId, other: &HostId) -> usize {
    let dist = self_id.xor_distance(other);
    for (byte_idx, byte) in dist.iter().enumerate() {
        if *byte != 0 {
            return byte_idx * 8 + byte.leading_zeros() as usize;
        }
    }
    ID_BITS
}

#[derive(Debug, Clone)]
pub struct KBucket<T> {
    self_id: HostId,
    k: usize,
    buckets: Vec<Vec<T>>,
    len: usize,
}

impl<T: BucketEntry> KBucket<T> {
    pub fn new(self_id: HostId, k: usize) -> Self {
        Self {
            self_id,
            k: k.max(1),
            buckets: vec![Vec::new(); ID_BITS],
            len: 0,
        }
    }

    pub fn self_id(&self) -> HostId {
        self.self_id
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn insert(&mut self, entry: T) -> InsertOutcome<T> {
        let id = entry.host_id();
        let idx = bucket_index(&self.self_id, &id);
        if idx >= ID_BITS {
            return InsertOutcome::Duplicate;
        }
        let bucket = &mut self.buckets[idx];
        if bucket.iter().any(|e| e.host_id() == id) {
            return InsertOutcome::Duplicate;
        }
        if bucket.len() < self.k {
            bucket.push(entry);
            self.len += 1;
            return InsertOutcome::Inserted;
        }

        let self_id = self.self_id;
        let farthest = bucket
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| {
                distance_cmp(
                    &a.host_id().xor_distance(&self_id),
                    &b.host_id().xor_distance(&self_id),
                )
            })
            .map(|(pos, e)| (pos, e.host_id()));

        match farthest {
            Some((pos, far_id))
                if distance_cmp(&far_id.xor_distance(&self_id), &id.xor_distance(&self_id))
                    == Ordering::Greater =>
            {
                let evicted = std::mem::replace(&mut bucket[pos], entry);
                InsertOutcome::Replaced(evicted)
            }
            _ => InsertOutcome::Full,
        }
    }

    pub fn remove(&mut self, id: &HostId) -> Option<T> {
        let idx = bucket_index(&self.self_id, id);
        let bucket = self.buckets.get_mut(idx)?;
        let pos = bucket.iter().position(|e| &e.host_id() == id)?;
        self.len -= 1;
        Some(bucket.remove(pos))
    }

    pub fn get(&self, id: &HostId) -> Option<&T> {
        let idx = bucket_index(&self.self_id, id);
        self.buckets.get(idx)?.iter().find(|e| &e.host_id() == id)
    }

    pub fn contains(&self, id: &HostId) -> bool {
        self.get(id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.buckets.iter().flat_map(|b| b.iter())
    }

    pub fn clear(&mut self) -> Vec<T> {
        self.len = 0;
        self.buckets.iter_mut().flat_map(std::mem::take).collect()
    }

    /// Up to `n` entries nearest to `target`, nearest first.
    ///
    /// Buckets are visited outward from the target's home bucket: the home
    /// bucket, then every deeper bucket as one class, then the shallower
    /// buckets one at a time. Each class is strictly nearer to the target than
    /// the next, so collection stops as soon as `n` entries are gathered.
    pub fn closest(&self, target: &HostId, n: usize) -> Vec<T> {
        if n == 0 {
            return Vec::new();
        }
        let home = bucket_index(&self.self_id, target);
        let mut out: Vec<T> = Vec::with_capacity(n);

        let take_class = |out: &mut Vec<T>, mut class: Vec<&T>| {
            class.sort_by(|a, b| {
                distance_cmp(
                    &a.host_id().xor_distance(target),
                    &b.host_id().xor_distance(target),
                )
            });
            out.extend(class.into_iter().cloned());
        };

        if home < ID_BITS {
            take_class(&mut out, self.buckets[home].iter().collect());
        }
        if out.len() < n && home + 1 < ID_BITS {
            let deeper = self.buckets[home + 1..].iter().flat_map(|b| b.iter()).collect();
            take_class(&mut out, deeper);
        }
        for idx in (0..home.min(ID_BITS)).rev() {
            if out.len() >= n {
                break;
            }
            take_class(&mut out, self.buckets[idx].iter().collect());
        }

        out.truncate(n);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id_with_prefix(prefix: &[u8]) -> HostId {
        let mut bytes = [0u8; HOST_ID_LEN];
        bytes[..prefix.len()].copy_from_slice(prefix);
        HostId::from_bytes(bytes)
    }

    fn brute_force_closest(entries: &[HostId], target: &HostId, n: usize) -> Vec<HostId> {
        let mut sorted = entries.to_vec();
        sorted.sort_by(|a, b| distance_cmp(&a.xor_distance(target), &b.xor_distance(target)));
        sorted.truncate(n);
        sorted
    }

    #[test]
    fn bucket_index_counts_leading_zero_bits() {
        let zero = id_with_prefix(&[]);
        assert_eq!(bucket_index(&zero, &id_with_prefix(&[0x80])), 0);
        assert_eq!(bucket_index(&zero, &id_with_prefix(&[0x01])), 7);
        assert_eq!(bucket_index(&zero, &id_with_prefix(&[0x00, 0x40])), 9);
        assert_eq!(bucket_index(&zero, &zero), ID_BITS);
    }

    #[test]
    fn rejects_self_and_duplicates() {
        let me = id_with_prefix(&[0x00]);
        let other = id_with_prefix(&[0x10]);
        let mut table = KBucket::new(me, 4);

        assert_eq!(table.insert(me), InsertOutcome::Duplicate);
        assert_eq!(table.insert(other), InsertOutcome::Inserted);
        assert_eq!(table.insert(other), InsertOutcome::Duplicate);
        assert_eq!(table.len(), 1);
        assert!(table.contains(&other));
    }

    #[test]
    fn full_bucket_evicts_only_strictly_farther() {
        let me = id_with_prefix(&[0x00]);
        let mut table = KBucket::new(me, 2);

        // All in bucket 0 (top bit differs).
        let far = id_with_prefix(&[0xFF]);
        let mid = id_with_prefix(&[0xC0]);
        let near = id_with_prefix(&[0x80]);

        assert_eq!(table.insert(far), InsertOutcome::Inserted);
        assert_eq!(table.insert(mid), InsertOutcome::Inserted);
        assert_eq!(table.insert(near), InsertOutcome::Replaced(far));
        assert_eq!(table.insert(far), InsertOutcome::Full);
        assert_eq!(table.len(), 2);
        assert!(table.contains(&near) && table.contains(&mid));
    }

    #[derive(Clone, Debug, PartialEq)]
    struct Tagged(HostId, u8);

    impl BucketEntry for Tagged {
        fn host_id(&self) -> HostId {
            self.0
        }
    }

    #[test]
    fn equal_distance_challenger_keeps_incumbent() {
        let me = id_with_prefix(&[0x00]);
        let mid = id_with_prefix(&[0xC0]);
        let mut full = KBucket::new(me, 1);
        assert!(full.insert(Tagged(mid, 1)).is_inserted());

        // Only the same ID lies at the same XOR distance.
        assert_eq!(full.insert(Tagged(mid, 2)), InsertOutcome::Duplicate);
        assert_eq!(full.get(&mid), Some(&Tagged(mid, 1)));
        assert_eq!(full.len(), 1);
    }

    #[test]
    fn remove_and_clear() {
        let me = id_with_prefix(&[0x00]);
        let mut table = KBucket::new(me, 4);
        let a = id_with_prefix(&[0x01]);
        let b = id_with_prefix(&[0x02]);
        table.insert(a);
        table.insert(b);

        assert_eq!(table.remove(&a), Some(a));
        assert_eq!(table.remove(&a), None);
        assert_eq!(table.clear(), vec![b]);
        assert!(table.is_empty());
    }

    #[test]
    fn closest_matches_global_xor_order() {
        let me = Keypairless::id(0);
        let mut table = KBucket::new(me, 20);
        let entries: Vec<HostId> = (1..200).map(Keypairless::id).collect();
        for id in &entries {
            table.insert(*id);
        }
        let stored: Vec<HostId> = table.iter().copied().collect();

        for t in [3u32, 77, 150, 9999] {
            let target = Keypairless::id(t);
            for n in [1, 5, 10, 40] {
                assert_eq!(
                    table.closest(&target, n),
                    brute_force_closest(&stored, &target, n),
                    "target {} n {}",
                    t,
                    n
                );
            }
        }
        assert_eq!(table.closest(&me, 3), brute_force_closest(&stored, &me, 3));
        assert!(table.closest(&me, 0).is_empty());
    }

    /// Deterministic pseudo-random IDs.
    struct Keypairless;

    impl Keypairless {
        fn id(n: u32) -> HostId {
            let hash = blake3::hash(&n.to_be_bytes());
            HostId::from_hash(hash.as_bytes())
        }
    }
}
