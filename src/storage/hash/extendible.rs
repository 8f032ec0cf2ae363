use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use parking_lot::Mutex;

/// Extendible hash table with a fixed bucket capacity.
///
/// Directory addressing bit-reverses the hash, so every bucket owns a
/// contiguous run of directory slots and doubling the directory maps old
/// slot `i` onto slots `2i` and `2i + 1`. A single mutex covers the
/// directory and all buckets for the duration of each operation.
pub struct ExtendibleHashTable<K, V> {
    inner: Mutex<Inner<K, V>>,
    bucket_size: usize,
}

struct Inner<K, V> {
    global_depth: u32,
    /// Directory slots hold indices into the bucket arena
    directory: Vec<usize>,
    buckets: Vec<Option<Bucket<K, V>>>,
    free_slots: Vec<usize>,
    num_buckets: usize,
    len: usize,
}

struct Bucket<K, V> {
    local_depth: u32,
    items: Vec<(K, V)>,
}

impl<K, V> ExtendibleHashTable<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn new(bucket_size: usize) -> Self {
        assert!(bucket_size > 0);
        Self {
            inner: Mutex::new(Inner {
                global_depth: 0,
                directory: vec![0],
                buckets: vec![Some(Bucket {
                    local_depth: 0,
                    items: Vec::with_capacity(bucket_size),
                })],
                free_slots: Vec::new(),
                num_buckets: 1,
                len: 0,
            }),
            bucket_size,
        }
    }

    pub fn find(&self, key: &K) -> Option<V> {
        let inner = self.inner.lock();
        let bucket = inner.bucket_for(key);
        bucket
            .items
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    pub fn remove(&self, key: &K) -> bool {
        let mut inner = self.inner.lock();
        let slot = inner.bucket_slot_for(key);
        let bucket = inner.buckets[slot].as_mut().expect("live bucket");
        match bucket.items.iter().position(|(k, _)| k == key) {
            Some(pos) => {
                bucket.items.swap_remove(pos);
                inner.len -= 1;
                true
            }
            None => false,
        }
    }

    /// Insert a key/value pair, overwriting any existing value for the key
    pub fn insert(&self, key: K, value: V) {
        let mut inner = self.inner.lock();

        // Overwrite in place if the key is present
        {
            let slot = inner.bucket_slot_for(&key);
            let bucket = inner.buckets[slot].as_mut().expect("live bucket");
            if let Some(item) = bucket.items.iter_mut().find(|(k, _)| *k == key) {
                item.1 = value;
                return;
            }
        }

        loop {
            let slot = inner.bucket_slot_for(&key);
            let bucket = inner.buckets[slot].as_ref().expect("live bucket");

            if bucket.items.len() < self.bucket_size {
                inner.buckets[slot]
                    .as_mut()
                    .expect("live bucket")
                    .items
                    .push((key, value));
                inner.len += 1;
                return;
            }

            // Full bucket: double the directory when the bucket already
            // discriminates on every directory bit, then split it
            if bucket.local_depth == inner.global_depth {
                inner.double_directory();
            }
            inner.split_bucket(slot);
        }
    }

    pub fn global_depth(&self) -> u32 {
        self.inner.lock().global_depth
    }

    /// Local depth of the bucket currently responsible for `key`
    pub fn local_depth(&self, key: &K) -> u32 {
        self.inner.lock().bucket_for(key).local_depth
    }

    pub fn num_buckets(&self) -> usize {
        self.inner.lock().num_buckets
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> Inner<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    fn directory_index(&self, key: &K) -> usize {
        if self.global_depth == 0 {
            return 0;
        }
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let reversed = hasher.finish().reverse_bits();
        (reversed >> (64 - self.global_depth)) as usize
    }

    fn bucket_slot_for(&self, key: &K) -> usize {
        self.directory[self.directory_index(key)]
    }

    fn bucket_for(&self, key: &K) -> &Bucket<K, V> {
        self.buckets[self.bucket_slot_for(key)]
            .as_ref()
            .expect("live bucket")
    }

    fn double_directory(&mut self) {
        let mut doubled = Vec::with_capacity(self.directory.len() * 2);
        for &slot in &self.directory {
            doubled.push(slot);
            doubled.push(slot);
        }
        self.directory = doubled;
        self.global_depth += 1;
    }

    /// Split the bucket in arena slot `slot` across its directory range.
    /// Requires local depth < global depth.
    fn split_bucket(&mut self, slot: usize) {
        let old = self.buckets[slot].take().expect("live bucket");
        debug_assert!(old.local_depth < self.global_depth);

        // The bucket's directory slots are the contiguous run sharing its
        // top local_depth bits
        let span = 1usize << (self.global_depth - old.local_depth);
        let any_index = self
            .directory
            .iter()
            .position(|&s| s == slot)
            .expect("bucket referenced by directory");
        let start = (any_index / span) * span;
        let mid = start + span / 2;

        let first = self.alloc_bucket(old.local_depth + 1);
        let second = self.alloc_bucket(old.local_depth + 1);
        for index in start..mid {
            self.directory[index] = first;
        }
        for index in mid..start + span {
            self.directory[index] = second;
        }
        self.free_slots.push(slot);
        self.num_buckets += 1;

        // Redistribute; the new top bit separates the entries between the
        // two halves
        for (key, value) in old.items {
            let target = self.bucket_slot_for(&key);
            self.buckets[target]
                .as_mut()
                .expect("live bucket")
                .items
                .push((key, value));
        }
    }

    fn alloc_bucket(&mut self, local_depth: u32) -> usize {
        let bucket = Bucket {
            local_depth,
            items: Vec::new(),
        };
        match self.free_slots.pop() {
            Some(slot) => {
                self.buckets[slot] = Some(bucket);
                slot
            }
            None => {
                self.buckets.push(Some(bucket));
                self.buckets.len() - 1
            }
        }
    }
}
