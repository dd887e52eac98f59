use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use log::debug;
use parking_lot::RwLock;

/// An opaque reference to a blob held in shared cluster storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    id: u64,
    size: usize,
}

impl ObjectRef {
    /// The storage-wide identifier of the blob.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The size of the blob in bytes.
    pub fn size(&self) -> usize {
        self.size
    }
}

/// Shared object storage with put/get semantics, as provided by the cluster runtime.
///
/// Blobs are immutable once stored. Readers receive a shared view of the stored bytes,
/// so any amount of concurrent `get`s never copies nor re-serializes a blob.
pub trait ObjectStore: Send + Sync {
    /// Stores a blob and returns a reference to it.
    fn put(&self, blob: Vec<u8>) -> ObjectRef;

    /// Fetches a blob, `None` if it was released or evicted.
    fn get(&self, object: &ObjectRef) -> Option<Arc<[u8]>>;

    /// Releases a blob, later `get`s for it return `None`.
    fn release(&self, object: &ObjectRef);
}

#[derive(Default)]
struct Entries {
    blobs: HashMap<u64, Arc<[u8]>>,
    order: VecDeque<u64>,
    bytes: usize,
}

impl Entries {
    fn remove(&mut self, id: u64) -> bool {
        let Some(blob) = self.blobs.remove(&id) else {
            return false;
        };

        self.bytes -= blob.len();
        self.order.retain(|other| *other != id);
        true
    }
}

/// In-process `ObjectStore` with an optional byte capacity.
///
/// When a `put` goes over capacity the oldest blobs are evicted first, the freshly stored
/// blob is never evicted by its own `put`.
pub struct InMemoryStore {
    entries: RwLock<Entries>,
    capacity: Option<usize>,
    next_id: AtomicU64,
    puts: AtomicU64,
    gets: AtomicU64,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Creates a new unbounded `InMemoryStore`.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Entries::default()),
            capacity: None,
            next_id: AtomicU64::new(0),
            puts: AtomicU64::new(0),
            gets: AtomicU64::new(0),
        }
    }

    /// Creates a new `InMemoryStore` holding at most `capacity` bytes.
    ///
    /// # Args
    /// * `capacity` - The amount of bytes after which older blobs get evicted.
    ///
    /// # Returns
    /// A new `InMemoryStore` instance.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::new()
        }
    }

    /// Evicts a blob as if storage pressure reclaimed it.
    ///
    /// # Returns
    /// Whether the blob was still stored.
    pub fn evict(&self, object: &ObjectRef) -> bool {
        self.entries.write().remove(object.id)
    }

    /// The amount of blobs ever stored.
    pub fn puts(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
    }

    /// The amount of successful fetches.
    pub fn gets(&self) -> u64 {
        self.gets.load(Ordering::Relaxed)
    }

    /// The amount of bytes currently stored.
    pub fn bytes_stored(&self) -> usize {
        self.entries.read().bytes
    }

    /// The amount of blobs currently stored.
    pub fn len(&self) -> usize {
        self.entries.read().blobs.len()
    }

    /// Whether the store holds no blobs.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ObjectStore for InMemoryStore {
    fn put(&self, blob: Vec<u8>) -> ObjectRef {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let size = blob.len();

        let mut entries = self.entries.write();
        if let Some(capacity) = self.capacity {
            while entries.bytes + size > capacity {
                let Some(oldest) = entries.order.front().copied() else {
                    break;
                };

                debug!(object_id = oldest; "evicting object to make room");
                entries.remove(oldest);
            }
        }

        entries.blobs.insert(id, blob.into());
        entries.order.push_back(id);
        entries.bytes += size;
        self.puts.fetch_add(1, Ordering::Relaxed);

        ObjectRef { id, size }
    }

    fn get(&self, object: &ObjectRef) -> Option<Arc<[u8]>> {
        let blob = self.entries.read().blobs.get(&object.id).cloned()?;
        self.gets.fetch_add(1, Ordering::Relaxed);
        Some(blob)
    }

    fn release(&self, object: &ObjectRef) {
        self.entries.write().remove(object.id);
    }
}
