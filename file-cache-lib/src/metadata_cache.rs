use crate::config::{MetadataCacheConfig, MIB};
use crate::eviction::LruList;
use remote_store_lib::ObjectAttributes;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Fixed per-entry bookkeeping estimate added to the key length when
/// charging an entry against the namespace budget.
const ENTRY_OVERHEAD_BYTES: u64 = 200;

/// Same (bucket, name) shape the content cache keys by. Slashes are legal
/// inside object names, so a joined string would not be unambiguous.
type ObjectKey = (String, String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirentType {
    File,
    Dir,
    Symlink,
    NonExistent,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CachedMetadata {
    Stat(ObjectAttributes),
    Type(DirentType),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataKind {
    Stat,
    Type,
}

struct Slot {
    key: ObjectKey,
    value: CachedMetadata,
    expires_at: Option<Instant>,
    cost: u64,
}

/// One LRU namespace with its own byte budget. Entries are never pinned,
/// so eviction is a straight pop from the stale end.
struct Namespace {
    list: LruList,
    slots: Vec<Option<Slot>>,
    map: HashMap<ObjectKey, usize>,
    total_bytes: u64,
    budget: Option<u64>,
}

impl Namespace {
    fn new(max_size_mb: i64) -> Self {
        let budget = match max_size_mb {
            -1 => None,
            mb => Some(mb as u64 * MIB),
        };
        Self {
            list: LruList::new(),
            slots: Vec::new(),
            map: HashMap::new(),
            total_bytes: 0,
            budget,
        }
    }

    fn remove(&mut self, key: &ObjectKey) {
        if let Some(slot) = self.map.remove(key) {
            if let Some(entry) = self.slots[slot].take() {
                self.total_bytes -= entry.cost;
            }
            self.list.remove(slot);
        }
    }

    fn insert(&mut self, key: ObjectKey, value: CachedMetadata, expires_at: Option<Instant>) {
        if self.budget == Some(0) {
            return;
        }
        self.remove(&key);
        let cost = (key.0.len() + key.1.len()) as u64 + ENTRY_OVERHEAD_BYTES;
        if let Some(budget) = self.budget {
            if cost > budget {
                return;
            }
        }
        let slot = self.list.push_front();
        if slot >= self.slots.len() {
            self.slots.resize_with(slot + 1, || None);
        }
        self.map.insert(key.clone(), slot);
        self.slots[slot] = Some(Slot {
            key,
            value,
            expires_at,
            cost,
        });
        self.total_bytes += cost;
        if let Some(budget) = self.budget {
            while self.total_bytes > budget {
                if !self.evict_one() {
                    break;
                }
            }
        }
    }

    fn evict_one(&mut self) -> bool {
        let Some(slot) = self.list.tail_slot() else {
            return false;
        };
        if let Some(entry) = self.slots[slot].take() {
            self.map.remove(&entry.key);
            self.total_bytes -= entry.cost;
        }
        self.list.remove(slot);
        true
    }

    fn get(&mut self, key: &ObjectKey, now: Instant) -> Option<CachedMetadata> {
        let slot = *self.map.get(key)?;
        let expired = match &self.slots[slot] {
            Some(entry) => entry.expires_at.map_or(false, |at| now >= at),
            None => return None,
        };
        if expired {
            self.remove(key);
            return None;
        }
        self.list.touch(slot);
        self.slots[slot].as_ref().map(|entry| entry.value.clone())
    }
}

/// TTL metadata cache with separate stat and type namespaces. Both share
/// one TTL; a TTL of 0 disables caching and -1 never expires.
pub struct MetadataCache {
    ttl: TtlPolicy,
    stat: Mutex<Namespace>,
    types: Mutex<Namespace>,
}

#[derive(Debug, Clone, Copy)]
enum TtlPolicy {
    Disabled,
    Forever,
    Expires(Duration),
}

impl MetadataCache {
    pub fn new(config: &MetadataCacheConfig) -> Self {
        let ttl = match config.ttl_secs {
            0 => TtlPolicy::Disabled,
            -1 => TtlPolicy::Forever,
            secs => TtlPolicy::Expires(Duration::from_secs(secs as u64)),
        };
        Self {
            ttl,
            stat: Mutex::new(Namespace::new(config.stat_cache_max_size_mb)),
            types: Mutex::new(Namespace::new(config.type_cache_max_size_mb)),
        }
    }

    fn expires_at(&self, now: Instant) -> Option<Option<Instant>> {
        match self.ttl {
            TtlPolicy::Disabled => None,
            TtlPolicy::Forever => Some(None),
            TtlPolicy::Expires(ttl) => Some(Some(now + ttl)),
        }
    }

    pub fn put(&self, kind: MetadataKind, bucket: &str, name: &str, value: CachedMetadata) {
        let Some(expires_at) = self.expires_at(Instant::now()) else {
            return;
        };
        let namespace = match kind {
            MetadataKind::Stat => &self.stat,
            MetadataKind::Type => &self.types,
        };
        let key = (bucket.to_string(), name.to_string());
        namespace.lock().unwrap().insert(key, value, expires_at);
    }

    pub fn get(&self, kind: MetadataKind, bucket: &str, name: &str) -> Option<CachedMetadata> {
        let namespace = match kind {
            MetadataKind::Stat => &self.stat,
            MetadataKind::Type => &self.types,
        };
        let key = (bucket.to_string(), name.to_string());
        namespace.lock().unwrap().get(&key, Instant::now())
    }

    pub fn put_stat(&self, bucket: &str, name: &str, attrs: ObjectAttributes) {
        self.put(MetadataKind::Stat, bucket, name, CachedMetadata::Stat(attrs));
    }

    pub fn get_stat(&self, bucket: &str, name: &str) -> Option<ObjectAttributes> {
        match self.get(MetadataKind::Stat, bucket, name) {
            Some(CachedMetadata::Stat(attrs)) => Some(attrs),
            _ => None,
        }
    }

    pub fn put_type(&self, bucket: &str, name: &str, dirent: DirentType) {
        self.put(MetadataKind::Type, bucket, name, CachedMetadata::Type(dirent));
    }

    pub fn get_type(&self, bucket: &str, name: &str) -> Option<DirentType> {
        match self.get(MetadataKind::Type, bucket, name) {
            Some(CachedMetadata::Type(dirent)) => Some(dirent),
            _ => None,
        }
    }

    /// Drops the object from both namespaces, for mutations observed
    /// outside the cache.
    pub fn erase(&self, bucket: &str, name: &str) {
        let key = (bucket.to_string(), name.to_string());
        self.stat.lock().unwrap().remove(&key);
        self.types.lock().unwrap().remove(&key);
    }

    pub fn stat_bytes(&self) -> u64 {
        self.stat.lock().unwrap().total_bytes
    }
}
