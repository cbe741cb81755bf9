//! File Attribute Cache
//!
//! Bounded map of recently used file attributes. Entries expire after a
//! fixed lifetime, the least recently used entry is evicted when full, and
//! callers drop an entry when the metadata service reports it gone.
//!
//! Recency is a queue of `(stamp, fid)` pairs. A hit pushes a new stamp and
//! leaves the old pair behind; pairs whose stamp no longer matches the entry
//! are skipped on eviction and swept once the queue outgrows the map.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::domain::ports::{FileAttributes, FileId};

#[derive(Debug)]
struct Entry {
    attrs: FileAttributes,
    stored: Instant,
    stamp: u64,
}

/// LRU + TTL cache of [`FileAttributes`]
#[derive(Debug)]
pub struct AttrCache {
    capacity: usize,
    ttl: Duration,
    entries: HashMap<FileId, Entry>,
    /// Least recently used first, may hold stale pairs
    recency: VecDeque<(u64, FileId)>,
    next_stamp: u64,
    hits: u64,
    misses: u64,
}

impl AttrCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            ttl,
            entries: HashMap::with_capacity(capacity),
            recency: VecDeque::with_capacity(capacity),
            next_stamp: 0,
            hits: 0,
            misses: 0,
        }
    }

    /// Fresh attributes of `fid`, if cached
    pub fn get(&mut self, fid: &FileId) -> Option<FileAttributes> {
        let fresh = match self.entries.get(fid) {
            Some(entry) => entry.stored.elapsed() < self.ttl,
            None => {
                self.misses += 1;
                return None;
            }
        };

        if !fresh {
            self.invalidate(fid);
            self.misses += 1;
            return None;
        }

        self.hits += 1;
        self.touch(fid).map(|entry| entry.attrs.clone())
    }

    /// Insert or refresh an entry, evicting the least recently used if full
    pub fn insert(&mut self, attrs: FileAttributes) {
        let fid = attrs.fid;
        let entry = Entry {
            attrs,
            stored: Instant::now(),
            stamp: 0,
        };
        self.entries.insert(fid, entry);
        self.touch(&fid);

        while self.entries.len() > self.capacity {
            match self.recency.pop_front() {
                Some((stamp, oldest)) => {
                    if self.entries.get(&oldest).is_some_and(|e| e.stamp == stamp) {
                        self.entries.remove(&oldest);
                    }
                }
                None => break,
            }
        }
    }

    /// Update the cached size of `fid`, if cached
    pub fn set_size(&mut self, fid: &FileId, size: u64) {
        if let Some(entry) = self.entries.get_mut(fid) {
            entry.attrs.size = size;
        }
    }

    /// Drop the entry of `fid`
    pub fn invalidate(&mut self, fid: &FileId) {
        self.entries.remove(fid);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `(hits, misses)` since creation
    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }

    /// Mark `fid` most recently used
    fn touch(&mut self, fid: &FileId) -> Option<&Entry> {
        let stamp = self.next_stamp;
        let entry = self.entries.get_mut(fid)?;
        self.next_stamp += 1;
        entry.stamp = stamp;
        self.recency.push_back((stamp, *fid));

        if self.recency.len() > 2 * self.capacity {
            let entries = &self.entries;
            self.recency
                .retain(|(stamp, fid)| entries.get(fid).is_some_and(|e| e.stamp == *stamp));
        }
        self.entries.get(fid)
    }
}
