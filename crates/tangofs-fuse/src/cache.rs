//! Per-node child cache.
//!
//! Maps child names to either a materialized child or a marker saying the
//! name is known but no node has been built for it yet. Only the name
//! enumeration expires: a refresh keeps every materialized child whose name
//! is still present.

use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub enum Slot<T> {
    Unmaterialized,
    Ready(T),
}

#[derive(Debug)]
struct CacheEntry<T> {
    name: String,
    slot: Slot<T>,
}

/// Outcome of looking a name up in a [`ChildCache`].
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
    Absent,
    /// Known name, with its spelling as enumerated by the backing store.
    Unmaterialized(String),
    Ready(T),
}

#[derive(Debug, Default, Clone)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub refreshes: u64,
    pub invalidations: u64,
    pub size: usize,
}

#[derive(Debug)]
pub struct ChildCache<T> {
    entries: HashMap<String, CacheEntry<T>>,
    fetched_at: Option<Instant>,
    /// Generation of the owner's scope the enumeration was fetched under.
    generation: u64,
    ttl: Option<Duration>,
    case_insensitive: bool,
    stats: CacheStats,
}

impl<T: Clone> ChildCache<T> {
    pub fn new(ttl: Option<Duration>, case_insensitive: bool) -> Self {
        Self {
            entries: HashMap::new(),
            fetched_at: None,
            generation: 0,
            ttl,
            case_insensitive,
            stats: CacheStats::default(),
        }
    }

    fn key(&self, name: &str) -> String {
        if self.case_insensitive {
            name.to_lowercase()
        } else {
            name.to_string()
        }
    }

    /// True when the enumeration was fetched and has not expired.
    pub fn is_fresh(&self) -> bool {
        match (self.fetched_at, self.ttl) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(at), Some(ttl)) => at.elapsed() <= ttl,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn set_generation(&mut self, generation: u64) {
        self.generation = generation;
    }

    /// Installs a freshly fetched enumeration. Materialized children whose
    /// names survive are kept; the others are dropped. Returns the number of
    /// dropped materialized children.
    pub fn replace_names<I>(&mut self, names: I) -> usize
    where
        I: IntoIterator<Item = String>,
    {
        let mut old = std::mem::take(&mut self.entries);
        for name in names {
            let key = self.key(&name);
            if self.entries.contains_key(&key) {
                continue;
            }
            let slot = match old.remove(&key) {
                Some(CacheEntry {
                    slot: Slot::Ready(node),
                    ..
                }) => Slot::Ready(node),
                _ => Slot::Unmaterialized,
            };
            self.entries.insert(key, CacheEntry { name, slot });
        }
        self.fetched_at = Some(Instant::now());
        self.stats.refreshes += 1;
        old.values()
            .filter(|e| matches!(e.slot, Slot::Ready(_)))
            .count()
    }

    pub fn lookup(&mut self, name: &str) -> Lookup<T> {
        let key = self.key(name);
        match self.entries.get(&key) {
            Some(CacheEntry {
                slot: Slot::Ready(node),
                ..
            }) => {
                self.stats.hits += 1;
                Lookup::Ready(node.clone())
            }
            Some(entry) => {
                self.stats.misses += 1;
                Lookup::Unmaterialized(entry.name.clone())
            }
            None => {
                self.stats.misses += 1;
                Lookup::Absent
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&self.key(name))
    }

    /// Stores a materialized child under an already enumerated name.
    pub fn insert_materialized(&mut self, name: &str, node: T) {
        let key = self.key(name);
        match self.entries.get_mut(&key) {
            Some(entry) => entry.slot = Slot::Ready(node),
            None => {
                self.entries.insert(
                    key,
                    CacheEntry {
                        name: name.to_string(),
                        slot: Slot::Ready(node),
                    },
                );
            }
        }
    }

    /// Names sorted case-insensitively, exact spelling breaking ties.
    pub fn names_sorted(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.values().map(|e| e.name.clone()).collect();
        names.sort_by_cached_key(|n| (n.to_lowercase(), n.clone()));
        names.dedup();
        names
    }

    pub fn materialized(&self) -> Vec<T> {
        self.entries
            .values()
            .filter_map(|e| match &e.slot {
                Slot::Ready(node) => Some(node.clone()),
                Slot::Unmaterialized => None,
            })
            .collect()
    }

    /// Marks the enumeration stale; the next access refetches it.
    pub fn invalidate(&mut self) {
        self.fetched_at = None;
        self.stats.invalidations += 1;
    }

    /// Drops one child, materialized or not.
    pub fn remove(&mut self, name: &str) -> bool {
        let key = self.key(name);
        self.entries.remove(&key).is_some()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.fetched_at = None;
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.entries.len(),
            ..self.stats.clone()
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
