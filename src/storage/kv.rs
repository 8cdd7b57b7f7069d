//! In-process key-value store
//!
//! DashMap shards give per-key atomicity, which is all compare-and-swap,
//! set-if-absent and list trimming need. Expiry is lazy: an expired entry is
//! treated as absent and removed on the next touch.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::Duration;

use super::{ttl_to_chrono, AdapterHealth, KvStore};
use crate::clock::{system_clock, SharedClock};
use crate::errors::{MemoryError, Result};

#[derive(Debug, Clone)]
enum KvValue {
    Bytes(Vec<u8>),
    List(VecDeque<Vec<u8>>),
}

#[derive(Debug, Clone)]
struct KvEntry {
    value: KvValue,
    expires_at: Option<DateTime<Utc>>,
}

impl KvEntry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug)]
pub struct MemoryKv {
    entries: DashMap<String, KvEntry>,
    clock: SharedClock,
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new(system_clock())
    }
}

impl MemoryKv {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    fn expiry(&self, ttl: Option<Duration>) -> Option<DateTime<Utc>> {
        ttl.map(|ttl| self.clock.now() + ttl_to_chrono(ttl))
    }

    /// Drop every expired entry; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = self.clock.now();
        let expired = match self.entries.get(key) {
            Some(entry) if entry.is_live(now) => {
                return Ok(match &entry.value {
                    KvValue::Bytes(bytes) => Some(bytes.clone()),
                    KvValue::List(_) => None,
                });
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(key, |_, entry| !entry.is_live(now));
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            KvEntry {
                value: KvValue::Bytes(value.to_vec()),
                expires_at: self.expiry(ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = self.clock.now();
        Ok(self
            .entries
            .remove(key)
            .map_or(false, |(_, entry)| entry.is_live(now)))
    }

    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<bool> {
        let now = self.clock.now();
        let fresh = KvEntry {
            value: KvValue::Bytes(value.to_vec()),
            expires_at: self.expiry(ttl),
        };
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    return Ok(false);
                }
                occupied.insert(fresh);
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                Ok(true)
            }
        }
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let now = self.clock.now();
        let expires_at = self.expiry(ttl);

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = if occupied.get().is_live(now) {
                    match &occupied.get().value {
                        KvValue::Bytes(bytes) => Some(bytes.as_slice()),
                        KvValue::List(_) => {
                            return Err(MemoryError::Storage(format!(
                                "compare_and_swap on list key '{key}'"
                            )))
                        }
                    }
                } else {
                    None
                };
                if current != expected {
                    return Ok(false);
                }
                match new {
                    Some(bytes) => {
                        occupied.insert(KvEntry {
                            value: KvValue::Bytes(bytes.to_vec()),
                            expires_at,
                        });
                    }
                    None => {
                        occupied.remove();
                    }
                }
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                if expected.is_some() {
                    return Ok(false);
                }
                if let Some(bytes) = new {
                    vacant.insert(KvEntry {
                        value: KvValue::Bytes(bytes.to_vec()),
                        expires_at,
                    });
                }
                Ok(true)
            }
        }
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let now = self.clock.now();
        let mut entry = self.entries.entry(key.to_string()).or_insert(KvEntry {
            value: KvValue::Bytes(b"0".to_vec()),
            expires_at: None,
        });
        if !entry.is_live(now) {
            *entry = KvEntry {
                value: KvValue::Bytes(b"0".to_vec()),
                expires_at: None,
            };
        }
        let current = match &entry.value {
            KvValue::Bytes(bytes) => std::str::from_utf8(bytes)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or_else(|| MemoryError::Storage(format!("'{key}' is not an integer")))?,
            KvValue::List(_) => {
                return Err(MemoryError::Storage(format!("incr on list key '{key}'")))
            }
        };
        let next = current + 1;
        entry.value = KvValue::Bytes(next.to_string().into_bytes());
        Ok(next)
    }

    async fn list_push(
        &self,
        key: &str,
        value: &[u8],
        max_len: usize,
        ttl: Option<Duration>,
    ) -> Result<usize> {
        let now = self.clock.now();
        let expires_at = self.expiry(ttl);
        let mut entry = self.entries.entry(key.to_string()).or_insert(KvEntry {
            value: KvValue::List(VecDeque::new()),
            expires_at,
        });
        if !entry.is_live(now) {
            entry.value = KvValue::List(VecDeque::new());
        }
        let KvValue::List(list) = &mut entry.value else {
            return Err(MemoryError::Storage(format!("list_push on value key '{key}'")));
        };
        list.push_back(value.to_vec());
        while max_len > 0 && list.len() > max_len {
            list.pop_front();
        }
        let len = list.len();
        entry.expires_at = expires_at;
        Ok(len)
    }

    async fn list_range(&self, key: &str) -> Result<Vec<Vec<u8>>> {
        let now = self.clock.now();
        match self.entries.get(key) {
            Some(entry) if entry.is_live(now) => match &entry.value {
                KvValue::List(list) => Ok(list.iter().cloned().collect()),
                KvValue::Bytes(_) => Ok(Vec::new()),
            },
            _ => Ok(Vec::new()),
        }
    }

    async fn list_replace(
        &self,
        key: &str,
        values: &[Vec<u8>],
        ttl: Option<Duration>,
    ) -> Result<()> {
        if values.is_empty() {
            self.entries.remove(key);
            return Ok(());
        }
        self.entries.insert(
            key.to_string(),
            KvEntry {
                value: KvValue::List(values.iter().cloned().collect()),
                expires_at: self.expiry(ttl),
            },
        );
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let now = self.clock.now();
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix) && e.value().is_live(now))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn health_check(&self) -> AdapterHealth {
        AdapterHealth::ok("kv:memory")
    }
}
