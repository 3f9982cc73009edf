use std::collections::HashMap;

use crate::obj::Value;

/// One keyspace: key -> value plus the expiry side table. Only keys
/// present in `dict` may appear in `expires`.
#[derive(Clone, Debug, Default)]
pub struct Db {
    pub dict: HashMap<Vec<u8>, Value>,
    pub expires: HashMap<Vec<u8>, u64>,
}

impl Db {
    pub fn new() -> Db {
        Db::default()
    }

    /// Remove the key if its expiration has passed. Returns true when a
    /// removal happened.
    pub fn expire_if_needed(&mut self, key: &[u8], now_ms: u64) -> bool {
        match self.expires.get(key) {
            Some(&at) if at <= now_ms => {
                self.dict.remove(key);
                self.expires.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn lookup_read(&mut self, key: &[u8], now_ms: u64) -> Option<&Value> {
        self.expire_if_needed(key, now_ms);
        self.dict.get(key)
    }

    pub fn lookup_write(&mut self, key: &[u8], now_ms: u64) -> Option<&mut Value> {
        self.expire_if_needed(key, now_ms);
        self.dict.get_mut(key)
    }

    /// Overwrite semantics: the prior value and its expiration are both
    /// dropped.
    pub fn set_value(&mut self, key: Vec<u8>, value: Value) {
        self.expires.remove(&key);
        self.dict.insert(key, value);
    }

    /// Take a value out for modification, leaving any expiration in
    /// place. Pair with `put_value`.
    pub fn take_value(&mut self, key: &[u8]) -> Option<Value> {
        self.dict.remove(key)
    }

    /// Re-insert a value taken with `take_value`; the expiry side table
    /// is untouched.
    pub fn put_value(&mut self, key: Vec<u8>, value: Value) {
        self.dict.insert(key, value);
    }

    pub fn remove(&mut self, key: &[u8]) -> Option<Value> {
        self.expires.remove(key);
        self.dict.remove(key)
    }

    /// Set an absolute expiration. Fails (false) when the key is absent.
    pub fn set_expire(&mut self, key: &[u8], at_ms: u64) -> bool {
        if self.dict.contains_key(key) {
            self.expires.insert(key.to_vec(), at_ms);
            true
        } else {
            false
        }
    }

    pub fn expire_at(&self, key: &[u8]) -> Option<u64> {
        self.expires.get(key).copied()
    }

    pub fn persist(&mut self, key: &[u8]) -> bool {
        self.expires.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.dict.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dict.is_empty()
    }

    pub fn flush(&mut self) -> usize {
        let n = self.dict.len();
        self.dict.clear();
        self.expires.clear();
        n
    }

    /// Sample up to `budget` keys with an expiration and remove the
    /// stale ones. Returns the number removed.
    pub fn active_expire_cycle(&mut self, now_ms: u64, budget: usize) -> usize {
        let stale: Vec<Vec<u8>> = self
            .expires
            .iter()
            .take(budget)
            .filter(|(_, &at)| at <= now_ms)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            self.dict.remove(key);
            self.expires.remove(key);
        }
        stale.len()
    }

    /// The volatile key closest to expiring, sampled from the expiry
    /// table. Used by the soft max-memory eviction.
    pub fn nearest_volatile(&self, sample: usize) -> Option<Vec<u8>> {
        self.expires
            .iter()
            .take(sample)
            .min_by_key(|(_, &at)| at)
            .map(|(k, _)| k.clone())
    }

    /// Rough memory footprint of this keyspace.
    pub fn approx_bytes(&self) -> usize {
        self.dict
            .iter()
            .map(|(k, v)| k.len() + 56 + v.approx_size())
            .sum::<usize>()
            + self.expires.len() * 64
    }
}

/// The N isolated keyspaces a server instance hosts. Cloning produces
/// the point-in-time view the background savers serialize.
#[derive(Clone, Debug)]
pub struct Databases {
    dbs: Vec<Db>,
}

impl Databases {
    pub fn new(count: usize) -> Databases {
        Databases {
            dbs: (0..count).map(|_| Db::new()).collect(),
        }
    }

    pub fn count(&self) -> usize {
        self.dbs.len()
    }

    pub fn get(&self, index: usize) -> &Db {
        &self.dbs[index]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut Db {
        &mut self.dbs[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Db)> + '_ {
        self.dbs.iter().enumerate()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut Db)> + '_ {
        self.dbs.iter_mut().enumerate()
    }

    /// FLUSHALL: clear every keyspace, returning the number of keys
    /// dropped.
    pub fn flush_all(&mut self) -> usize {
        self.dbs.iter_mut().map(|db| db.flush()).sum()
    }

    pub fn total_keys(&self) -> usize {
        self.dbs.iter().map(|db| db.len()).sum()
    }

    pub fn used_memory(&self) -> usize {
        self.dbs.iter().map(|db| db.approx_bytes()).sum()
    }
}
