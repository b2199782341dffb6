//! Key-value store contract and the in-memory driver.
//!
//! The object layer performs every multi-key mutation through `transact`;
//! nothing writes around a transaction. Drivers signal optimistic-concurrency
//! failures with `BallastError::ConflictRetry`, which the object layer retries
//! a bounded number of times.

use std::collections::BTreeMap;
use std::sync::Mutex;

use ballast_core::{BallastError, BallastResult};

/// Mutation handle inside a transaction. Reads observe uncommitted writes
/// made earlier in the same transaction.
pub trait Txn {
    fn get(&self, key: &str) -> BallastResult<Option<Vec<u8>>>;
    fn put(&mut self, key: &str, value: &[u8]) -> BallastResult<()>;
    fn delete(&mut self, key: &str) -> BallastResult<()>;
    fn range(&self, prefix: &str) -> BallastResult<Vec<(String, Vec<u8>)>>;
}

/// Driver contract. `range` returns pairs sorted by key.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> BallastResult<Option<Vec<u8>>>;
    fn put(&self, key: &str, value: &[u8]) -> BallastResult<()>;
    fn delete(&self, key: &str) -> BallastResult<()>;
    fn range(&self, prefix: &str) -> BallastResult<Vec<(String, Vec<u8>)>>;

    /// Run `f` atomically: either every write commits or none does. A driver
    /// may fail with `ConflictRetry`, in which case the caller re-runs `f`.
    fn transact(
        &self,
        f: &mut dyn FnMut(&mut dyn Txn) -> BallastResult<()>,
    ) -> BallastResult<()>;
}

/// In-memory driver: a BTreeMap behind a mutex. Transactions stage writes in
/// an overlay and merge on commit; the map lock is held for the duration, so
/// conflicts cannot occur.
#[derive(Default)]
pub struct MemoryKv {
    map: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryKv {
    pub fn new() -> MemoryKv {
        MemoryKv::default()
    }
}

struct MemTxn<'a> {
    base: &'a BTreeMap<String, Vec<u8>>,
    // key -> Some(value) for puts, None for deletes
    staged: BTreeMap<String, Option<Vec<u8>>>,
}

impl Txn for MemTxn<'_> {
    fn get(&self, key: &str) -> BallastResult<Option<Vec<u8>>> {
        match self.staged.get(key) {
            Some(v) => Ok(v.clone()),
            None => Ok(self.base.get(key).cloned()),
        }
    }

    fn put(&mut self, key: &str, value: &[u8]) -> BallastResult<()> {
        self.staged.insert(key.to_string(), Some(value.to_vec()));
        Ok(())
    }

    fn delete(&mut self, key: &str) -> BallastResult<()> {
        self.staged.insert(key.to_string(), None);
        Ok(())
    }

    fn range(&self, prefix: &str) -> BallastResult<Vec<(String, Vec<u8>)>> {
        let mut merged: BTreeMap<&str, Option<&Vec<u8>>> = self
            .base
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.as_str(), Some(v)))
            .collect();
        for (k, v) in &self.staged {
            if k.starts_with(prefix) {
                merged.insert(k.as_str(), v.as_ref());
            }
        }
        Ok(merged
            .into_iter()
            .filter_map(|(k, v)| v.map(|v| (k.to_string(), v.clone())))
            .collect())
    }
}

impl KvStore for MemoryKv {
    fn get(&self, key: &str) -> BallastResult<Option<Vec<u8>>> {
        Ok(self.map.lock().unwrap().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> BallastResult<()> {
        self.map.lock().unwrap().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> BallastResult<()> {
        self.map.lock().unwrap().remove(key);
        Ok(())
    }

    fn range(&self, prefix: &str) -> BallastResult<Vec<(String, Vec<u8>)>> {
        let map = self.map.lock().unwrap();
        Ok(map
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn transact(
        &self,
        f: &mut dyn FnMut(&mut dyn Txn) -> BallastResult<()>,
    ) -> BallastResult<()> {
        let mut map = self
            .map
            .lock()
            .map_err(|_| BallastError::StoreUnavailable("memory store poisoned".into()))?;
        let mut txn = MemTxn { base: &map, staged: BTreeMap::new() };
        f(&mut txn)?;
        let staged = txn.staged;
        for (k, v) in staged {
            match v {
                Some(v) => {
                    map.insert(k, v);
                }
                None => {
                    map.remove(&k);
                }
            }
        }
        Ok(())
    }
}
