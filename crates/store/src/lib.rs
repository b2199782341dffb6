//! Ballast object store: generational, indexed persistence over a
//! transactional key-value driver.
//!
//! Layout:
//!   /object/<ns>/<kind>/<name>@<gen>                 marshaled object
//!   /index/lastgen/<ns>/<kind>/<name>                current highest generation
//!   /index/listgen/<ns>/<kind>/<name>/<field>=<val>  marshaled generation list
//!
//! Multi-key mutations (object + its indexes) always run inside a single
//! driver transaction; `ConflictRetry` is retried up to a configured bound.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ballast_codec::Codec;
use ballast_core::{BallastError, BallastResult, Generation, Kind, Storable, TypeInfo, Types};
use metrics::{counter, histogram};
use tracing::debug;

pub mod index;
pub mod kv;
pub mod sqlite;

pub use index::{Index, IndexKind, IndexValueList, Indexes};
pub use kv::{KvStore, MemoryKv, Txn};
pub use sqlite::SqliteKv;

/// Store configuration. `endpoints`/`dial_timeout`/`keepalive` belong to the
/// distributed coordinator driver and are carried here so that driver can be
/// added behind `KvStore` without an API change.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub prefix: String,
    pub txn_retries: usize,
    pub endpoints: Vec<String>,
    pub dial_timeout_secs: u64,
    pub keepalive_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> StoreConfig {
        StoreConfig {
            prefix: String::new(),
            txn_retries: 5,
            endpoints: Vec::new(),
            dial_timeout_secs: 30,
            keepalive_secs: 30,
        }
    }
}

impl StoreConfig {
    pub fn from_env() -> StoreConfig {
        let mut cfg = StoreConfig::default();
        if let Ok(prefix) = std::env::var("BALLAST_STORE_PREFIX") {
            cfg.prefix = prefix;
        }
        if let Some(retries) =
            std::env::var("BALLAST_TXN_RETRIES").ok().and_then(|s| s.parse().ok())
        {
            cfg.txn_retries = retries;
        }
        if let Ok(endpoints) = std::env::var("BALLAST_STORE_ENDPOINTS") {
            cfg.endpoints = endpoints.split(',').map(|s| s.trim().to_string()).collect();
        }
        cfg
    }

    fn normalized_prefix(&self) -> String {
        let trimmed = self.prefix.trim_matches('/');
        if trimmed.is_empty() {
            String::new()
        } else {
            format!("/{}", trimmed)
        }
    }
}

/// Save mode. Default assigns generations; `replace` trusts the caller's.
#[derive(Debug, Clone, Copy, Default)]
pub struct SaveOpts {
    pub replace_or_force_gen: bool,
}

impl SaveOpts {
    pub fn replace() -> SaveOpts {
        SaveOpts { replace_or_force_gen: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Select {
    First,
    Last,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    Single,
    List,
}

/// Query options for `find_one`/`find_list`. Exactly one of the three query
/// shapes must be used: key prefix, key (+ generation), or key + field
/// equality (optionally narrowed to the first or last generation).
#[derive(Debug, Clone, Default)]
pub struct FindOpts {
    key_prefix: Option<String>,
    key: Option<String>,
    gen: Option<Generation>,
    field: Option<(String, serde_json::Value)>,
    select: Option<Select>,
}

impl FindOpts {
    pub fn by_prefix(prefix: &str) -> FindOpts {
        FindOpts { key_prefix: Some(prefix.to_string()), ..FindOpts::default() }
    }

    pub fn by_key(key: &str) -> FindOpts {
        FindOpts { key: Some(key.to_string()), ..FindOpts::default() }
    }

    pub fn gen(mut self, gen: Generation) -> FindOpts {
        self.gen = Some(gen);
        self
    }

    pub fn by_field(key: &str, field: &str, value: serde_json::Value) -> FindOpts {
        FindOpts {
            key: Some(key.to_string()),
            field: Some((field.to_string(), value)),
            ..FindOpts::default()
        }
    }

    pub fn first(mut self) -> FindOpts {
        self.select = Some(Select::First);
        self
    }

    pub fn last(mut self) -> FindOpts {
        self.select = Some(Select::Last);
        self
    }

    fn shape(&self) -> BallastResult<Shape> {
        match (&self.key_prefix, &self.key, &self.field) {
            (Some(_), None, None) if self.gen.is_none() && self.select.is_none() => {
                Ok(Shape::List)
            }
            (None, Some(_), None) if self.select.is_none() => Ok(Shape::Single),
            (None, Some(_), Some(_)) if self.gen.is_none() => {
                Ok(if self.select.is_some() { Shape::Single } else { Shape::List })
            }
            _ => Err(BallastError::Malformed(
                "find options must be a key prefix, a key with optional generation, \
                 or a key with a field equality"
                    .into(),
            )),
        }
    }
}

/// Generational object store over a kv driver.
pub struct ObjectStore {
    kv: Arc<dyn KvStore>,
    types: &'static Types,
    codec: Codec,
    cfg: StoreConfig,
    prefix: String,
    // Index sets are derived from TypeInfo on first use and memoized for the
    // lifetime of this store instance.
    indexes: Mutex<HashMap<Kind, Arc<Indexes>>>,
}

impl ObjectStore {
    pub fn new(kv: Arc<dyn KvStore>, types: &'static Types, cfg: StoreConfig) -> ObjectStore {
        let prefix = cfg.normalized_prefix();
        ObjectStore {
            kv,
            types,
            codec: Codec::new(types),
            cfg,
            prefix,
            indexes: Mutex::new(HashMap::new()),
        }
    }

    pub fn in_memory(types: &'static Types) -> ObjectStore {
        ObjectStore::new(Arc::new(MemoryKv::new()), types, StoreConfig::default())
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn types(&self) -> &'static Types {
        self.types
    }

    fn indexes_for(&self, info: &'static TypeInfo) -> Arc<Indexes> {
        let mut cache = self.indexes.lock().unwrap();
        cache.entry(info.kind).or_insert_with(|| Arc::new(Indexes::for_type(info))).clone()
    }

    fn object_path(&self, key: &str, gen: Generation) -> String {
        format!("{}/object/{}@{}", self.prefix, key, gen)
    }

    fn index_path(&self, index_key: &str) -> String {
        format!("{}/index/{}", self.prefix, index_key)
    }

    /// Save an object. Returns true when the store changed (a new generation
    /// was written), false when the object matched its last generation. The
    /// object's generation field is updated in place either way.
    pub fn save(&self, obj: &mut dyn Storable, opts: SaveOpts) -> BallastResult<bool> {
        let started = std::time::Instant::now();
        let info = self.types.get(obj.kind())?;
        counter!("store_save_total", 1u64);

        if !info.versioned {
            obj.set_generation(Generation::EMPTY);
            let path = self.object_path(&obj.key(), Generation::EMPTY);
            let data = self.codec.marshal(obj)?;
            self.kv.put(&path, &data)?;
            return Ok(true);
        }

        let indexes = self.indexes_for(info);
        let mut changed = false;
        self.with_retry(&mut |txn| {
            changed = if opts.replace_or_force_gen {
                self.save_replace(txn, obj, &indexes)?
            } else {
                self.save_next_gen(txn, obj, &indexes)?
            };
            Ok(())
        })?;
        histogram!("store_save_ms", started.elapsed().as_secs_f64() * 1000.0);
        if !changed {
            counter!("store_save_noop_total", 1u64);
        }
        Ok(changed)
    }

    fn save_next_gen(
        &self,
        txn: &mut dyn Txn,
        obj: &mut dyn Storable,
        indexes: &Indexes,
    ) -> BallastResult<bool> {
        let key = obj.key();
        let lastgen_idx = indexes.lastgen().expect("versioned kind has a lastgen index");
        let lastgen_path = self.index_path(&lastgen_idx.key_for_value(&key, None));

        let gen = match txn.get(&lastgen_path)? {
            None => Generation::FIRST,
            Some(raw) => {
                let last = parse_gen_bytes(&raw)?;
                let prev_raw = txn.get(&self.object_path(&key, last))?.ok_or_else(|| {
                    BallastError::Malformed(format!(
                        "lastgen index for {} is corrupted: generation {} missing",
                        key, last
                    ))
                })?;
                let prev = self.codec.unmarshal_one(&prev_raw)?;
                let prev_bytes = self.codec.marshal_without_generation(prev.as_ref())?;
                let new_bytes = self.codec.marshal_without_generation(obj)?;
                if prev_bytes == new_bytes {
                    // unchanged: report the existing generation, write nothing
                    obj.set_generation(last);
                    debug!(key = %key, gen = %last, "save no-op");
                    return Ok(false);
                }
                last.next()
            }
        };

        obj.set_generation(gen);
        let data = self.codec.marshal(obj)?;
        txn.put(&self.object_path(&key, gen), &data)?;
        self.write_indexes(txn, obj, indexes, gen)?;
        debug!(key = %key, gen = %gen, "object saved");
        Ok(true)
    }

    fn save_replace(
        &self,
        txn: &mut dyn Txn,
        obj: &mut dyn Storable,
        indexes: &Indexes,
    ) -> BallastResult<bool> {
        let gen = obj.generation();
        if gen.is_empty() {
            return Err(BallastError::Malformed(format!(
                "saving {} with replace-or-force-gen requires an explicit generation",
                obj.key()
            )));
        }
        let key = obj.key();
        let obj_path = self.object_path(&key, gen);

        // A displaced object at this generation leaves the indexes first.
        if let Some(old_raw) = txn.get(&obj_path)? {
            let old = self.codec.unmarshal_one(&old_raw)?;
            self.remove_listgen_entries(txn, old.as_ref(), indexes, gen)?;
        }

        let data = self.codec.marshal(obj)?;
        txn.put(&obj_path, &data)?;

        // lastgen keeps pointing at the highest existing generation
        if let Some(lastgen_idx) = indexes.lastgen() {
            let lastgen_path = self.index_path(&lastgen_idx.key_for_value(&key, None));
            let current = match txn.get(&lastgen_path)? {
                Some(raw) => Some(parse_gen_bytes(&raw)?),
                None => None,
            };
            if current.map_or(true, |c| c < gen) {
                txn.put(&lastgen_path, gen.to_string().as_bytes())?;
            }
        }
        for idx in &indexes.list {
            if idx.kind == IndexKind::ListGen {
                if let Some(ikey) = idx.key_for_storable(obj) {
                    self.listgen_add(txn, &ikey, gen)?;
                }
            }
        }
        Ok(true)
    }

    fn write_indexes(
        &self,
        txn: &mut dyn Txn,
        obj: &dyn Storable,
        indexes: &Indexes,
        gen: Generation,
    ) -> BallastResult<()> {
        for idx in &indexes.list {
            match idx.kind {
                IndexKind::LastGen => {
                    let path = self.index_path(&idx.key_for_value(&obj.key(), None));
                    txn.put(&path, gen.to_string().as_bytes())?;
                }
                IndexKind::ListGen => {
                    if let Some(ikey) = idx.key_for_storable(obj) {
                        self.listgen_add(txn, &ikey, gen)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn listgen_add(&self, txn: &mut dyn Txn, index_key: &str, gen: Generation) -> BallastResult<()> {
        let path = self.index_path(index_key);
        let mut list = match txn.get(&path)? {
            Some(raw) => IndexValueList::unmarshal(&raw)?,
            None => IndexValueList::new(),
        };
        list.add(gen);
        txn.put(&path, &list.marshal())
    }

    fn remove_listgen_entries(
        &self,
        txn: &mut dyn Txn,
        obj: &dyn Storable,
        indexes: &Indexes,
        gen: Generation,
    ) -> BallastResult<()> {
        for idx in &indexes.list {
            if idx.kind != IndexKind::ListGen {
                continue;
            }
            if let Some(ikey) = idx.key_for_storable(obj) {
                let path = self.index_path(&ikey);
                if let Some(raw) = txn.get(&path)? {
                    let mut list = IndexValueList::unmarshal(&raw)?;
                    list.remove(gen);
                    if list.is_empty() {
                        txn.delete(&path)?;
                    } else {
                        txn.put(&path, &list.marshal())?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Remove every stored generation of an object and scrub its index
    /// entries, in one transaction.
    pub fn delete(&self, kind: &str, key: &str) -> BallastResult<()> {
        let info = self.types.get(kind)?;
        let indexes = self.indexes_for(info);
        self.with_retry(&mut |txn| {
            let stored = txn.range(&format!("{}/object/{}@", self.prefix, key))?;
            for (path, raw) in stored {
                let obj = self.codec.unmarshal_one(&raw)?;
                self.remove_listgen_entries(txn, obj.as_ref(), &indexes, obj.generation())?;
                txn.delete(&path)?;
            }
            if let Some(lastgen_idx) = indexes.lastgen() {
                txn.delete(&self.index_path(&lastgen_idx.key_for_value(key, None)))?;
            }
            Ok(())
        })
    }

    /// Query expecting a single object (key + generation, or field equality
    /// narrowed with first/last).
    pub fn find_one(&self, kind: &str, opts: FindOpts) -> BallastResult<Option<Box<dyn Storable>>> {
        if opts.shape()? != Shape::Single {
            return Err(BallastError::ShapeMismatch(format!(
                "find options for {} describe a sequence, not a single object",
                kind
            )));
        }
        let info = self.types.get(kind)?;
        let key = opts.key.as_deref().expect("single shape has a key");
        match &opts.field {
            None => {
                let gen = opts.gen.unwrap_or(Generation::EMPTY);
                self.read_at(info, key, gen)
            }
            Some((field, value)) => {
                let list = self.listgen_list(info, key, field, value)?;
                let gen = match opts.select.expect("single shape has a selector") {
                    Select::First => list.first(),
                    Select::Last => list.last(),
                };
                match gen {
                    Some(gen) => self.read_at(info, key, gen),
                    None => Ok(None),
                }
            }
        }
    }

    /// Query expecting a sequence (key prefix, or field equality).
    pub fn find_list(&self, kind: &str, opts: FindOpts) -> BallastResult<Vec<Box<dyn Storable>>> {
        if opts.shape()? != Shape::List {
            return Err(BallastError::ShapeMismatch(format!(
                "find options for {} describe a single object, not a sequence",
                kind
            )));
        }
        let info = self.types.get(kind)?;
        match (&opts.key_prefix, &opts.field) {
            (Some(prefix), None) => {
                let pairs = self.kv.range(&format!("{}/object/{}", self.prefix, prefix))?;
                let mut out = Vec::with_capacity(pairs.len());
                for (_, raw) in pairs {
                    let obj = self.codec.unmarshal_one(&raw)?;
                    if obj.kind() == kind {
                        out.push(obj);
                    }
                }
                Ok(out)
            }
            (None, Some((field, value))) => {
                let key = opts.key.as_deref().expect("field shape has a key");
                let list = self.listgen_list(info, key, field, value)?;
                let mut out = Vec::with_capacity(list.len());
                for gen in list.generations() {
                    let obj = self.read_at(info, key, gen)?.ok_or_else(|| {
                        BallastError::Malformed(format!(
                            "listgen index for {} is corrupted: generation {} missing",
                            key, gen
                        ))
                    })?;
                    out.push(obj);
                }
                Ok(out)
            }
            _ => unreachable!("shape() validated the combination"),
        }
    }

    /// Typed single-object query.
    pub fn find_one_as<T: Storable + Clone>(
        &self,
        kind: &str,
        opts: FindOpts,
    ) -> BallastResult<Option<T>> {
        match self.find_one(kind, opts)? {
            None => Ok(None),
            Some(obj) => obj
                .downcast_ref::<T>()
                .cloned()
                .map(Some)
                .ok_or_else(|| BallastError::ShapeMismatch(format!("object is not a {}", kind))),
        }
    }

    fn read_at(
        &self,
        info: &'static TypeInfo,
        key: &str,
        gen: Generation,
    ) -> BallastResult<Option<Box<dyn Storable>>> {
        let gen = if gen.is_empty() && info.versioned {
            let indexes = self.indexes_for(info);
            let lastgen_idx = indexes.lastgen().expect("versioned kind has a lastgen index");
            match self.kv.get(&self.index_path(&lastgen_idx.key_for_value(key, None)))? {
                Some(raw) => parse_gen_bytes(&raw)?,
                None => return Ok(None),
            }
        } else {
            gen
        };
        match self.kv.get(&self.object_path(key, gen))? {
            Some(raw) => {
                let obj = self.codec.unmarshal_one(&raw)?;
                if obj.kind() != info.kind {
                    return Err(BallastError::ShapeMismatch(format!(
                        "object at {} has kind {}, expected {}",
                        key,
                        obj.kind(),
                        info.kind
                    )));
                }
                Ok(Some(obj))
            }
            None => Ok(None),
        }
    }

    fn listgen_list(
        &self,
        info: &'static TypeInfo,
        key: &str,
        field: &str,
        value: &serde_json::Value,
    ) -> BallastResult<IndexValueList> {
        let indexes = self.indexes_for(info);
        let idx = indexes.listgen(field).ok_or_else(|| {
            BallastError::Malformed(format!("kind {} has no index on field {}", info.kind, field))
        })?;
        let path = self.index_path(&idx.key_for_value(key, Some(value)));
        match self.kv.get(&path)? {
            Some(raw) => IndexValueList::unmarshal(&raw),
            None => Ok(IndexValueList::new()),
        }
    }

    /// Direct read/write of non-object layouts (`/policy/<gen>`,
    /// `/revision/<policy_gen>/<rev_gen>`). The store prefix still applies.
    pub fn put_raw(&self, path: &str, data: &[u8]) -> BallastResult<()> {
        self.kv.put(&format!("{}{}", self.prefix, path), data)
    }

    pub fn get_raw(&self, path: &str) -> BallastResult<Option<Vec<u8>>> {
        self.kv.get(&format!("{}{}", self.prefix, path))
    }

    pub fn range_raw(&self, prefix: &str) -> BallastResult<Vec<(String, Vec<u8>)>> {
        self.kv.range(&format!("{}{}", self.prefix, prefix))
    }

    fn with_retry(
        &self,
        f: &mut dyn FnMut(&mut dyn Txn) -> BallastResult<()>,
    ) -> BallastResult<()> {
        let mut attempts = 0usize;
        loop {
            match self.kv.transact(&mut *f) {
                Err(BallastError::ConflictRetry) if attempts + 1 < self.cfg.txn_retries.max(1) => {
                    attempts += 1;
                    counter!("store_txn_conflicts_total", 1u64);
                    debug!(attempts, "transaction conflict, retrying");
                }
                other => return other,
            }
        }
    }
}

fn parse_gen_bytes(raw: &[u8]) -> BallastResult<Generation> {
    std::str::from_utf8(raw)
        .map_err(|e| BallastError::Malformed(format!("generation bytes: {}", e)))?
        .parse()
}
