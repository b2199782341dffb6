//! Index layer: per-kind index sets and the sorted generation-list container.
//!
//! Two index shapes exist. `lastgen/<ns>/<kind>/<name>` holds the highest
//! existing generation for a versioned object. `listgen/<ns>/<kind>/<name>/
//! <field>=<value>` maps a transformed field value to the sorted list of
//! generations whose object carried that value. Index writes always happen in
//! the same transaction as the object write.

use ballast_core::{BallastError, BallastResult, Generation, Storable, TypeInfo};
use serde::{Deserialize, Serialize};

/// Index shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    LastGen,
    ListGen,
}

/// One index over a kind: `LastGen` has no field, `ListGen` has exactly one.
#[derive(Debug, Clone)]
pub struct Index {
    pub kind: IndexKind,
    pub field: Option<&'static str>,
}

impl Index {
    /// Index entry key for a concrete object, or None when the object does
    /// not produce a value for this index's field.
    pub fn key_for_storable(&self, obj: &dyn Storable) -> Option<String> {
        match self.kind {
            IndexKind::LastGen => Some(self.key_for_value(&obj.key(), None)),
            IndexKind::ListGen => {
                let field = self.field.expect("listgen index without field");
                let value = obj.index_value(field)?;
                Some(self.key_for_value(&obj.key(), Some(&value)))
            }
        }
    }

    /// Index entry key for an explicit (object key, value) pair.
    pub fn key_for_value(&self, key: &str, value: Option<&serde_json::Value>) -> String {
        match self.kind {
            IndexKind::LastGen => format!("lastgen/{}", key),
            IndexKind::ListGen => {
                let field = self.field.expect("listgen index without field");
                let value = value.expect("listgen index without value");
                format!("listgen/{}/{}={}", key, field, index_value_string(value))
            }
        }
    }
}

/// Render a field value for embedding into an index key: strings verbatim,
/// integers (generations included) via decimal display, anything else as
/// compact canonical JSON.
pub fn index_value_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        other => ballast_codec::compact_json(other),
    }
}

/// The index set of one kind, derived from its `TypeInfo`.
#[derive(Debug, Clone)]
pub struct Indexes {
    pub list: Vec<Index>,
}

impl Indexes {
    pub fn for_type(info: &'static TypeInfo) -> Indexes {
        let mut list = Vec::new();
        if info.versioned {
            list.push(Index { kind: IndexKind::LastGen, field: None });
        }
        for field in info.indexed_fields {
            list.push(Index { kind: IndexKind::ListGen, field: Some(field) });
        }
        Indexes { list }
    }

    pub fn lastgen(&self) -> Option<&Index> {
        self.list.iter().find(|i| i.kind == IndexKind::LastGen)
    }

    pub fn listgen(&self, field: &str) -> Option<&Index> {
        self.list
            .iter()
            .find(|i| i.kind == IndexKind::ListGen && i.field == Some(field))
    }
}

/// Sorted list of generation entries, stored marshaled as a sequence.
/// Entries are zero-padded decimal strings, so byte order equals numeric
/// order and head/tail selection means lowest/highest generation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IndexValueList(Vec<String>);

impl IndexValueList {
    pub fn new() -> IndexValueList {
        IndexValueList::default()
    }

    pub fn unmarshal(data: &[u8]) -> BallastResult<IndexValueList> {
        serde_json::from_slice(data)
            .map_err(|e| BallastError::Malformed(format!("decoding index value list: {}", e)))
    }

    pub fn marshal(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("index value list serializes")
    }

    pub fn add(&mut self, gen: Generation) {
        let entry = gen.padded();
        if let Err(pos) = self.0.binary_search(&entry) {
            self.0.insert(pos, entry);
        }
    }

    pub fn remove(&mut self, gen: Generation) {
        let entry = gen.padded();
        if let Ok(pos) = self.0.binary_search(&entry) {
            self.0.remove(pos);
        }
    }

    pub fn contains(&self, gen: Generation) -> bool {
        self.0.binary_search(&gen.padded()).is_ok()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn first(&self) -> Option<Generation> {
        self.0.first().and_then(|s| s.parse().ok())
    }

    pub fn last(&self) -> Option<Generation> {
        self.0.last().and_then(|s| s.parse().ok())
    }

    pub fn generations(&self) -> impl Iterator<Item = Generation> + '_ {
        self.0.iter().filter_map(|s| s.parse().ok())
    }
}
