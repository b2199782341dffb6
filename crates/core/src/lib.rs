//! Ballast core types: kinds, keys, generations, the `Storable` trait and
//! the explicit per-kind type catalog shared by every other crate.

#![forbid(unsafe_code)]

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod error;

pub use error::{BallastError, BallastResult, Offender, ValidationError};

/// Kind of a persistent object ("service", "contract", "policy", ...).
/// Kinds are static: the set of recognized kinds is fixed at compile time.
pub type Kind = &'static str;

/// Namespace reserved for runtime objects (policy snapshots, revisions).
pub const SYSTEM_NS: &str = "system";

/// Monotonic version number per (kind, key). Zero means "last or empty".
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Generation(pub u64);

impl Generation {
    /// "Last or empty" marker generation.
    pub const EMPTY: Generation = Generation(0);
    /// First generation assigned to a newly created object.
    pub const FIRST: Generation = Generation(1);

    pub fn next(self) -> Generation {
        Generation(self.0 + 1)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Zero-padded rendering whose byte order equals numeric order.
    /// Index value lists rely on this to make head/tail selection meaningful.
    pub fn padded(self) -> String {
        format!("{:020}", self.0)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Generation {
    type Err = BallastError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(BallastError::Malformed("invalid generation: empty".into()));
        }
        let trimmed = s.trim_start_matches('0');
        let digits = if trimmed.is_empty() { "0" } else { trimmed };
        digits
            .parse::<u64>()
            .map(Generation)
            .map_err(|e| BallastError::Malformed(format!("invalid generation {:?}: {}", s, e)))
    }
}

/// Object metadata embedded (flattened) at the top level of every storable
/// object. The `kind` field doubles as the codec's type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub generation: Generation,
}

impl Metadata {
    pub fn new(kind: Kind, namespace: &str, name: &str) -> Metadata {
        Metadata {
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            generation: Generation::EMPTY,
        }
    }
}

/// Build the storage key `namespace/kind/name`.
pub fn object_key(namespace: &str, kind: &str, name: &str) -> String {
    format!("{}/{}/{}", namespace, kind, name)
}

/// A typed, namespaced, optionally versioned object.
///
/// Every kind declares its schema explicitly: `TypeInfo` lists the indexed
/// field names and `index_value` returns the (already transformed) value for
/// each of them. No runtime reflection over fields.
pub trait Storable: Any + Send + Sync + fmt::Debug {
    fn type_info(&self) -> &'static TypeInfo;
    fn metadata(&self) -> &Metadata;
    fn metadata_mut(&mut self) -> &mut Metadata;

    /// Transformed value for an indexed field, `None` when the field should
    /// not be indexed for this particular object.
    fn index_value(&self, _field: &str) -> Option<serde_json::Value> {
        None
    }

    /// Canonical value tree (sorted keys via `serde_json::Map`).
    fn to_value(&self) -> BallastResult<serde_json::Value>;

    fn as_any(&self) -> &dyn Any;
    fn boxed_clone(&self) -> Box<dyn Storable>;
}

impl dyn Storable {
    pub fn kind(&self) -> &str {
        self.type_info().kind
    }

    pub fn namespace(&self) -> &str {
        &self.metadata().namespace
    }

    pub fn name(&self) -> &str {
        &self.metadata().name
    }

    pub fn generation(&self) -> Generation {
        self.metadata().generation
    }

    pub fn set_generation(&mut self, gen: Generation) {
        self.metadata_mut().generation = gen;
    }

    /// Storage key `namespace/kind/name`.
    pub fn key(&self) -> String {
        object_key(self.namespace(), self.kind(), self.name())
    }

    pub fn downcast_ref<T: Storable>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

impl Clone for Box<dyn Storable> {
    fn clone(&self) -> Self {
        self.boxed_clone()
    }
}

/// Static schema for one object kind.
pub struct TypeInfo {
    pub kind: Kind,
    /// Versioned kinds keep history; non-versioned kinds hold one value.
    pub versioned: bool,
    /// Fields maintained as listgen indexes.
    pub indexed_fields: &'static [&'static str],
    /// Decode a canonical value tree into the concrete type.
    pub decode: fn(serde_json::Value) -> BallastResult<Box<dyn Storable>>,
}

impl fmt::Debug for TypeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeInfo")
            .field("kind", &self.kind)
            .field("versioned", &self.versioned)
            .field("indexed_fields", &self.indexed_fields)
            .finish()
    }
}

/// Decode helper for `TypeInfo::decode` implementations.
pub fn decode_as<T: Storable + serde::de::DeserializeOwned>(
    value: serde_json::Value,
) -> BallastResult<Box<dyn Storable>> {
    let obj: T = serde_json::from_value(value)
        .map_err(|e| BallastError::Malformed(format!("decoding object: {}", e)))?;
    Ok(Box::new(obj))
}

/// Catalog of recognized kinds. Assembled once per process by the embedding
/// layer from the policy kinds plus the runtime kinds.
pub struct Types {
    by_kind: HashMap<Kind, &'static TypeInfo>,
}

impl Types {
    pub fn new(infos: &[&'static TypeInfo]) -> Types {
        let mut by_kind = HashMap::new();
        for info in infos {
            let prev = by_kind.insert(info.kind, *info);
            assert!(prev.is_none(), "duplicate kind registered: {}", info.kind);
        }
        Types { by_kind }
    }

    pub fn get(&self, kind: &str) -> BallastResult<&'static TypeInfo> {
        self.by_kind
            .get(kind)
            .copied()
            .ok_or_else(|| BallastError::UnknownKind(kind.to_string()))
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.by_kind.contains_key(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = Kind> + '_ {
        self.by_kind.keys().copied()
    }
}

impl fmt::Debug for Types {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.by_kind.keys().collect();
        kinds.sort();
        f.debug_struct("Types").field("kinds", &kinds).finish()
    }
}

/// Implement `Storable` for a type with a `metadata: Metadata` field.
///
/// The optional block lists indexed fields with an accessor closure each:
/// `impl_storable!(Revision, REVISION_TYPE, { "policy_gen" => |o: &Revision| Some(o.policy_gen.to_string().into()) });`
#[macro_export]
macro_rules! impl_storable {
    ($ty:ty, $info:expr) => {
        $crate::impl_storable!($ty, $info, {});
    };
    ($ty:ty, $info:expr, { $($field:literal => $get:expr),* $(,)? }) => {
        impl $crate::Storable for $ty {
            fn type_info(&self) -> &'static $crate::TypeInfo {
                &$info
            }

            fn metadata(&self) -> &$crate::Metadata {
                &self.metadata
            }

            fn metadata_mut(&mut self) -> &mut $crate::Metadata {
                &mut self.metadata
            }

            #[allow(unused_variables)]
            fn index_value(&self, field: &str) -> Option<serde_json::Value> {
                match field {
                    $($field => ($get)(self),)*
                    _ => None,
                }
            }

            fn to_value(&self) -> $crate::BallastResult<serde_json::Value> {
                serde_json::to_value(self).map_err(|e| {
                    $crate::BallastError::Malformed(format!("encoding object: {}", e))
                })
            }

            fn as_any(&self) -> &dyn std::any::Any {
                self
            }

            fn boxed_clone(&self) -> Box<dyn $crate::Storable> {
                Box::new(self.clone())
            }
        }
    };
}
