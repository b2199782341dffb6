//! Canonical object codec: self-describing YAML with a top-level `kind`
//! discriminator.
//!
//! Marshal output is canonical: objects are serialized through
//! `serde_json::Value` (whose maps are BTree-backed, so keys come out sorted)
//! and rendered as YAML. Equal logical inputs therefore produce identical
//! bytes, which the generational store relies on for its no-op detection.
//! Empty fields are always emitted; round-trips must be byte-stable.

#![forbid(unsafe_code)]

use ballast_core::{BallastError, BallastResult, Storable, Types};

/// Typed codec over the kind catalog.
#[derive(Clone, Copy)]
pub struct Codec {
    types: &'static Types,
}

impl Codec {
    pub fn new(types: &'static Types) -> Codec {
        Codec { types }
    }

    pub fn types(&self) -> &'static Types {
        self.types
    }

    /// Canonical value tree for an object (sorted keys).
    pub fn canonical_value(obj: &dyn Storable) -> BallastResult<serde_json::Value> {
        obj.to_value()
    }

    /// Marshal one object to canonical YAML.
    pub fn marshal(&self, obj: &dyn Storable) -> BallastResult<Vec<u8>> {
        let value = obj.to_value()?;
        render_yaml(&value)
    }

    /// Marshal a sequence of objects to a canonical YAML list.
    pub fn marshal_many(&self, objs: &[Box<dyn Storable>]) -> BallastResult<Vec<u8>> {
        let mut values = Vec::with_capacity(objs.len());
        for obj in objs {
            values.push(obj.to_value()?);
        }
        render_yaml(&serde_json::Value::Array(values))
    }

    /// Canonical bytes with the generation field cleared. This is the
    /// comparison form for "did the object actually change".
    pub fn marshal_without_generation(&self, obj: &dyn Storable) -> BallastResult<Vec<u8>> {
        let mut value = obj.to_value()?;
        if let Some(map) = value.as_object_mut() {
            map.insert("generation".to_string(), serde_json::json!(0));
        }
        render_yaml(&value)
    }

    /// Unmarshal one document or a YAML sequence, dispatching each element by
    /// its `kind` field.
    pub fn unmarshal(&self, data: &[u8]) -> BallastResult<Vec<Box<dyn Storable>>> {
        let value: serde_yaml::Value = serde_yaml::from_slice(data)
            .map_err(|e| BallastError::Malformed(format!("parsing yaml: {}", e)))?;
        match value {
            serde_yaml::Value::Sequence(seq) => {
                let mut out = Vec::with_capacity(seq.len());
                for element in seq {
                    out.push(self.decode_element(element)?);
                }
                Ok(out)
            }
            other => Ok(vec![self.decode_element(other)?]),
        }
    }

    /// Unmarshal exactly one object.
    pub fn unmarshal_one(&self, data: &[u8]) -> BallastResult<Box<dyn Storable>> {
        let mut objs = self.unmarshal(data)?;
        match objs.len() {
            1 => Ok(objs.remove(0)),
            n => Err(BallastError::ShapeMismatch(format!(
                "expected one object, found {}",
                n
            ))),
        }
    }

    /// Unmarshal one object of a known concrete type.
    pub fn unmarshal_as<T: Storable + Clone>(&self, data: &[u8]) -> BallastResult<T> {
        let obj = self.unmarshal_one(data)?;
        obj.downcast_ref::<T>().cloned().ok_or_else(|| {
            BallastError::ShapeMismatch(format!("object has kind {:?}", obj.kind()))
        })
    }

    fn decode_element(&self, element: serde_yaml::Value) -> BallastResult<Box<dyn Storable>> {
        let value: serde_json::Value = serde_json::to_value(&element)
            .map_err(|e| BallastError::Malformed(format!("normalizing yaml value: {}", e)))?;
        let kind = value
            .get("kind")
            .and_then(|k| k.as_str())
            .ok_or_else(|| BallastError::Malformed("object is missing a kind field".into()))?;
        let info = self.types.get(kind)?;
        (info.decode)(value)
    }
}

fn render_yaml(value: &serde_json::Value) -> BallastResult<Vec<u8>> {
    serde_yaml::to_string(value)
        .map(String::into_bytes)
        .map_err(|e| BallastError::Malformed(format!("rendering yaml: {}", e)))
}

/// Compact single-line canonical JSON, used where a value must embed into a
/// flat key (listgen index entries for non-scalar fields).
pub fn compact_json(value: &serde_json::Value) -> String {
    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ballast_core::{decode_as, impl_storable, Metadata, TypeInfo};
    use once_cell::sync::Lazy;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Widget {
        #[serde(flatten)]
        metadata: Metadata,
        flavor: String,
        replicas: u64,
        note: String,
    }

    static WIDGET_TYPE: TypeInfo = TypeInfo {
        kind: "widget",
        versioned: true,
        indexed_fields: &["flavor"],
        decode: decode_as::<Widget>,
    };

    impl_storable!(Widget, WIDGET_TYPE, {
        "flavor" => |o: &Widget| Some(serde_json::Value::String(o.flavor.clone())),
    });

    static TYPES: Lazy<Types> = Lazy::new(|| Types::new(&[&WIDGET_TYPE]));

    fn widget(name: &str, flavor: &str, replicas: u64) -> Widget {
        Widget {
            metadata: Metadata::new("widget", "main", name),
            flavor: flavor.to_string(),
            replicas,
            note: String::new(),
        }
    }

    #[test]
    fn round_trip_single() {
        let codec = Codec::new(&TYPES);
        let w = widget("w1", "plain", 3);
        let data = codec.marshal(&w).unwrap();
        let back: Widget = codec.unmarshal_as(&data).unwrap();
        assert_eq!(back, w);
    }

    #[test]
    fn round_trip_many() {
        let codec = Codec::new(&TYPES);
        let objs: Vec<Box<dyn Storable>> =
            vec![Box::new(widget("a", "plain", 1)), Box::new(widget("b", "spicy", 2))];
        let data = codec.marshal_many(&objs).unwrap();
        let back = codec.unmarshal(&data).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back[0].name(), "a");
        assert_eq!(back[1].name(), "b");
        // re-marshal is byte-stable
        let again = codec.marshal_many(&back).unwrap();
        assert_eq!(again, data);
    }

    #[test]
    fn marshal_is_canonical() {
        let codec = Codec::new(&TYPES);
        let a = codec.marshal(&widget("w", "plain", 1)).unwrap();
        let b = codec.marshal(&widget("w", "plain", 1)).unwrap();
        assert_eq!(a, b);
        let text = String::from_utf8(a).unwrap();
        // keys are sorted: flavor < generation < kind < name < namespace < note < replicas
        let positions: Vec<usize> = ["flavor", "generation", "kind", "name", "namespace", "note", "replicas"]
            .iter()
            .map(|k| text.find(&format!("{}:", k)).unwrap())
            .collect();
        let mut sorted = positions.clone();
        sorted.sort_unstable();
        assert_eq!(positions, sorted);
        // empty fields are preserved
        assert!(text.contains("note:"));
    }

    #[test]
    fn generation_cleared_for_comparison() {
        let codec = Codec::new(&TYPES);
        let mut a = widget("w", "plain", 1);
        let mut b = widget("w", "plain", 1);
        a.metadata.generation = ballast_core::Generation(4);
        b.metadata.generation = ballast_core::Generation(9);
        assert_eq!(
            codec.marshal_without_generation(&a).unwrap(),
            codec.marshal_without_generation(&b).unwrap()
        );
        assert_ne!(codec.marshal(&a).unwrap(), codec.marshal(&b).unwrap());
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let codec = Codec::new(&TYPES);
        let err = codec.unmarshal(b"kind: gizmo\nname: g\n").unwrap_err();
        assert!(matches!(err, BallastError::UnknownKind(k) if k == "gizmo"));
    }

    #[test]
    fn missing_kind_is_malformed() {
        let codec = Codec::new(&TYPES);
        let err = codec.unmarshal(b"name: g\n").unwrap_err();
        assert!(matches!(err, BallastError::Malformed(_)));
    }

    #[test]
    fn unmarshal_one_rejects_sequences() {
        let codec = Codec::new(&TYPES);
        let objs: Vec<Box<dyn Storable>> =
            vec![Box::new(widget("a", "plain", 1)), Box::new(widget("b", "spicy", 2))];
        let data = codec.marshal_many(&objs).unwrap();
        let err = codec.unmarshal_one(&data).unwrap_err();
        assert!(matches!(err, BallastError::ShapeMismatch(_)));
    }
}
