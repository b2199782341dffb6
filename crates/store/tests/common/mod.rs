use ballast_core::{decode_as, impl_storable, Metadata, TypeInfo, Types};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Widget {
    #[serde(flatten)]
    pub metadata: Metadata,
    pub flavor: String,
    pub replicas: u64,
}

pub static WIDGET_TYPE: TypeInfo = TypeInfo {
    kind: "widget",
    versioned: true,
    indexed_fields: &["flavor", "replicas"],
    decode: decode_as::<Widget>,
};

impl_storable!(Widget, WIDGET_TYPE, {
    "flavor" => |o: &Widget| Some(serde_json::Value::String(o.flavor.clone())),
    "replicas" => |o: &Widget| Some(serde_json::json!(o.replicas)),
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(flatten)]
    pub metadata: Metadata,
    pub body: String,
}

pub static SETTINGS_TYPE: TypeInfo = TypeInfo {
    kind: "settings",
    versioned: false,
    indexed_fields: &[],
    decode: decode_as::<Settings>,
};

impl_storable!(Settings, SETTINGS_TYPE);

static TYPES: Lazy<Types> = Lazy::new(|| Types::new(&[&WIDGET_TYPE, &SETTINGS_TYPE]));

pub fn types() -> &'static Types {
    &TYPES
}

pub fn widget(ns: &str, name: &str, flavor: &str, replicas: u64) -> Widget {
    Widget {
        metadata: Metadata::new("widget", ns, name),
        flavor: flavor.to_string(),
        replicas,
    }
}
