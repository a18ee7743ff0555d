use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};

/// A validated game document.
///
/// Only produced by [`validate_and_sanitize`](crate::validator::validate_and_sanitize);
/// fields the pipeline does not interpret are carried through untouched in
/// the `extra` maps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameDocument {
    pub properties: Properties,
    pub resources: Vec<Resource>,
    pub objects: Vec<GameObject>,
    pub layouts: Vec<Layout>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<Variable>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    #[default]
    Default,
    Landscape,
    Portrait,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Properties {
    pub name: String,
    pub version: String,
    pub project_uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orientation: Option<Orientation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_on_startup_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub antialiasing_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_height: Option<u32>,
    #[serde(default, rename = "maxFPS", skip_serializing_if = "Option::is_none")]
    pub max_fps: Option<u32>,
    #[serde(default, rename = "minFPS", skip_serializing_if = "Option::is_none")]
    pub min_fps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameObject {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<Variable>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub behaviors: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub animations: Vec<Animation>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Animation {
    pub name: String,
    pub directions: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layout {
    pub name: String,
    pub layers: Vec<Layer>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instances: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<Variable>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    pub name: String,
    pub visibility: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A typed variable. The declared type and the stored value cannot disagree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawVariable", into = "RawVariable")]
pub struct Variable {
    pub name: String,
    pub value: VariableValue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum VariableValue {
    Number(Number),
    String(String),
    Boolean(bool),
    Structure(Vec<Variable>),
    Array(Vec<Variable>),
}

impl VariableValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Boolean(_) => "boolean",
            Self::Structure(_) => "structure",
            Self::Array(_) => "array",
        }
    }
}

/// Wire shape of a variable.
#[derive(Serialize, Deserialize)]
struct RawVariable {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    children: Option<Vec<Variable>>,
}

impl TryFrom<RawVariable> for Variable {
    type Error = String;

    fn try_from(raw: RawVariable) -> Result<Self, Self::Error> {
        let mismatch = || format!("variable `{}` does not match type `{}`", raw.name, raw.kind);
        let value = match (raw.kind.as_str(), raw.value) {
            ("number", None) => VariableValue::Number(Number::from(0u64)),
            ("number", Some(Value::Number(n))) => VariableValue::Number(n),
            ("string", None) => VariableValue::String(String::new()),
            ("string", Some(Value::String(s))) => VariableValue::String(s),
            ("boolean", None) => VariableValue::Boolean(false),
            ("boolean", Some(Value::Bool(b))) => VariableValue::Boolean(b),
            ("structure", None) => VariableValue::Structure(raw.children.unwrap_or_default()),
            ("array", None) => VariableValue::Array(raw.children.unwrap_or_default()),
            _ => return Err(mismatch()),
        };
        Ok(Self {
            name: raw.name,
            value,
        })
    }
}

impl From<Variable> for RawVariable {
    fn from(variable: Variable) -> Self {
        let kind = variable.value.type_name().to_string();
        let (value, children) = match variable.value {
            VariableValue::Number(n) => (Some(Value::Number(n)), None),
            VariableValue::String(s) => (Some(Value::String(s)), None),
            VariableValue::Boolean(b) => (Some(Value::Bool(b)), None),
            VariableValue::Structure(c) | VariableValue::Array(c) => (None, Some(c)),
        };
        Self {
            name: variable.name,
            kind,
            value,
            children,
        }
    }
}

/// One entry of the asset manifest persisted alongside a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetEntry {
    pub name: String,
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetManifest {
    pub assets: Vec<AssetEntry>,
}

impl AssetManifest {
    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }
}

impl GameDocument {
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    pub fn content_hash(&self) -> Result<String, serde_json::Error> {
        Ok(content_hash(&self.to_value()?))
    }

    pub fn asset_manifest(&self) -> AssetManifest {
        AssetManifest {
            assets: self
                .resources
                .iter()
                .map(|r| AssetEntry {
                    name: r.name.clone(),
                    file: r.file.clone(),
                    kind: r.kind.clone(),
                })
                .collect(),
        }
    }

    pub fn object(&self, name: &str) -> Option<&GameObject> {
        self.objects.iter().find(|o| o.name == name)
    }

    pub fn layout(&self, name: &str) -> Option<&Layout> {
        self.layouts.iter().find(|l| l.name == name)
    }
}

/// Hex SHA-256 of the canonical serialisation of `value`.
///
/// Object keys serialise in sorted order, so equal trees hash equally
/// regardless of the key order they were parsed from.
pub fn content_hash(value: &Value) -> String {
    hex::encode(Sha256::digest(value.to_string().as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::minimal_document;
    use crate::validator::validate_and_sanitize;
    use serde_json::json;

    #[test]
    fn variables_decode_by_declared_type() {
        let v: Variable = serde_json::from_value(json!({
            "name": "stats",
            "type": "structure",
            "children": [
                { "name": "hp", "type": "number", "value": 10 },
                { "name": "alive", "type": "boolean" }
            ]
        }))
        .unwrap();
        let VariableValue::Structure(children) = &v.value else {
            panic!("expected structure, got {:?}", v.value);
        };
        assert_eq!(children[0].value, VariableValue::Number(Number::from(10u64)));
        assert_eq!(children[1].value, VariableValue::Boolean(false));
    }

    #[test]
    fn mismatched_variable_fails_to_decode() {
        let err = serde_json::from_value::<Variable>(json!({
            "name": "n", "type": "number", "value": "x"
        }))
        .unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn unknown_fields_survive() {
        let mut raw = minimal_document();
        raw["properties"]["customSetting"] = json!(42);
        raw["objectsGroups"] = json!([]);
        let doc = validate_and_sanitize(raw).unwrap();
        assert_eq!(doc.properties.extra["customSetting"], 42);
        let back = doc.to_value().unwrap();
        assert_eq!(back["objectsGroups"], json!([]));
        assert_eq!(back["objects"][0]["type"], "Sprite");
    }

    #[test]
    fn hash_ignores_key_order() {
        let a: Value = serde_json::from_str(r#"{"a":1,"b":[true,null]}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"b":[true,null],"a":1}"#).unwrap();
        assert_eq!(content_hash(&a), content_hash(&b));
        assert_ne!(content_hash(&a), content_hash(&json!({ "a": 2 })));
    }

    #[test]
    fn manifest_lists_resources() {
        let mut raw = minimal_document();
        raw["resources"] = json!([
            { "name": "hero", "file": "img/hero.png", "kind": "image" },
            { "name": "theme", "file": "music/theme.ogg" }
        ]);
        let doc = validate_and_sanitize(raw).unwrap();
        let manifest = doc.asset_manifest();
        assert_eq!(manifest.len(), 2);
        assert_eq!(manifest.assets[0].kind.as_deref(), Some("image"));
        assert_eq!(manifest.assets[1].file, "music/theme.ogg");
    }
}
