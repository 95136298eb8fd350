//! JSON export and import of subtrees.
//!
//! Export maps child nodes to objects and properties to JSON scalars (or
//! arrays for list values); methods are not exported. Import maps objects to
//! child nodes and everything else to properties.

use crate::error::{EntryKind, TreeError};
use crate::node::Node;
use crate::property::Property;
use lw3_protocol::{convert_value, Value};
use serde_json::{Map, Number, Value as Json};

impl Node {
    /// Exports the subtree rooted at this node.
    pub fn to_json(&self) -> Json {
        let mut map = Map::new();
        for info in self.properties() {
            map.insert(info.name, value_to_json(&convert_value(&info.value)));
        }
        for name in self.children() {
            if let Some(child) = self.child(&name) {
                map.insert(name, child.to_json());
            }
        }
        Json::Object(map)
    }

    /// Merges a JSON object into the subtree rooted at this node.
    ///
    /// Missing nodes are created and missing properties are created
    /// read-only. Existing properties are assigned through their setter and
    /// notify listeners when their value changes. `null` members are skipped.
    pub fn merge_json(&self, json: &Json) -> Result<(), TreeError> {
        let object = json.as_object().ok_or_else(|| {
            TreeError::InvalidJson(format!("expected an object at {}", self.path()))
        })?;
        for (name, member) in object {
            match member {
                Json::Null => {}
                Json::Object(_) => self.child_or_create(name)?.merge_json(member)?,
                scalar => {
                    let text = json_to_text(scalar);
                    match self.entry_kind(name) {
                        Some(EntryKind::Property) => {
                            self.assign(name, &text, false, None)?;
                        }
                        None => self.define_property(name, Property::read_only(text))?,
                        Some(kind) => {
                            return Err(TreeError::NameTaken {
                                path: format!("{}.{}", self.path(), name),
                                kind,
                            })
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Converts a typed value to JSON. Integral numbers become JSON integers.
pub fn value_to_json(value: &Value) -> Json {
    match value {
        Value::Bool(b) => Json::Bool(*b),
        Value::Number(n) if n.fract() == 0.0 && n.abs() < 9.0e15 => Json::from(*n as i64),
        Value::Number(n) => Number::from_f64(*n).map_or(Json::Null, Json::Number),
        Value::String(s) => Json::String(s.clone()),
        Value::List(items) => Json::Array(items.iter().map(value_to_json).collect()),
    }
}

fn json_to_text(json: &Json) -> String {
    match json {
        Json::String(s) => s.clone(),
        Json::Array(items) => {
            let mut parts: Vec<String> = items.iter().map(json_to_text).collect();
            if parts.len() == 1 {
                parts.push(String::new());
            }
            parts.join(";")
        }
        other => other.to_string(),
    }
}
