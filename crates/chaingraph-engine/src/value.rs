//! Port & Value Model: typed port configs, value transfer and the
//! type-compatibility relation.
//!
//! Runtime-reflective port decorators in the source system become a single
//! tagged union here (`PortConfig`), with one dispatch point
//! (`is_compatible`) instead of per-class polymorphism.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::channel::MultiChannel;
use crate::error::{EngineError, Result};

/// A property of an `object`-typed port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyConfig {
    pub config: PortConfig,
    #[serde(default)]
    pub required: bool,
}

/// Tagged union over the port type configs a port can carry.
///
/// `Any` holds the underlying type it has adopted from the first compatible
/// peer it was connected to, if any. Adoption is recorded
/// here rather than on `Port` directly so a config value is fully
/// self-describing once adopted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PortConfig {
    String,
    Number,
    Boolean,
    Enum {
        options: Vec<String>,
    },
    Object {
        properties: HashMap<String, PropertyConfig>,
    },
    Array {
        items: Box<PortConfig>,
    },
    Stream {
        item: Box<PortConfig>,
    },
    Any {
        #[serde(default)]
        adopted: Option<Box<PortConfig>>,
    },
}

impl PortConfig {
    /// Human-readable type tag, used in `TypeMismatch` errors.
    pub fn tag(&self) -> &'static str {
        match self {
            PortConfig::String => "string",
            PortConfig::Number => "number",
            PortConfig::Boolean => "boolean",
            PortConfig::Enum { .. } => "enum",
            PortConfig::Object { .. } => "object",
            PortConfig::Array { .. } => "array",
            PortConfig::Stream { .. } => "stream",
            PortConfig::Any { .. } => "any",
        }
    }

    /// The effective config once `any`-adoption is resolved: an adopted
    /// `Any` behaves as its adopted type for compatibility purposes.
    fn resolved(&self) -> &PortConfig {
        match self {
            PortConfig::Any { adopted: Some(t) } => t.resolved(),
            other => other,
        }
    }

    /// Port type compatibility relation. Reflexive on identical tags; `any` is
    /// bi-compatible with everything; object/array/stream are structural;
    /// enum is compatible with string and with enums sharing the same
    /// option set.
    pub fn is_compatible(source: &PortConfig, target: &PortConfig) -> bool {
        let (source, target) = (source.resolved(), target.resolved());

        if matches!(source, PortConfig::Any { .. }) || matches!(target, PortConfig::Any { .. }) {
            return true;
        }

        match (source, target) {
            (PortConfig::String, PortConfig::String) => true,
            (PortConfig::Number, PortConfig::Number) => true,
            (PortConfig::Boolean, PortConfig::Boolean) => true,
            (PortConfig::Enum { .. }, PortConfig::String) | (PortConfig::String, PortConfig::Enum { .. }) => true,
            (PortConfig::Enum { options: a }, PortConfig::Enum { options: b }) => {
                let a: std::collections::HashSet<_> = a.iter().collect();
                let b: std::collections::HashSet<_> = b.iter().collect();
                a == b
            }
            (PortConfig::Object { properties: src }, PortConfig::Object { properties: tgt }) => tgt
                .iter()
                .filter(|(_, p)| p.required)
                .all(|(key, target_prop)| {
                    src.get(key)
                        .is_some_and(|source_prop| Self::is_compatible(&source_prop.config, &target_prop.config))
                }),
            (PortConfig::Array { items: src }, PortConfig::Array { items: tgt }) => {
                Self::is_compatible(src, tgt)
            }
            (PortConfig::Stream { item: src }, PortConfig::Stream { item: tgt }) => {
                Self::is_compatible(src, tgt)
            }
            _ => false,
        }
    }

    /// Adopt a peer's underlying type on first connection to an
    /// unresolved `any` port. No-op for non-`any` configs or an `any` that
    /// has already adopted a type. Callers that need to force a re-bind
    /// must reset the port's config explicitly first.
    pub fn adopt(&mut self, peer: &PortConfig) {
        if let PortConfig::Any { adopted: adopted @ None } = self {
            *adopted = Some(Box::new(peer.resolved().clone()));
        }
    }
}

/// A value flowing through a port.
///
/// Scalars, objects and arrays are transferred by value (`Scalar`, deep
/// cloned by `transfer`); streams are transferred by reference to a shared
/// `MultiChannel` so multiple consumers observe the same production
/// sequence.
#[derive(Debug, Clone)]
pub enum PortValue {
    Scalar(serde_json::Value),
    Stream(Arc<MultiChannel<serde_json::Value>>),
}

impl PortValue {
    pub fn scalar(v: impl Into<serde_json::Value>) -> Self {
        PortValue::Scalar(v.into())
    }

    pub fn as_scalar(&self) -> Option<&serde_json::Value> {
        match self {
            PortValue::Scalar(v) => Some(v),
            PortValue::Stream(_) => None,
        }
    }

    /// Validate `self` against `cfg`, returning a `TypeMismatch` error on
    /// failure. Scalars are checked structurally against the config tree;
    /// streams are only checked by tag (item-level validation happens as
    /// items are produced, not at connection time).
    pub fn validate(&self, port_id: &str, cfg: &PortConfig) -> Result<()> {
        match (self, cfg) {
            (PortValue::Stream(_), PortConfig::Stream { .. }) => Ok(()),
            (PortValue::Stream(_), PortConfig::Any { .. }) => Ok(()),
            (PortValue::Scalar(_), PortConfig::Stream { .. }) => Err(EngineError::TypeMismatch {
                port: port_id.to_string(),
                expected: cfg.tag().to_string(),
                actual: "scalar".to_string(),
            }),
            (PortValue::Scalar(v), cfg) => {
                if json_matches(v, cfg) {
                    Ok(())
                } else {
                    Err(EngineError::TypeMismatch {
                        port: port_id.to_string(),
                        expected: cfg.tag().to_string(),
                        actual: json_tag(v).to_string(),
                    })
                }
            }
            (PortValue::Stream(_), _) => Err(EngineError::TypeMismatch {
                port: port_id.to_string(),
                expected: cfg.tag().to_string(),
                actual: "stream".to_string(),
            }),
        }
    }

    /// Deep-copy a scalar value for transfer across an edge: object
    /// and array values are deep-copied so downstream nodes cannot mutate
    /// upstream state. Streams are cloned by `Arc`, i.e. by reference.
    pub fn transfer_copy(&self) -> PortValue {
        match self {
            PortValue::Scalar(v) => PortValue::Scalar(v.clone()),
            PortValue::Stream(ch) => PortValue::Stream(Arc::clone(ch)),
        }
    }
}

fn json_tag(v: &serde_json::Value) -> &'static str {
    match v {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

fn json_matches(v: &serde_json::Value, cfg: &PortConfig) -> bool {
    match cfg.resolved() {
        PortConfig::Any { .. } => true,
        PortConfig::String => v.is_string(),
        PortConfig::Number => v.is_number(),
        PortConfig::Boolean => v.is_boolean(),
        PortConfig::Enum { options } => v
            .as_str()
            .is_some_and(|s| options.iter().any(|o| o == s)),
        PortConfig::Object { properties } => match v.as_object() {
            Some(obj) => properties.iter().all(|(key, prop)| match obj.get(key) {
                Some(value) => json_matches(value, &prop.config),
                None => !prop.required,
            }),
            None => false,
        },
        PortConfig::Array { items } => match v.as_array() {
            Some(arr) => arr.iter().all(|item| json_matches(item, items)),
            None => false,
        },
        PortConfig::Stream { .. } => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_is_bicompatible() {
        let any = PortConfig::Any { adopted: None };
        assert!(PortConfig::is_compatible(&any, &PortConfig::String));
        assert!(PortConfig::is_compatible(&PortConfig::Number, &any));
    }

    #[test]
    fn numeric_and_string_self_compatible() {
        assert!(PortConfig::is_compatible(&PortConfig::Number, &PortConfig::Number));
        assert!(PortConfig::is_compatible(&PortConfig::String, &PortConfig::String));
        assert!(!PortConfig::is_compatible(&PortConfig::Number, &PortConfig::String));
    }

    #[test]
    fn enum_compatible_with_string_and_matching_enum() {
        let e1 = PortConfig::Enum {
            options: vec!["a".into(), "b".into()],
        };
        let e2 = PortConfig::Enum {
            options: vec!["b".into(), "a".into()],
        };
        let e3 = PortConfig::Enum {
            options: vec!["a".into()],
        };
        assert!(PortConfig::is_compatible(&e1, &PortConfig::String));
        assert!(PortConfig::is_compatible(&e1, &e2));
        assert!(!PortConfig::is_compatible(&e1, &e3));
    }

    #[test]
    fn object_structural_compatibility() {
        let mut target_props = HashMap::new();
        target_props.insert(
            "name".to_string(),
            PropertyConfig {
                config: PortConfig::String,
                required: true,
            },
        );
        let target = PortConfig::Object {
            properties: target_props,
        };

        let mut source_props = HashMap::new();
        source_props.insert(
            "name".to_string(),
            PropertyConfig {
                config: PortConfig::String,
                required: false,
            },
        );
        source_props.insert(
            "extra".to_string(),
            PropertyConfig {
                config: PortConfig::Number,
                required: false,
            },
        );
        let source = PortConfig::Object {
            properties: source_props,
        };

        assert!(PortConfig::is_compatible(&source, &target));

        let missing_source = PortConfig::Object {
            properties: HashMap::new(),
        };
        assert!(!PortConfig::is_compatible(&missing_source, &target));
    }

    #[test]
    fn array_and_stream_recurse_on_items() {
        let arr_num = PortConfig::Array {
            items: Box::new(PortConfig::Number),
        };
        let arr_str = PortConfig::Array {
            items: Box::new(PortConfig::String),
        };
        assert!(!PortConfig::is_compatible(&arr_num, &arr_str));

        let stream_num = PortConfig::Stream {
            item: Box::new(PortConfig::Number),
        };
        assert!(PortConfig::is_compatible(&stream_num, &stream_num.clone()));
    }

    #[test]
    fn any_adopts_first_peer_then_is_fixed() {
        let mut any = PortConfig::Any { adopted: None };
        any.adopt(&PortConfig::Number);
        match &any {
            PortConfig::Any { adopted: Some(t) } => assert!(matches!(**t, PortConfig::Number)),
            _ => panic!("expected adopted type"),
        }
        // Second adoption attempt is a no-op: type drift requires an
        // explicit reset.
        any.adopt(&PortConfig::String);
        match &any {
            PortConfig::Any { adopted: Some(t) } => assert!(matches!(**t, PortConfig::Number)),
            _ => panic!("expected adopted type"),
        }
    }

    #[test]
    fn scalar_validate_reports_type_mismatch() {
        let cfg = PortConfig::Number;
        let value = PortValue::scalar(serde_json::json!("not a number"));
        let err = value.validate("p1", &cfg).unwrap_err();
        assert!(matches!(err, EngineError::TypeMismatch { .. }));
    }
}
