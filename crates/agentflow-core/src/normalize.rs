//! Accepts either the canonical declaration-tree shape or the legacy
//! categorized-keys shape and produces the canonical [`Program`].
//!
//! `normalize` is idempotent: `normalize(normalize(x)) == normalize(x)`,
//! because the canonical shape is itself valid input (it simply has no
//! categorized keys to fold in).

use serde_json::Value;

use crate::ast::Program;
use crate::error::AflError;

/// Normalize a raw declaration-tree JSON value into a [`Program`]
///
/// Accepts:
/// - the canonical shape: `{"type": "Program", "declarations": [...]}`
/// - the legacy categorized-keys shape: a top-level object with any of
///   `namespaces`, `facets`, `eventFacets`, `workflows`, `implicits`,
///   `schemas`, each an array, which are concatenated (in that order) into
///   a single `declarations` array before being parsed as canonical.
pub fn normalize(raw: Value) -> Result<Program, AflError> {
    let canonical = to_canonical_shape(raw)?;
    serde_json::from_value(canonical)
        .map_err(|e| AflError::new(crate::error::ErrorKind::Parse, e.to_string()))
}

fn to_canonical_shape(raw: Value) -> Result<Value, AflError> {
    let obj = raw
        .as_object()
        .ok_or_else(|| AflError::new(crate::error::ErrorKind::Parse, "declaration tree root must be an object"))?;

    if obj.contains_key("declarations") {
        return Ok(Value::Object(obj.clone()));
    }

    const LEGACY_KEYS: &[&str] = &[
        "namespaces",
        "facets",
        "eventFacets",
        "workflows",
        "implicits",
        "schemas",
    ];

    let mut declarations = Vec::new();
    for key in LEGACY_KEYS {
        if let Some(Value::Array(items)) = obj.get(*key) {
            for item in items {
                declarations.push(tag_legacy_item(key, item.clone()));
            }
        }
    }

    let mut out = serde_json::Map::new();
    out.insert("type".to_string(), Value::String("Program".to_string()));
    out.insert("declarations".to_string(), Value::Array(declarations));
    Ok(Value::Object(out))
}

/// Legacy categorized items carry no `type` discriminant of their own
/// (their category *is* their type); fold the category name into the
/// discriminant the canonical `Declaration` enum expects.
fn tag_legacy_item(category: &str, mut item: Value) -> Value {
    let tag = match category {
        "namespaces" => "Namespace",
        "facets" => "FacetDecl",
        "eventFacets" => "EventFacetDecl",
        "workflows" => "WorkflowDecl",
        "implicits" => "ImplicitDecl",
        "schemas" => "SchemaDecl",
        other => other,
    };
    if let Value::Object(map) = &mut item {
        map.entry("type").or_insert_with(|| Value::String(tag.to_string()));
    }
    item
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_canonical_passthrough() {
        let raw = json!({
            "type": "Program",
            "declarations": [
                {
                    "type": "WorkflowDecl",
                    "name": "AddOne",
                    "facet": "AddOne"
                }
            ]
        });
        let program = normalize(raw).expect("parses");
        assert_eq!(program.declarations.len(), 1);
    }

    #[test]
    fn test_normalize_legacy_categorized_keys() {
        let raw = json!({
            "workflows": [
                { "name": "AddOne", "facet": "AddOne" }
            ],
            "facets": [
                {
                    "name": "AddOne",
                    "params": ["n"],
                    "returns": ["m"],
                    "body": { "kind": "and_then", "children": [] }
                }
            ]
        });
        let program = normalize(raw).expect("parses");
        assert_eq!(program.declarations.len(), 2);
        assert!(program.find_workflow("AddOne").is_some());
    }

    #[test]
    fn test_normalize_idempotent() {
        let raw = json!({
            "workflows": [{ "name": "AddOne", "facet": "AddOne" }],
            "facets": [
                {
                    "name": "AddOne",
                    "params": ["n"],
                    "returns": ["m"],
                    "body": { "kind": "and_then", "children": [] }
                }
            ]
        });
        let once = to_canonical_shape(raw).unwrap();
        let twice = to_canonical_shape(once.clone()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_normalize_rejects_non_object() {
        let raw = json!([1, 2, 3]);
        assert!(normalize(raw).is_err());
    }
}
