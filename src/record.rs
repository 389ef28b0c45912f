//! Record model shared by every stage of the pipeline.
//!
//! A record is an ordered JSON object as returned by the Salesforce REST API.
//! This module owns the two record-level rewrites the pipeline needs:
//!
//! - **Serialization prep**: nested records flatten to dotted keys, the
//!   `attributes` metadata field is dropped, and nulls can be replaced by a
//!   configured token.
//! - **Template evaluation**: `${Field}` placeholders in a mapping template are
//!   resolved against a source record.

use serde_json::{Map, Value};

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Reserved field carrying record metadata. Never emitted to a sink.
pub const ATTRIBUTES_FIELD: &str = "attributes";

/// Identifier field carried by every field-mapped record.
pub const ID_FIELD: &str = "Id";

/// Separator between path segments of flattened keys.
const PATH_SEPARATOR: char = '.';

// ─────────────────────────────────────────────────────────────────────────────
// Record
// ─────────────────────────────────────────────────────────────────────────────

/// An ordered mapping from field name to value.
pub type Record = Map<String, Value>;

/// Converts a JSON value into a record.
///
/// Returns `None` if the value is not an object.
pub fn record_from_value(value: Value) -> Option<Record> {
    match value {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Serialization prep
// ─────────────────────────────────────────────────────────────────────────────

/// Flattens a record for row-based serialization.
///
/// - `attributes` is skipped at every nesting level
/// - nested objects become `parent.child` keys, recursively; the parent key is
///   not emitted
/// - arrays flatten by index (`list.0.Name`)
/// - with `null_value` set, fields that are exactly `null` become that token
pub fn flatten_for_serialization(record: &Record, null_value: Option<&str>) -> Record {
    let mut flat = Record::new();
    flatten_into(&mut flat, None, record, null_value);
    flat
}

fn flatten_into(out: &mut Record, prefix: Option<&str>, record: &Record, null_value: Option<&str>) {
    for (key, value) in record {
        if key == ATTRIBUTES_FIELD {
            continue;
        }
        let path = join_path(prefix, key);
        flatten_value(out, path, value, null_value);
    }
}

fn flatten_value(out: &mut Record, path: String, value: &Value, null_value: Option<&str>) {
    match value {
        Value::Object(nested) => flatten_into(out, Some(&path), nested, null_value),
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                let item_path = join_path(Some(&path), &index.to_string());
                flatten_value(out, item_path, item, null_value);
            }
        }
        Value::Null => {
            let replaced = match null_value {
                Some(token) => Value::String(token.to_string()),
                None => Value::Null,
            };
            out.insert(path, replaced);
        }
        other => {
            out.insert(path, other.clone());
        }
    }
}

fn join_path(prefix: Option<&str>, key: &str) -> String {
    match prefix {
        Some(prefix) => format!("{}{}{}", prefix, PATH_SEPARATOR, key),
        None => key.to_string(),
    }
}

/// Renders a value as a cell string: strings verbatim, null as empty, other
/// values in their JSON form.
pub fn value_to_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Template evaluation
// ─────────────────────────────────────────────────────────────────────────────

/// Evaluates one template value against a mapping context.
///
/// A string that is exactly `${Name}` yields the raw context value (type
/// preserved, `null` when missing). Placeholders embedded in a longer string
/// are replaced by the value's cell form. Non-string values pass through.
pub fn evaluate_template(template: &Value, context: &Record) -> Value {
    let Value::String(text) = template else {
        return template.clone();
    };

    if let Some(name) = whole_placeholder(text) {
        return context.get(name).cloned().unwrap_or(Value::Null);
    }

    Value::String(substitute_placeholders(text, context))
}

/// Returns the field name if `text` consists of a single placeholder.
fn whole_placeholder(text: &str) -> Option<&str> {
    let name = text.strip_prefix("${")?.strip_suffix('}')?;
    if is_field_name(name) {
        Some(name)
    } else {
        None
    }
}

fn is_field_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_')
}

/// Replaces every `${Name}` inside `text`. Unterminated or malformed
/// placeholders are kept literally.
fn substitute_placeholders(text: &str, context: &Record) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) if is_field_name(&after[..end]) => {
                let name = &after[..end];
                if let Some(value) = context.get(name) {
                    out.push_str(&value_to_cell(value));
                }
                rest = &after[end + 1..];
            }
            _ => {
                out.push_str("${");
                rest = after;
            }
        }
    }

    out.push_str(rest);
    out
}

/// Builds a mapped record from a template.
///
/// The result starts with the source's `Id` (null when absent), followed by
/// every template field, evaluated against `source` unless `raw` is set.
pub fn apply_field_mapping(template: &Record, source: &Record, raw: bool) -> Record {
    let mut mapped = Record::new();
    mapped.insert(
        ID_FIELD.to_string(),
        source.get(ID_FIELD).cloned().unwrap_or(Value::Null),
    );

    for (field, value) in template {
        let evaluated = if raw {
            value.clone()
        } else {
            evaluate_template(value, source)
        };
        mapped.insert(field.clone(), evaluated);
    }

    mapped
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        record_from_value(value).expect("test value must be an object")
    }

    #[test]
    fn flatten_substitutes_nulls_and_drops_attributes() {
        let input = record(json!({
            "attributes": { "type": "Account", "url": "/services/data/v60.0/sobjects/Account/001" },
            "a": 1,
            "b": null,
            "c": { "d": 2 }
        }));

        let flat = flatten_for_serialization(&input, Some("#N/A"));

        assert_eq!(Value::Object(flat), json!({ "a": 1, "b": "#N/A", "c.d": 2 }));
    }

    #[test]
    fn flatten_skips_nested_attributes_and_keeps_order() {
        let input = record(json!({
            "Id": "001",
            "Owner": {
                "attributes": { "type": "User" },
                "Name": "Jane",
                "Manager": { "attributes": { "type": "User" }, "Name": "Joe" }
            },
            "Name": "Acme"
        }));

        let flat = flatten_for_serialization(&input, None);
        let keys: Vec<&str> = flat.keys().map(String::as_str).collect();

        assert_eq!(keys, vec!["Id", "Owner.Name", "Owner.Manager.Name", "Name"]);
        assert_eq!(flat["Owner.Manager.Name"], json!("Joe"));
    }

    #[test]
    fn flatten_without_token_keeps_null() {
        let flat = flatten_for_serialization(&record(json!({ "a": null })), None);
        assert_eq!(flat["a"], Value::Null);
    }

    #[test]
    fn flatten_substitutes_nested_nulls() {
        let flat = flatten_for_serialization(&record(json!({ "c": { "d": null } })), Some("-"));
        assert_eq!(flat["c.d"], json!("-"));
    }

    #[test]
    fn flatten_arrays_by_index() {
        let input = record(json!({
            "Contacts": [
                { "attributes": { "type": "Contact" }, "Name": "A" },
                { "Name": "B" }
            ]
        }));

        let flat = flatten_for_serialization(&input, None);

        assert_eq!(Value::Object(flat), json!({ "Contacts.0.Name": "A", "Contacts.1.Name": "B" }));
    }

    #[test]
    fn template_embedded_placeholder_is_stringified() {
        let ctx = record(json!({ "Id": "001", "Name": "Acme" }));
        assert_eq!(evaluate_template(&json!("Hello ${Name}"), &ctx), json!("Hello Acme"));
    }

    #[test]
    fn template_whole_placeholder_preserves_type() {
        let ctx = record(json!({ "Id": "001", "Name": "Acme", "Employees": 42, "Active": true }));

        assert_eq!(evaluate_template(&json!("${Name}"), &ctx), json!("Acme"));
        assert_eq!(evaluate_template(&json!("${Employees}"), &ctx), json!(42));
        assert_eq!(evaluate_template(&json!("${Active}"), &ctx), json!(true));
    }

    #[test]
    fn template_missing_or_null_fields() {
        let ctx = record(json!({ "Phone": null }));

        assert_eq!(evaluate_template(&json!("${Missing}"), &ctx), Value::Null);
        assert_eq!(evaluate_template(&json!("tel: ${Phone}"), &ctx), json!("tel: "));
        assert_eq!(evaluate_template(&json!("x${Missing}y"), &ctx), json!("xy"));
    }

    #[test]
    fn template_non_string_values_pass_through() {
        let ctx = record(json!({ "Name": "Acme" }));
        assert_eq!(evaluate_template(&json!(7), &ctx), json!(7));
        assert_eq!(evaluate_template(&Value::Null, &ctx), Value::Null);
    }

    #[test]
    fn template_malformed_placeholders_are_literal() {
        let ctx = record(json!({ "Name": "Acme" }));
        assert_eq!(evaluate_template(&json!("${Name"), &ctx), json!("${Name"));
        assert_eq!(evaluate_template(&json!("${} ${Name}"), &ctx), json!("${} Acme"));
    }

    #[test]
    fn template_multiple_placeholders() {
        let ctx = record(json!({ "First": "Ada", "Count": 3 }));
        assert_eq!(
            evaluate_template(&json!("${First} has ${Count} items"), &ctx),
            json!("Ada has 3 items")
        );
    }

    #[test]
    fn field_mapping_carries_id() {
        let template = record(json!({ "Description": "Account ${Name}", "Rating": "Hot" }));
        let source = record(json!({ "Id": "001", "Name": "Acme" }));

        let mapped = apply_field_mapping(&template, &source, false);

        assert_eq!(
            Value::Object(mapped),
            json!({ "Id": "001", "Description": "Account Acme", "Rating": "Hot" })
        );
    }

    #[test]
    fn field_mapping_raw_mode_is_verbatim() {
        let template = record(json!({ "Description": "Account ${Name}" }));
        let source = record(json!({ "Id": "001", "Name": "Acme" }));

        let mapped = apply_field_mapping(&template, &source, true);

        assert_eq!(mapped["Description"], json!("Account ${Name}"));
        assert_eq!(mapped["Id"], json!("001"));
    }

    #[test]
    fn value_to_cell_forms() {
        assert_eq!(value_to_cell(&Value::Null), "");
        assert_eq!(value_to_cell(&json!("x")), "x");
        assert_eq!(value_to_cell(&json!(1.5)), "1.5");
        assert_eq!(value_to_cell(&json!(false)), "false");
    }
}
