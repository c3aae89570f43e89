// src/query/selector.rs

//! A Mango-like JSON selector language: operator objects
//! (`$eq`/`$ne`/`$gt`/`$gte`/`$lt`/`$lte`/`$in`/`$nin`/`$exists`/`$mod`/
//! `$size`/`$type`/`$regex`) combined with `$and`/`$or`/`$not`, plus the
//! implicit shorthand where a bare field maps directly to a literal
//! (treated as `$eq`) or to a nested operator object.

use crate::error::{Error, Result};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Evaluates `selector` against `doc`, the way the residual in-memory
/// predicate pass does once an index (if any) has narrowed the
/// candidate set.
pub fn matches(selector: &Value, doc: &Value) -> Result<bool> {
    let obj = selector
        .as_object()
        .ok_or_else(|| Error::InvalidSelector("selector must be a JSON object".to_string()))?;

    for (key, value) in obj {
        let ok = match key.as_str() {
            "$and" => {
                let clauses = value.as_array().ok_or_else(|| {
                    Error::InvalidSelector("$and requires an array".to_string())
                })?;
                clauses.iter().try_fold(true, |acc, clause| {
                    Ok::<_, Error>(acc && matches(clause, doc)?)
                })?
            }
            "$or" => {
                let clauses = value.as_array().ok_or_else(|| {
                    Error::InvalidSelector("$or requires an array".to_string())
                })?;
                let mut any = false;
                for clause in clauses {
                    if matches(clause, doc)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            "$not" => !matches(value, doc)?,
            field => {
                let actual = lookup_field(doc, field);
                match_field(value, actual.as_ref())?
            }
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Looks up a dotted field path (`"address.city"`) inside a document
/// body. Exposed to the planner so index maintenance can extract the
/// same values selectors compare against.
pub fn lookup_field<'a>(doc: &'a Value, field: &str) -> Option<&'a Value> {
    let mut current = doc;
    for part in field.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn match_field(constraint: &Value, actual: Option<&Value>) -> Result<bool> {
    if let Some(obj) = constraint.as_object() {
        if obj.keys().all(|k| k.starts_with('$')) {
            for (op, operand) in obj {
                if !apply_operator(op, operand, actual)? {
                    return Ok(false);
                }
            }
            return Ok(true);
        }
    }
    // bare literal: implicit equality
    Ok(actual == Some(constraint))
}

fn apply_operator(op: &str, operand: &Value, actual: Option<&Value>) -> Result<bool> {
    Ok(match op {
        "$exists" => {
            let want = operand.as_bool().unwrap_or(true);
            actual.is_some() == want
        }
        "$eq" => actual == Some(operand),
        "$ne" => actual != Some(operand),
        "$in" => {
            let options = operand
                .as_array()
                .ok_or_else(|| Error::InvalidSelector("$in requires an array".to_string()))?;
            matches!(actual, Some(a) if options.contains(a))
        }
        "$nin" => {
            let options = operand
                .as_array()
                .ok_or_else(|| Error::InvalidSelector("$nin requires an array".to_string()))?;
            !matches!(actual, Some(a) if options.contains(a))
        }
        "$gt" => compare(actual, operand)? == Some(Ordering::Greater),
        "$gte" => matches!(compare(actual, operand)?, Some(Ordering::Greater | Ordering::Equal)),
        "$lt" => compare(actual, operand)? == Some(Ordering::Less),
        "$lte" => matches!(compare(actual, operand)?, Some(Ordering::Less | Ordering::Equal)),
        "$mod" => {
            let parts = operand
                .as_array()
                .ok_or_else(|| Error::InvalidSelector("$mod requires a [divisor, remainder] array".to_string()))?;
            let (Some(divisor), Some(remainder)) = (
                parts.first().and_then(Value::as_i64),
                parts.get(1).and_then(Value::as_i64),
            ) else {
                return Err(Error::InvalidSelector(
                    "$mod requires a [divisor, remainder] array of integers".to_string(),
                ));
            };
            if divisor == 0 {
                return Err(Error::InvalidSelector("$mod divisor must not be zero".to_string()));
            }
            matches!(actual.and_then(Value::as_i64), Some(n) if n % divisor == remainder)
        }
        "$size" => {
            let want = operand
                .as_u64()
                .ok_or_else(|| Error::InvalidSelector("$size requires a non-negative integer".to_string()))?;
            matches!(actual.and_then(Value::as_array), Some(arr) if arr.len() as u64 == want)
        }
        "$type" => {
            let want = operand
                .as_str()
                .ok_or_else(|| Error::InvalidSelector("$type requires a string".to_string()))?;
            actual.map(json_type_name) == Some(want)
        }
        "$regex" => {
            let pattern = operand
                .as_str()
                .ok_or_else(|| Error::InvalidSelector("$regex requires a string pattern".to_string()))?;
            let re = regex::Regex::new(pattern)
                .map_err(|e| Error::InvalidSelector(format!("invalid $regex pattern '{pattern}': {e}")))?;
            matches!(actual.and_then(Value::as_str), Some(s) if re.is_match(s))
        }
        other => {
            return Err(Error::InvalidSelector(format!("unsupported operator '{other}'")));
        }
    })
}

/// The CouchDB/Mango `$type` vocabulary: `"null"`, `"boolean"`, `"number"`,
/// `"string"`, `"array"`, `"object"`.
fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn compare(actual: Option<&Value>, operand: &Value) -> Result<Option<Ordering>> {
    let Some(actual) = actual else { return Ok(None) };
    Ok(match (actual, operand) {
        (Value::Number(a), Value::Number(b)) => a.as_f64().partial_cmp(&b.as_f64()),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    })
}

/// Extracts top-level `field -> literal` equality constraints for index
/// planning. Fields nested under `$and`/`$or`/`$not`, or constrained only
/// by non-equality operators, are not covered. The planner falls back
/// to a residual scan for those.
pub fn equality_constraints(selector: &Value) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    let Some(obj) = selector.as_object() else {
        return out;
    };
    for (key, value) in obj {
        if key.starts_with('$') {
            continue;
        }
        if let Some(inner) = value.as_object() {
            if inner.keys().all(|k| k.starts_with('$')) {
                if let Some(eq) = inner.get("$eq") {
                    out.insert(key.clone(), eq.clone());
                }
                continue;
            }
        }
        out.insert(key.clone(), value.clone());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn implicit_equality() {
        let selector = serde_json::json!({"status": "active"});
        assert!(matches(&selector, &serde_json::json!({"status": "active"})).unwrap());
        assert!(!matches(&selector, &serde_json::json!({"status": "inactive"})).unwrap());
    }

    #[test]
    fn comparison_operators() {
        let selector = serde_json::json!({"age": {"$gte": 21}});
        assert!(matches(&selector, &serde_json::json!({"age": 21})).unwrap());
        assert!(matches(&selector, &serde_json::json!({"age": 30})).unwrap());
        assert!(!matches(&selector, &serde_json::json!({"age": 20})).unwrap());
    }

    #[test]
    fn and_or_not() {
        let selector = serde_json::json!({
            "$and": [
                {"type": "user"},
                {"$or": [{"age": {"$lt": 18}}, {"age": {"$gt": 65}}]}
            ]
        });
        assert!(matches(&selector, &serde_json::json!({"type": "user", "age": 70})).unwrap());
        assert!(!matches(&selector, &serde_json::json!({"type": "user", "age": 40})).unwrap());
    }

    #[test]
    fn nested_field_path() {
        let selector = serde_json::json!({"address.city": "Boston"});
        assert!(matches(&selector, &serde_json::json!({"address": {"city": "Boston"}})).unwrap());
    }

    #[test]
    fn exists_operator() {
        let selector = serde_json::json!({"nickname": {"$exists": false}});
        assert!(matches(&selector, &serde_json::json!({"name": "a"})).unwrap());
        assert!(!matches(&selector, &serde_json::json!({"nickname": "a"})).unwrap());
    }

    #[test]
    fn mod_operator() {
        let selector = serde_json::json!({"n": {"$mod": [3, 1]}});
        assert!(matches(&selector, &serde_json::json!({"n": 7})).unwrap());
        assert!(!matches(&selector, &serde_json::json!({"n": 6})).unwrap());
    }

    #[test]
    fn size_operator() {
        let selector = serde_json::json!({"tags": {"$size": 2}});
        assert!(matches(&selector, &serde_json::json!({"tags": ["a", "b"]})).unwrap());
        assert!(!matches(&selector, &serde_json::json!({"tags": ["a"]})).unwrap());
    }

    #[test]
    fn type_operator() {
        let selector = serde_json::json!({"n": {"$type": "number"}});
        assert!(matches(&selector, &serde_json::json!({"n": 1})).unwrap());
        assert!(!matches(&selector, &serde_json::json!({"n": "1"})).unwrap());
    }

    #[test]
    fn regex_operator() {
        let selector = serde_json::json!({"name": {"$regex": "^A.*e$"}});
        assert!(matches(&selector, &serde_json::json!({"name": "Alice"})).unwrap());
        assert!(!matches(&selector, &serde_json::json!({"name": "Bob"})).unwrap());
    }

    #[test]
    fn equality_constraints_skips_non_eq_and_boolean_ops() {
        let selector = serde_json::json!({
            "type": "user",
            "age": {"$gte": 21},
            "$or": [{"a": 1}]
        });
        let constraints = equality_constraints(&selector);
        assert_eq!(constraints.len(), 1);
        assert_eq!(constraints["type"], "user");
    }
}
