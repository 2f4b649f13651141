//! JSON form of records and predicates used on the command line.
//!
//! Records are read and written as one JSON object per line:
//!
//! ```text
//! {"id": "t1", "version": "1.25", "observed_at": 1700000000000,
//!  "attributes": {"attributes.custom.trade_type": "arbitrage"}}
//! ```
//!
//! The version may also be given as the `attributes.semconv_version`
//! attribute. Attribute values are plain JSON scalars.

use serde_json::{json, Map, Value};

use semconv_store::{
    AttributeRef, AttributeValue, Operator, Predicate, Record, SchemaVersion, VERSION_ATTRIBUTE,
};

pub fn value_from_json(value: &Value) -> Result<AttributeValue, String> {
    Ok(match value {
        Value::Null => AttributeValue::Null,
        Value::Bool(b) => AttributeValue::Bool(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => AttributeValue::Int(i),
            None => AttributeValue::Float(n.as_f64().ok_or_else(|| format!("unsupported number {n}"))?),
        },
        Value::String(s) => AttributeValue::String(s.clone()),
        other => return Err(format!("attribute values must be scalars, got {other}")),
    })
}

pub fn value_to_json(value: &AttributeValue) -> Value {
    match value {
        AttributeValue::Null => Value::Null,
        AttributeValue::Bool(b) => json!(b),
        AttributeValue::Int(i) => json!(i),
        AttributeValue::Float(x) => json!(x),
        AttributeValue::String(s) => json!(s),
    }
}

/// Parse one JSON line into a record. `fallback_version` is used when the
/// line carries no version at all.
pub fn record_from_json(line: &str, fallback_version: Option<&SchemaVersion>) -> Result<Record, String> {
    let value: Value = serde_json::from_str(line).map_err(|e| e.to_string())?;
    let obj = value.as_object().ok_or("expected a JSON object")?;

    let id = match obj.get("id") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err("missing string field \"id\"".into()),
    };

    let mut attributes = obj
        .get("attributes")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    let tagged = attributes
        .remove(VERSION_ATTRIBUTE)
        .and_then(|v| v.as_str().map(SchemaVersion::new));
    let version = obj
        .get("version")
        .and_then(Value::as_str)
        .map(SchemaVersion::new)
        .or(tagged)
        .or_else(|| fallback_version.cloned())
        .unwrap_or_else(|| SchemaVersion::new(""));

    let mut record = Record::new(id, version);
    if let Some(observed_at) = obj.get("observed_at").and_then(Value::as_u64) {
        record.observed_at = observed_at;
    }
    for (path, value) in &attributes {
        let value = value_from_json(value).map_err(|e| format!("{path}: {e}"))?;
        record.attributes.insert(path.clone(), value);
    }
    Ok(record)
}

pub fn record_to_json(record: &Record) -> Value {
    let mut attributes: Map<String, Value> = record
        .attributes
        .iter()
        .map(|(path, value)| (path.clone(), value_to_json(value)))
        .collect();
    attributes.insert(VERSION_ATTRIBUTE.into(), json!(record.version.as_str()));
    json!({
        "id": record.id.as_str(),
        "version": record.version.as_str(),
        "observed_at": record.observed_at,
        "attributes": attributes,
    })
}

/// Parse `path=value`, `path!=value`, `path>value`, `path>=value`,
/// `path<value`, `path<=value` or `path?` (exists). Values that parse as
/// JSON scalars keep their type; anything else is a string.
pub fn parse_predicate(expr: &str) -> Result<Predicate, String> {
    if let Some(path) = expr.strip_suffix('?') {
        return Ok(Predicate::exists(path.trim()));
    }

    let idx = expr
        .find(['=', '!', '>', '<'])
        .ok_or_else(|| format!("no operator in {expr:?}"))?;
    let (path, rest) = expr.split_at(idx);
    let (op, value) = [
        ("!=", Operator::Ne),
        (">=", Operator::Gte),
        ("<=", Operator::Lte),
        ("=", Operator::Eq),
        (">", Operator::Gt),
        ("<", Operator::Lt),
    ]
    .into_iter()
    .find_map(|(symbol, op)| rest.strip_prefix(symbol).map(|v| (op, v)))
    .ok_or_else(|| format!("unknown operator in {expr:?}"))?;

    let path = path.trim();
    if path.is_empty() {
        return Err(format!("missing attribute path in {expr:?}"));
    }
    let value = match serde_json::from_str::<Value>(value.trim()) {
        Ok(v @ (Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_))) => value_from_json(&v)?,
        _ => AttributeValue::String(value.trim().to_string()),
    };
    Ok(Predicate::new(AttributeRef::path(path), op, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_line_round_trips_through_json() {
        let line = r#"{"id": "t1", "version": "1.25", "observed_at": 42,
            "attributes": {"attributes.custom.trade_type": "arbitrage", "attributes.amount": 12.5, "attributes.legs": 2}}"#;
        let record = record_from_json(line, None).unwrap();
        assert_eq!(record.version.as_str(), "1.25");
        assert_eq!(record.observed_at, 42);
        assert_eq!(record.get("attributes.amount"), Some(&AttributeValue::Float(12.5)));
        assert_eq!(record.get("attributes.legs"), Some(&AttributeValue::Int(2)));

        let out = record_to_json(&record);
        assert_eq!(out["attributes"][VERSION_ATTRIBUTE], "1.25");
        assert_eq!(out["attributes"]["attributes.custom.trade_type"], "arbitrage");
    }

    #[test]
    fn version_attribute_and_fallback() {
        let tagged = r#"{"id": "t2", "attributes": {"attributes.semconv_version": "1.32"}}"#;
        let record = record_from_json(tagged, None).unwrap();
        assert_eq!(record.version.as_str(), "1.32");
        assert!(!record.contains(VERSION_ATTRIBUTE));

        let bare = r#"{"id": "t3"}"#;
        let record = record_from_json(bare, Some(&"1.25".into())).unwrap();
        assert_eq!(record.version.as_str(), "1.25");
    }

    #[test]
    fn rejects_nested_values() {
        let line = r#"{"id": "t4", "attributes": {"a": {"b": 1}}}"#;
        assert!(record_from_json(line, None).is_err());
        assert!(record_from_json("[]", None).is_err());
    }

    #[test]
    fn predicates_parse_operators_and_types() {
        let p = parse_predicate("attributes.trade.type=arbitrage").unwrap();
        assert_eq!(p, Predicate::equals("attributes.trade.type", "arbitrage"));

        let p = parse_predicate("attributes.amount>=100").unwrap();
        assert_eq!(p.op, Operator::Gte);
        assert_eq!(p.value, AttributeValue::Int(100));

        let p = parse_predicate("attributes.flag!=true").unwrap();
        assert_eq!((p.op, p.value), (Operator::Ne, AttributeValue::Bool(true)));

        let p = parse_predicate("attributes.chain.id?").unwrap();
        assert_eq!(p.op, Operator::Exists);

        assert!(parse_predicate("no-operator").is_err());
        assert!(parse_predicate("=value").is_err());
    }
}
