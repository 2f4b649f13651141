//! Pure attribute rewrites driven by an [`AttributeMapping`].
//!
//! Records and queries are never modified in place; every function returns
//! a new value.
//!
//! Collision policy: when a record already holds a value at the destination
//! path of a rename, the explicit value is kept and the renamed one is
//! dropped.

use semconv_store::{AttributeRef, Attributes, Predicate, Query, Record};

use crate::mapping::{AttributeMapping, Direction};

fn remap_attributes(attributes: &Attributes, mapping: &AttributeMapping, direction: Direction) -> Attributes {
    let mut out = Attributes::new();
    let mut renamed = Vec::new();
    for (path, value) in attributes {
        match mapping.lookup(path, direction) {
            Some(dest) => renamed.push((dest, value)),
            None => {
                out.insert(path.clone(), value.clone());
            }
        }
    }
    for (dest, value) in renamed {
        out.entry(dest.to_string()).or_insert_with(|| value.clone());
    }
    out
}

/// Move every mapped attribute to its new path. Unmapped attributes and the
/// version tag are copied unchanged.
pub fn remap_forward(record: &Record, mapping: &AttributeMapping) -> Record {
    Record {
        attributes: remap_attributes(&record.attributes, mapping, Direction::Forward),
        ..record.clone()
    }
}

/// Inverse of [`remap_forward`], through the mapping's reverse lookup.
pub fn remap_backward(record: &Record, mapping: &AttributeMapping) -> Record {
    Record {
        attributes: remap_attributes(&record.attributes, mapping, Direction::Backward),
        ..record.clone()
    }
}

fn rewrite_path(path: &str, mapping: &AttributeMapping, direction: Direction) -> String {
    mapping
        .lookup(path, direction)
        .unwrap_or(path)
        .to_string()
}

fn rewrite_ref(attr: &AttributeRef, mapping: &AttributeMapping, direction: Direction) -> AttributeRef {
    match attr {
        AttributeRef::Path(p) => AttributeRef::Path(rewrite_path(p, mapping, direction)),
        AttributeRef::Coalesce(ps) => AttributeRef::Coalesce(
            ps.iter()
                .map(|p| rewrite_path(p, mapping, direction))
                .collect(),
        ),
    }
}

/// Rewrite every predicate path of `query` through `mapping`. The result is
/// expressed in the mapping's target version (forward) or source version
/// (backward).
pub fn remap_query(query: &Query, mapping: &AttributeMapping, direction: Direction) -> Query {
    let predicates = query
        .predicates
        .iter()
        .map(|p| Predicate {
            attribute: rewrite_ref(&p.attribute, mapping, direction),
            ..p.clone()
        })
        .collect();
    let version = match direction {
        Direction::Forward => mapping.target_version().clone(),
        Direction::Backward => mapping.source_version().clone(),
    };
    Query {
        predicates,
        version,
    }
}

/// Rewrite `query` into the target version so that each renamed attribute is
/// read from both locations: `Coalesce([new, old])`. Paths without an old
/// counterpart become plain canonical paths.
pub fn coalesce_query(query: &Query, mapping: &AttributeMapping) -> Query {
    let predicates = query
        .predicates
        .iter()
        .map(|p| {
            let mut paths: Vec<String> = Vec::new();
            for path in p.attribute.paths() {
                let canonical = mapping.forward(path).unwrap_or(path);
                let candidates = [Some(canonical), mapping.reverse(canonical)];
                for candidate in candidates.into_iter().flatten() {
                    if !paths.iter().any(|q| q == candidate) {
                        paths.push(candidate.to_string());
                    }
                }
            }
            let attribute = if paths.len() == 1 {
                AttributeRef::Path(paths.remove(0))
            } else {
                AttributeRef::Coalesce(paths)
            };
            Predicate {
                attribute,
                ..p.clone()
            }
        })
        .collect();
    Query {
        predicates,
        version: mapping.target_version().clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::MappingKey;
    use proptest::prelude::*;
    use semconv_store::AttributeValue;

    fn mapping() -> AttributeMapping {
        AttributeMapping::new(
            MappingKey::new("1.25", "1.32"),
            [
                ("attributes.custom.trade_type", "attributes.trade.type"),
                ("attributes.custom.chain_id", "attributes.chain.id"),
            ]
            .map(|(a, b)| (a.to_string(), b.to_string())),
        )
        .unwrap()
    }

    #[test]
    fn forward_renames_and_keeps_unmapped() {
        let r = Record::new("t1", "1.25")
            .with("attributes.custom.trade_type", "arbitrage")
            .with("attributes.trade_id", "123");
        let out = remap_forward(&r, &mapping());

        assert_eq!(out.get("attributes.trade.type"), Some(&AttributeValue::from("arbitrage")));
        assert_eq!(out.get("attributes.trade_id"), Some(&AttributeValue::from("123")));
        assert!(!out.contains("attributes.custom.trade_type"));
        // The version tag is the caller's business.
        assert_eq!(out.version.as_str(), "1.25");
        // Input untouched.
        assert!(r.contains("attributes.custom.trade_type"));
    }

    #[test]
    fn explicit_value_wins_on_collision() {
        let r = Record::new("t1", "1.25")
            .with("attributes.custom.trade_type", "derived")
            .with("attributes.trade.type", "explicit");
        let out = remap_forward(&r, &mapping());
        assert_eq!(out.get("attributes.trade.type"), Some(&AttributeValue::from("explicit")));
        assert!(!out.contains("attributes.custom.trade_type"));
        assert_eq!(out.attributes.len(), 1);

        let back = Record::new("t1", "1.32")
            .with("attributes.chain.id", 1i64)
            .with("attributes.custom.chain_id", 7i64);
        let out = remap_backward(&back, &mapping());
        assert_eq!(out.get("attributes.custom.chain_id"), Some(&AttributeValue::Int(7)));
    }

    #[test]
    fn query_rewrite_sets_version() {
        let q = Query::new("1.32")
            .with(Predicate::equals("attributes.trade.type", "arbitrage"))
            .with(Predicate::equals("attributes.trade_id", "123"));

        let back = remap_query(&q, &mapping(), Direction::Backward);
        assert_eq!(back.version.as_str(), "1.25");
        assert_eq!(
            back.predicates[0].attribute,
            AttributeRef::path("attributes.custom.trade_type")
        );
        assert_eq!(back.predicates[1].attribute, AttributeRef::path("attributes.trade_id"));
        assert_eq!(back.predicates[0].value, AttributeValue::from("arbitrage"));

        let fwd = remap_query(&back, &mapping(), Direction::Forward);
        assert_eq!(fwd, q);
    }

    #[test]
    fn query_rewrite_covers_coalesce_elements() {
        let q = Query::new("1.32").with(Predicate::new(
            AttributeRef::Coalesce(vec!["attributes.trade.type".into(), "x.y".into()]),
            semconv_store::Operator::Eq,
            "swap",
        ));
        let back = remap_query(&q, &mapping(), Direction::Backward);
        assert_eq!(
            back.predicates[0].attribute,
            AttributeRef::Coalesce(vec!["attributes.custom.trade_type".into(), "x.y".into()])
        );
    }

    #[test]
    fn coalesce_reads_both_locations() {
        let q = Query::new("1.25")
            .with(Predicate::equals("attributes.custom.trade_type", "arbitrage"))
            .with(Predicate::equals("attributes.trade_id", "123"));
        let both = coalesce_query(&q, &mapping());

        assert_eq!(both.version.as_str(), "1.32");
        assert_eq!(
            both.predicates[0].attribute,
            AttributeRef::Coalesce(vec![
                "attributes.trade.type".into(),
                "attributes.custom.trade_type".into()
            ])
        );
        assert_eq!(both.predicates[1].attribute, AttributeRef::path("attributes.trade_id"));

        let old = Record::new("a", "1.25")
            .with("attributes.custom.trade_type", "arbitrage")
            .with("attributes.trade_id", "123");
        let new = remap_forward(&old, &mapping());
        assert!(both.matches(&old));
        assert!(both.matches(&new));
    }

    #[test]
    fn coalesce_is_stable_when_reapplied() {
        let q = Query::new("1.25").with(Predicate::equals("attributes.custom.chain_id", 1i64));
        let once = coalesce_query(&q, &mapping());
        let twice = coalesce_query(&once, &mapping());
        assert_eq!(once, twice);
    }

    const OLD_PATHS: [&str; 3] = ["old.a", "old.b", "old.c"];
    const NEW_PATHS: [&str; 3] = ["new.a", "new.b", "new.c"];
    const PLAIN_PATHS: [&str; 3] = ["keep.x", "keep.y", "keep.z"];

    fn prop_mapping() -> AttributeMapping {
        AttributeMapping::new(
            MappingKey::new("v1", "v2"),
            OLD_PATHS
                .iter()
                .zip(NEW_PATHS.iter())
                .map(|(a, b)| (a.to_string(), b.to_string())),
        )
        .unwrap()
    }

    fn value() -> impl Strategy<Value = AttributeValue> {
        prop_oneof![
            any::<bool>().prop_map(AttributeValue::Bool),
            any::<i64>().prop_map(AttributeValue::Int),
            "[a-z]{0,8}".prop_map(AttributeValue::String),
        ]
    }

    /// Records at the source version: each attribute is either a renamable
    /// old path or an unmapped path, never a new path already.
    fn source_record() -> impl Strategy<Value = Record> {
        (
            proptest::collection::vec(proptest::option::of(value()), 3),
            proptest::collection::vec(proptest::option::of(value()), 3),
        )
            .prop_map(|(old, plain)| {
                let mut r = Record::new("p", "v1");
                for (path, v) in OLD_PATHS.iter().zip(old) {
                    if let Some(v) = v {
                        r.attributes.insert(path.to_string(), v);
                    }
                }
                for (path, v) in PLAIN_PATHS.iter().zip(plain) {
                    if let Some(v) = v {
                        r.attributes.insert(path.to_string(), v);
                    }
                }
                r
            })
    }

    proptest! {
        #[test]
        fn backward_undoes_forward(record in source_record()) {
            let m = prop_mapping();
            let there = remap_forward(&record, &m);
            let back = remap_backward(&there, &m);
            prop_assert_eq!(&back, &record);
            for path in OLD_PATHS {
                prop_assert!(!there.contains(path));
            }
            for path in PLAIN_PATHS {
                prop_assert_eq!(there.get(path), record.get(path));
            }
        }

        #[test]
        fn forward_preserves_attribute_count(record in source_record()) {
            let there = remap_forward(&record, &prop_mapping());
            prop_assert_eq!(there.attributes.len(), record.attributes.len());
        }
    }
}
