//! Structural comparison of legacy and new outputs.
//!
//! Objects are compared key by key over the union of keys (sorted), arrays
//! index by index, numbers by value so `1` and `1.0` agree. A key present on
//! one side only is reported with `null` for the missing side.
//!
//! Paths are dotted with array indices, e.g. `items[2].id`; a difference at the
//! document root is reported as `$`. An ignored field matches either the full
//! path or the leaf key name.

use std::collections::BTreeSet;

use serde_json::{Number, Value};

use cutover_types::FieldDiff;

/// Outcome of one comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct Diff {
    /// Recorded differences, capped at the caller's limit.
    pub diffs: Vec<FieldDiff>,
    /// Every difference found, including ones past the cap.
    pub total: usize,
}

impl Diff {
    pub fn is_match(&self) -> bool {
        self.total == 0
    }
}

pub fn diff_values(legacy: &Value, new: &Value, ignored: &[String], max_recorded: usize) -> Diff {
    let mut walker = Walker {
        ignored,
        max_recorded,
        diffs: Vec::new(),
        total: 0,
    };
    walker.walk("", None, Some(legacy), Some(new));
    Diff {
        diffs: walker.diffs,
        total: walker.total,
    }
}

struct Walker<'a> {
    ignored: &'a [String],
    max_recorded: usize,
    diffs: Vec<FieldDiff>,
    total: usize,
}

impl Walker<'_> {
    fn walk(
        &mut self,
        path: &str,
        leaf: Option<&str>,
        legacy: Option<&Value>,
        new: Option<&Value>,
    ) {
        if self.is_ignored(path, leaf) {
            return;
        }
        match (legacy, new) {
            (Some(Value::Object(a)), Some(Value::Object(b))) => {
                let keys: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
                for key in keys {
                    let child = if path.is_empty() {
                        key.clone()
                    } else {
                        format!("{path}.{key}")
                    };
                    self.walk(&child, Some(key.as_str()), a.get(key.as_str()), b.get(key.as_str()));
                }
            }
            (Some(Value::Array(a)), Some(Value::Array(b))) => {
                let base = if path.is_empty() { "$" } else { path };
                for i in 0..a.len().max(b.len()) {
                    let child = format!("{base}[{i}]");
                    self.walk(&child, None, a.get(i), b.get(i));
                }
            }
            (Some(a), Some(b)) if scalars_equal(a, b) => {}
            _ => self.record(path, legacy, new),
        }
    }

    fn is_ignored(&self, path: &str, leaf: Option<&str>) -> bool {
        !path.is_empty()
            && self
                .ignored
                .iter()
                .any(|f| f == path || Some(f.as_str()) == leaf)
    }

    fn record(&mut self, path: &str, legacy: Option<&Value>, new: Option<&Value>) {
        self.total += 1;
        if self.diffs.len() < self.max_recorded {
            self.diffs.push(FieldDiff {
                field: if path.is_empty() { "$".to_string() } else { path.to_string() },
                legacy_value: legacy.cloned().unwrap_or(Value::Null),
                new_value: new.cloned().unwrap_or(Value::Null),
            });
        }
    }
}

fn scalars_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => numbers_equal(x, y),
        _ => a == b,
    }
}

fn numbers_equal(x: &Number, y: &Number) -> bool {
    if x.is_f64() || y.is_f64() {
        x.as_f64() == y.as_f64()
    } else {
        x == y
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn diff(a: Value, b: Value) -> Diff {
        diff_values(&a, &b, &[], 50)
    }

    fn fields(d: &Diff) -> Vec<&str> {
        d.diffs.iter().map(|f| f.field.as_str()).collect()
    }

    #[test]
    fn identical_documents_match() {
        let doc = json!({ "id": 1, "tags": ["a", "b"], "owner": { "name": "x" } });
        assert!(diff(doc.clone(), doc).is_match());
    }

    #[test]
    fn nested_and_array_paths() {
        let d = diff(
            json!({ "ticket": { "status": "open", "items": [{ "id": 1 }, { "id": 2 }] } }),
            json!({ "ticket": { "status": "closed", "items": [{ "id": 1 }, { "id": 3 }] } }),
        );
        assert_eq!(fields(&d), vec!["ticket.items[1].id", "ticket.status"]);
        assert_eq!(d.diffs[1].legacy_value, json!("open"));
        assert_eq!(d.diffs[1].new_value, json!("closed"));
    }

    #[test]
    fn missing_keys_and_extra_elements() {
        let d = diff(json!({ "a": 1, "list": [1] }), json!({ "b": 2, "list": [1, 2] }));
        assert_eq!(fields(&d), vec!["a", "b", "list[1]"]);
        assert_eq!(d.diffs[0].new_value, Value::Null);
        assert_eq!(d.diffs[1].legacy_value, Value::Null);
    }

    #[test]
    fn numbers_compare_by_value() {
        assert!(diff(json!({ "n": 1 }), json!({ "n": 1.0 })).is_match());
        assert!(!diff(json!({ "n": 1 }), json!({ "n": 1.5 })).is_match());
        assert!(!diff(json!({ "n": 1 }), json!({ "n": "1" })).is_match());
    }

    #[test]
    fn root_level_difference() {
        let d = diff(json!("ok"), json!({ "status": "ok" }));
        assert_eq!(fields(&d), vec!["$"]);
        let d = diff(json!([1, 2]), json!([1, 3]));
        assert_eq!(fields(&d), vec!["$[1]"]);
    }

    #[test]
    fn ignored_fields_by_path_or_leaf() {
        let ignored = vec!["generated_at".to_string(), "meta.trace".to_string()];
        let d = diff_values(
            &json!({ "generated_at": 1, "meta": { "trace": "x", "generated_at": 5, "v": 1 } }),
            &json!({ "generated_at": 2, "meta": { "trace": "y", "generated_at": 6, "v": 2 } }),
            &ignored,
            50,
        );
        assert_eq!(fields(&d), vec!["meta.v"]);
    }

    #[test]
    fn cap_limits_recorded_but_not_total() {
        let a = json!({ "a": 1, "b": 1, "c": 1, "d": 1 });
        let b = json!({ "a": 2, "b": 2, "c": 2, "d": 2 });
        let d = diff_values(&a, &b, &[], 2);
        assert_eq!(d.diffs.len(), 2);
        assert_eq!(d.total, 4);
        assert!(!d.is_match());
    }
}
