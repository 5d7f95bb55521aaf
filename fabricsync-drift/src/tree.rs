//! Generic structural diff over schema-less spec trees.
//!
//! A leaf is a scalar, `null`, an empty map or an empty sequence. Paths are
//! rendered as `a.b[2].c`; keys that would be ambiguous are quoted as `["a.b"]`.
//! A scalar or empty root is the single leaf with the empty path.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};

use fabricsync_core::types::FieldDiff;

use crate::ignore::IgnoreSet;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment<'a> {
    Key(&'a str),
    Index(usize),
}

/// Differing leaves plus the size of the leaf-path union they were drawn from.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeDiff {
    pub differing: Vec<FieldDiff>,
    pub union_leaves: usize,
}

/// Rendered leaf paths of `value`, sorted.
pub fn leaf_paths(value: &Value) -> BTreeSet<String> {
    let mut out = BTreeMap::new();
    collect_leaves(value, &mut Vec::new(), &IgnoreSet::empty(), &mut out);
    out.into_keys().collect()
}

/// Compare two trees leaf by leaf, skipping ignored paths.
///
/// Ignored subtrees are pruned from both sides first, so a container holding
/// only server-managed fields compares as empty. Every leaf path of either
/// pruned side is then looked up in both; a path whose values differ
/// (including present-vs-absent) is reported once.
pub fn structural_diff(desired: &Value, actual: &Value, ignore: &IgnoreSet) -> TreeDiff {
    let desired = prune(desired, &mut Vec::new(), ignore);
    let actual = prune(actual, &mut Vec::new(), ignore);

    let mut leaves: BTreeMap<String, Vec<Segment<'_>>> = BTreeMap::new();
    collect_leaves(&desired, &mut Vec::new(), ignore, &mut leaves);
    collect_leaves(&actual, &mut Vec::new(), ignore, &mut leaves);

    let mut differing = Vec::new();
    for (path, segments) in &leaves {
        let d = lookup(&desired, segments);
        let a = lookup(&actual, segments);
        let same = match (d, a) {
            (Some(d), Some(a)) => values_equal(d, a),
            (None, None) => true,
            _ => false,
        };
        if !same {
            differing.push(FieldDiff {
                path: path.clone(),
                desired: d.cloned(),
                actual: a.cloned(),
            });
        }
    }

    TreeDiff {
        differing,
        union_leaves: leaves.len(),
    }
}

/// `value` without its ignored subtrees. A map left empty only because
/// everything in it was ignored is dropped too. An ignored sequence item
/// becomes a `null` placeholder so the items after it keep their index.
fn prune<'a>(value: &'a Value, prefix: &mut Vec<Segment<'a>>, ignore: &IgnoreSet) -> Value {
    match value {
        Value::Object(map) => {
            let mut kept = Map::new();
            for (k, v) in map {
                prefix.push(Segment::Key(k));
                if !ignore.is_ignored(&render(prefix)) {
                    let child = prune(v, prefix, ignore);
                    if !emptied(v, &child) {
                        kept.insert(k.clone(), child);
                    }
                }
                prefix.pop();
            }
            Value::Object(kept)
        }
        Value::Array(items) => {
            let mut kept = Vec::with_capacity(items.len());
            for (i, v) in items.iter().enumerate() {
                prefix.push(Segment::Index(i));
                kept.push(if ignore.is_ignored(&render(prefix)) {
                    Value::Null
                } else {
                    prune(v, prefix, ignore)
                });
                prefix.pop();
            }
            Value::Array(kept)
        }
        _ => value.clone(),
    }
}

fn emptied(before: &Value, after: &Value) -> bool {
    matches!((before, after), (Value::Object(b), Value::Object(a)) if !b.is_empty() && a.is_empty())
}

/// Add the leaves below `value` to `out`. A container with nothing left
/// below it is a leaf itself. Returns `false` for an ignored path.
fn collect_leaves<'a>(
    value: &'a Value,
    prefix: &mut Vec<Segment<'a>>,
    ignore: &IgnoreSet,
    out: &mut BTreeMap<String, Vec<Segment<'a>>>,
) -> bool {
    if !prefix.is_empty() && ignore.is_ignored(&render(prefix)) {
        return false;
    }
    let mut below = false;
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                prefix.push(Segment::Key(k));
                below |= collect_leaves(v, prefix, ignore, out);
                prefix.pop();
            }
        }
        Value::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                prefix.push(Segment::Index(i));
                below |= collect_leaves(v, prefix, ignore, out);
                prefix.pop();
            }
        }
        _ => {}
    }
    if !below {
        out.entry(render(prefix)).or_insert_with(|| prefix.clone());
    }
    true
}

fn lookup<'v>(root: &'v Value, segments: &[Segment<'_>]) -> Option<&'v Value> {
    let mut cur = root;
    for seg in segments {
        cur = match (seg, cur) {
            (Segment::Key(k), Value::Object(map)) => map.get(*k)?,
            (Segment::Index(i), Value::Array(items)) => items.get(*i)?,
            _ => return None,
        };
    }
    Some(cur)
}

/// Structural equality, with `1500` and `1500.0` treated as the same number.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
                return x == y;
            }
            if let (Some(x), Some(y)) = (x.as_u64(), y.as_u64()) {
                return x == y;
            }
            match (x.as_f64(), y.as_f64()) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            }
        }
        _ => a == b,
    }
}

fn render(segments: &[Segment<'_>]) -> String {
    let mut out = String::new();
    for seg in segments {
        match seg {
            Segment::Key(k) if k.contains(['.', '[', ']']) || k.is_empty() => {
                out.push_str(&format!("[{k:?}]"));
            }
            Segment::Key(k) => {
                if !out.is_empty() {
                    out.push('.');
                }
                out.push_str(k);
            }
            Segment::Index(i) => out.push_str(&format!("[{i}]")),
        }
    }
    out
}
