//! Structural diff between two dashboard documents.
//!
//! Arrays of objects that all carry a unique `id` (panels) or `refId` (targets) are matched by
//! that key, so a change inside panel 7 is reported as `panels[id=7]...` even if earlier
//! panels were added or removed. Other arrays are compared position by position. A change in
//! the order of shared keys or identified elements is reported once, at the container.

use std::collections::BTreeSet;
use std::fmt::Write as _;

use serde_json::Value;

use crate::display::clip_value;
use crate::path::{KeyPath, Segment, Selector};

const MAX_VALUE_CHARS: usize = 120;
const IDENTITY_KEYS: [&str; 2] = ["id", "refId"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Removed,
    Modified,
    /// Same members, different order. `before`/`after` hold the keys or ids in order.
    Reordered,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub path: String,
    pub kind: ChangeKind,
    pub before: Option<Value>,
    pub after: Option<Value>,
}

pub fn diff(before: &Value, after: &Value) -> Vec<Change> {
    let mut out = Vec::new();
    let mut path = Vec::new();
    walk(&mut path, before, after, &mut out);
    out
}

fn render(path: &[Segment]) -> String {
    if path.is_empty() {
        "<root>".to_string()
    } else {
        KeyPath::from_segments(path.to_vec()).as_str().to_string()
    }
}

fn push(out: &mut Vec<Change>, path: &[Segment], before: Option<&Value>, after: Option<&Value>) {
    let kind = match (before, after) {
        (None, Some(_)) => ChangeKind::Added,
        (Some(_), None) => ChangeKind::Removed,
        _ => ChangeKind::Modified,
    };
    out.push(Change {
        path: render(path),
        kind,
        before: before.cloned(),
        after: after.cloned(),
    });
}

/// Equality that also compares object key order, which `Value`'s `PartialEq` ignores.
pub fn same(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a
                    .iter()
                    .zip(b.iter())
                    .all(|((ka, va), (kb, vb))| ka == kb && same(va, vb))
        }
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b.iter()).all(|(va, vb)| same(va, vb))
        }
        _ => a == b,
    }
}

/// Push a `Reordered` change when the members common to both sequences appear in a
/// different order.
fn push_order(out: &mut Vec<Change>, path: &[Segment], a: Vec<Value>, b: Vec<Value>) {
    let a: Vec<Value> = a.into_iter().filter(|v| b.contains(v)).collect();
    let b: Vec<Value> = b.into_iter().filter(|v| a.contains(v)).collect();
    if a != b {
        out.push(Change {
            path: render(path),
            kind: ChangeKind::Reordered,
            before: Some(Value::Array(a)),
            after: Some(Value::Array(b)),
        });
    }
}

fn walk(path: &mut Vec<Segment>, before: &Value, after: &Value, out: &mut Vec<Change>) {
    if same(before, after) {
        return;
    }
    match (before, after) {
        (Value::Object(a), Value::Object(b)) => {
            push_order(
                out,
                path,
                a.keys().cloned().map(Value::String).collect(),
                b.keys().cloned().map(Value::String).collect(),
            );
            for (k, va) in a {
                path.push(Segment::Key(k.clone()));
                match b.get(k) {
                    Some(vb) => walk(path, va, vb, out),
                    None => push(out, path, Some(va), None),
                }
                path.pop();
            }
            for (k, vb) in b {
                if !a.contains_key(k) {
                    path.push(Segment::Key(k.clone()));
                    push(out, path, None, Some(vb));
                    path.pop();
                }
            }
        }
        (Value::Array(a), Value::Array(b)) => match identity_key(a, b) {
            Some(key) => walk_keyed(path, key, a, b, out),
            None => {
                for i in 0..a.len().max(b.len()) {
                    path.push(Segment::Index(i));
                    match (a.get(i), b.get(i)) {
                        (Some(va), Some(vb)) => walk(path, va, vb, out),
                        (va, vb) => push(out, path, va, vb),
                    }
                    path.pop();
                }
            }
        },
        _ => push(out, path, Some(before), Some(after)),
    }
}

/// An identity key usable for both arrays: every element is an object with a scalar,
/// unique value under it.
fn identity_key(a: &[Value], b: &[Value]) -> Option<&'static str> {
    if a.is_empty() && b.is_empty() {
        return None;
    }
    IDENTITY_KEYS.into_iter().find(|key| {
        [a, b].iter().all(|items| {
            let mut seen = BTreeSet::new();
            items.iter().all(|item| match item.get(*key) {
                Some(v @ (Value::String(_) | Value::Number(_))) => seen.insert(v.to_string()),
                _ => false,
            })
        })
    })
}

fn walk_keyed(
    path: &mut Vec<Segment>,
    key: &str,
    a: &[Value],
    b: &[Value],
    out: &mut Vec<Change>,
) {
    let id_of = |v: &Value| v.get(key).cloned().unwrap_or(Value::Null);
    let seg = |v: &Value| {
        Segment::Select(Selector {
            field: vec![key.to_string()],
            value: id_of(v),
        })
    };
    push_order(out, path, a.iter().map(id_of).collect(), b.iter().map(id_of).collect());

    for va in a {
        path.push(seg(va));
        match b.iter().find(|vb| id_of(vb) == id_of(va)) {
            Some(vb) => walk(path, va, vb, out),
            None => push(out, path, Some(va), None),
        }
        path.pop();
    }
    for vb in b {
        if !a.iter().any(|va| id_of(va) == id_of(vb)) {
            path.push(seg(vb));
            push(out, path, None, Some(vb));
            path.pop();
        }
    }
}

/// One line per change: `+ path: value`, `- path: value`, `~ path: old -> new`.
pub fn render_changes(changes: &[Change]) -> String {
    let mut out = String::new();
    for c in changes {
        let show = |v: &Option<Value>| {
            v.as_ref()
                .map(|v| clip_value(v, MAX_VALUE_CHARS))
                .unwrap_or_default()
        };
        let path = crate::display::sanitize(&c.path, 512);
        let _ = match c.kind {
            ChangeKind::Added => writeln!(out, "+ {path}: {}", show(&c.after)),
            ChangeKind::Removed => writeln!(out, "- {path}: {}", show(&c.before)),
            ChangeKind::Modified => writeln!(
                out,
                "~ {path}: {} -> {}",
                show(&c.before),
                show(&c.after)
            ),
            ChangeKind::Reordered => writeln!(
                out,
                "~ {path}: order {} -> {}",
                show(&c.before),
                show(&c.after)
            ),
        };
    }
    out
}
