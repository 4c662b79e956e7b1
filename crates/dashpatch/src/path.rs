//! Key paths addressing values inside a panel (or the dashboard root).
//!
//! Grammar: segments separated by `.`; `name` and `["quoted name"]` address object keys,
//! `[N]` an array index, `[field=value]` every array element whose `field` equals `value`,
//! and `[*]` every element of an array.

use std::fmt;

use serde_json::{Map, Value};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Key(String),
    Index(usize),
    Select(Selector),
    All,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Selector {
    pub field: Vec<String>,
    pub value: Value,
}

impl Selector {
    fn field_value<'a>(&self, elem: &'a Value) -> Option<&'a Value> {
        let mut cur = elem;
        for key in &self.field {
            cur = cur.as_object()?.get(key)?;
        }
        Some(cur)
    }

    pub fn matches(&self, elem: &Value) -> bool {
        let Some(found) = self.field_value(elem) else {
            return false;
        };
        if found == &self.value {
            return true;
        }
        match (found, &self.value) {
            (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
            (Value::String(s), Value::Number(_) | Value::Bool(_)) => *s == self.value.to_string(),
            _ => false,
        }
    }

    /// Element appended when a `set` finds no match.
    fn seed(&self) -> Value {
        let mut out = self.value.clone();
        for key in self.field.iter().rev() {
            let mut obj = Map::new();
            obj.insert(key.clone(), out);
            out = Value::Object(obj);
        }
        out
    }

    /// Make an object written at this selector carry the selected field, so the path keeps
    /// matching it on the next run.
    fn stamp(&self, value: &mut Value) -> std::result::Result<(), String> {
        if !value.is_object() {
            return Err(format!(
                "value written at selector [{}] must be an object, found {}",
                self.field.join("."),
                kind_name(value)
            ));
        }
        let mut cur = &mut *value;
        let (last, parents) = self
            .field
            .split_last()
            .ok_or_else(|| "selector field is empty".to_string())?;
        for key in parents {
            let obj = cur.as_object_mut().ok_or_else(|| {
                format!("selector field '{key}' is not an object in the written value")
            })?;
            cur = obj
                .entry(key.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if cur.is_null() {
                *cur = Value::Object(Map::new());
            }
        }
        let obj = cur
            .as_object_mut()
            .ok_or_else(|| "selector field parent is not an object".to_string())?;
        match obj.get(last) {
            None | Some(Value::Null) => {
                obj.insert(last.clone(), self.value.clone());
            }
            Some(_) => {}
        }
        if self.matches(value) {
            Ok(())
        } else {
            Err(format!(
                "written value changes selector field '{}' so it would no longer match",
                self.field.join(".")
            ))
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Key(k) if is_plain_key(k) => write!(f, "{k}"),
            Segment::Key(k) => write!(f, "[{}]", quote(k)),
            Segment::Index(i) => write!(f, "[{i}]"),
            Segment::Select(sel) => {
                let value = match &sel.value {
                    Value::String(s) if is_plain_key(s) && literal(s) == sel.value => s.clone(),
                    Value::String(s) => quote(s),
                    other => other.to_string(),
                };
                write!(f, "[{}={}]", sel.field.join("."), value)
            }
            Segment::All => write!(f, "[*]"),
        }
    }
}

fn is_plain_key(k: &str) -> bool {
    !k.is_empty()
        && !k
            .chars()
            .any(|c| matches!(c, '.' | '[' | ']' | '"' | '=') || c.is_whitespace())
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

pub fn kind_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a bool",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeyPath {
    raw: String,
    segments: Vec<Segment>,
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl KeyPath {
    pub fn parse(raw: &str) -> Result<Self> {
        let segments = Parser::new(raw).parse()?;
        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn from_segments(segments: Vec<Segment>) -> Self {
        let raw = render(&segments);
        Self { raw, segments }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn first_key(&self) -> Option<&str> {
        match self.segments.first() {
            Some(Segment::Key(k)) => Some(k),
            _ => None,
        }
    }

    fn err(&self, reason: impl Into<String>) -> Error {
        Error::invalid_path(&self.raw, reason)
    }

    fn prefix(&self, depth: usize) -> String {
        if depth == 0 {
            "<root>".to_string()
        } else {
            render(&self.segments[..depth])
        }
    }

    /// Positional deletes shift later elements, so running them twice removes two elements.
    pub fn check_deletable(&self) -> Result<()> {
        if let Some(Segment::Index(_)) = self.segments.last() {
            return Err(self.err(
                "deleting by array index is not idempotent; select the element with [field=value]",
            ));
        }
        Ok(())
    }

    /// Read-only lookup of every value the path currently addresses.
    pub fn resolve<'a>(&self, root: &'a Value) -> Vec<&'a Value> {
        let mut out = Vec::new();
        collect_ref(root, &self.segments, &mut out);
        out
    }

    /// Set `value` at this path, creating missing intermediate containers.
    pub fn set(&self, root: &mut Value, value: &Value) -> Result<()> {
        self.set_at(root, 0, value)
    }

    fn set_at(&self, cur: &mut Value, depth: usize, value: &Value) -> Result<()> {
        let Some(seg) = self.segments.get(depth) else {
            *cur = value.clone();
            return Ok(());
        };
        let last = depth + 1 == self.segments.len();
        if cur.is_null() {
            *cur = match seg {
                Segment::Key(_) => Value::Object(Map::new()),
                _ => Value::Array(Vec::new()),
            };
        }

        match seg {
            Segment::Key(k) => {
                let Some(obj) = cur.as_object_mut() else {
                    return Err(self.err(format!(
                        "expected an object at '{}', found {}",
                        self.prefix(depth),
                        kind_name(cur)
                    )));
                };
                let child = obj.entry(k.clone()).or_insert(Value::Null);
                self.set_at(child, depth + 1, value)
            }
            Segment::Index(i) => {
                let arr = self.array_mut(cur, depth)?;
                let len = arr.len();
                if *i > len {
                    return Err(self.err(format!(
                        "index {i} is out of bounds for '{}' (length {len})",
                        self.prefix(depth)
                    )));
                }
                if *i == len {
                    arr.push(Value::Null);
                }
                self.set_at(&mut arr[*i], depth + 1, value)
            }
            Segment::Select(sel) => {
                let stamped;
                let value = if last {
                    let mut v = value.clone();
                    sel.stamp(&mut v).map_err(|reason| self.err(reason))?;
                    stamped = v;
                    &stamped
                } else {
                    value
                };
                let arr = self.array_mut(cur, depth)?;
                if !arr.iter().any(|e| sel.matches(e)) {
                    arr.push(sel.seed());
                }
                for elem in arr.iter_mut().filter(|e| sel.matches(e)) {
                    self.set_at(elem, depth + 1, value)?;
                }
                Ok(())
            }
            Segment::All => {
                let arr = self.array_mut(cur, depth)?;
                for elem in arr.iter_mut() {
                    self.set_at(elem, depth + 1, value)?;
                }
                Ok(())
            }
        }
    }

    fn array_mut<'a>(&self, cur: &'a mut Value, depth: usize) -> Result<&'a mut Vec<Value>> {
        let kind = kind_name(cur);
        cur.as_array_mut().ok_or_else(|| {
            self.err(format!(
                "expected an array at '{}', found {kind}",
                self.prefix(depth)
            ))
        })
    }

    /// Delete whatever the path addresses. Missing paths are a no-op; returns the number of
    /// removed values.
    pub fn delete(&self, root: &mut Value) -> Result<usize> {
        self.check_deletable()?;
        self.delete_at(root, 0)
    }

    fn delete_at(&self, cur: &mut Value, depth: usize) -> Result<usize> {
        let Some(seg) = self.segments.get(depth) else {
            return Ok(0);
        };
        if cur.is_null() {
            return Ok(0);
        }
        let last = depth + 1 == self.segments.len();

        match seg {
            Segment::Key(k) => {
                let Some(obj) = cur.as_object_mut() else {
                    return Err(self.err(format!(
                        "expected an object at '{}', found {}",
                        self.prefix(depth),
                        kind_name(cur)
                    )));
                };
                if last {
                    return Ok(usize::from(obj.shift_remove(k).is_some()));
                }
                match obj.get_mut(k) {
                    Some(child) => self.delete_at(child, depth + 1),
                    None => Ok(0),
                }
            }
            Segment::Index(i) => {
                let arr = self.array_mut(cur, depth)?;
                match arr.get_mut(*i) {
                    Some(child) => self.delete_at(child, depth + 1),
                    None => Ok(0),
                }
            }
            Segment::Select(sel) => {
                let arr = self.array_mut(cur, depth)?;
                if last {
                    let before = arr.len();
                    arr.retain(|e| !sel.matches(e));
                    return Ok(before - arr.len());
                }
                let mut removed = 0;
                for elem in arr.iter_mut().filter(|e| sel.matches(e)) {
                    removed += self.delete_at(elem, depth + 1)?;
                }
                Ok(removed)
            }
            Segment::All => {
                let arr = self.array_mut(cur, depth)?;
                if last {
                    let removed = arr.len();
                    arr.clear();
                    return Ok(removed);
                }
                let mut removed = 0;
                for elem in arr.iter_mut() {
                    removed += self.delete_at(elem, depth + 1)?;
                }
                Ok(removed)
            }
        }
    }

    /// Mutable access to every existing value the path addresses. Missing branches yield
    /// nothing; a scalar where a container is required is an error.
    pub fn resolve_mut<'a>(&self, root: &'a mut Value) -> Result<Vec<&'a mut Value>> {
        let mut out = Vec::new();
        self.collect_mut(root, 0, &mut out)?;
        Ok(out)
    }

    fn collect_mut<'a>(
        &self,
        cur: &'a mut Value,
        depth: usize,
        out: &mut Vec<&'a mut Value>,
    ) -> Result<()> {
        let Some(seg) = self.segments.get(depth) else {
            out.push(cur);
            return Ok(());
        };
        if cur.is_null() {
            return Ok(());
        }
        match seg {
            Segment::Key(k) => {
                let kind = kind_name(cur);
                let Some(obj) = cur.as_object_mut() else {
                    return Err(self.err(format!(
                        "expected an object at '{}', found {kind}",
                        self.prefix(depth)
                    )));
                };
                if let Some(child) = obj.get_mut(k) {
                    self.collect_mut(child, depth + 1, out)?;
                }
            }
            Segment::Index(i) => {
                if let Some(child) = self.array_mut(cur, depth)?.get_mut(*i) {
                    self.collect_mut(child, depth + 1, out)?;
                }
            }
            Segment::Select(sel) => {
                for elem in self.array_mut(cur, depth)?.iter_mut() {
                    if sel.matches(elem) {
                        self.collect_mut(elem, depth + 1, out)?;
                    }
                }
            }
            Segment::All => {
                for elem in self.array_mut(cur, depth)?.iter_mut() {
                    self.collect_mut(elem, depth + 1, out)?;
                }
            }
        }
        Ok(())
    }
}

fn collect_ref<'a>(cur: &'a Value, segs: &[Segment], out: &mut Vec<&'a Value>) {
    let Some((seg, rest)) = segs.split_first() else {
        out.push(cur);
        return;
    };
    match (seg, cur) {
        (Segment::Key(k), Value::Object(obj)) => {
            if let Some(child) = obj.get(k) {
                collect_ref(child, rest, out);
            }
        }
        (Segment::Index(i), Value::Array(arr)) => {
            if let Some(child) = arr.get(*i) {
                collect_ref(child, rest, out);
            }
        }
        (Segment::Select(sel), Value::Array(arr)) => {
            for elem in arr.iter().filter(|e| sel.matches(e)) {
                collect_ref(elem, rest, out);
            }
        }
        (Segment::All, Value::Array(arr)) => {
            for elem in arr {
                collect_ref(elem, rest, out);
            }
        }
        _ => {}
    }
}

fn render(segments: &[Segment]) -> String {
    let mut out = String::new();
    for seg in segments {
        let piece = seg.to_string();
        if !out.is_empty() && !piece.starts_with('[') {
            out.push('.');
        }
        out.push_str(&piece);
    }
    out
}

struct Parser<'a> {
    raw: &'a str,
    chars: Vec<char>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(raw: &'a str) -> Self {
        Self {
            raw,
            chars: raw.chars().collect(),
            pos: 0,
        }
    }

    fn err(&self, reason: impl Into<String>) -> Error {
        Error::invalid_path(self.raw, reason)
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn parse(mut self) -> Result<Vec<Segment>> {
        let mut out = Vec::new();
        // A key is allowed here (start of path or right after a '.').
        let mut want_key = true;

        while let Some(c) = self.peek() {
            match c {
                '[' => {
                    self.pos += 1;
                    out.push(self.bracket()?);
                    want_key = false;
                }
                '.' => {
                    if want_key {
                        return Err(self.err(format!("empty key at offset {}", self.pos)));
                    }
                    self.pos += 1;
                    want_key = true;
                    if self.peek().is_none() {
                        return Err(self.err("path ends with '.'"));
                    }
                }
                ']' => return Err(self.err(format!("unexpected ']' at offset {}", self.pos))),
                _ => {
                    if !want_key {
                        return Err(self.err(format!(
                            "expected '.' or '[' at offset {}",
                            self.pos
                        )));
                    }
                    let start = self.pos;
                    while let Some(c) = self.peek() {
                        if matches!(c, '.' | '[' | ']') {
                            break;
                        }
                        self.pos += 1;
                    }
                    let key: String = self.chars[start..self.pos].iter().collect();
                    out.push(Segment::Key(key));
                    want_key = false;
                }
            }
        }

        if out.is_empty() {
            return Err(self.err("path is empty"));
        }
        Ok(out)
    }

    fn quoted(&mut self) -> Result<String> {
        // Caller has consumed the opening quote.
        let mut out = String::new();
        loop {
            match self.peek() {
                None => return Err(self.err("unterminated quoted key")),
                Some('\\') => {
                    self.pos += 1;
                    match self.peek() {
                        Some(c @ ('"' | '\\')) => out.push(c),
                        Some(c) => {
                            return Err(self.err(format!("unsupported escape '\\{c}'")));
                        }
                        None => return Err(self.err("unterminated quoted key")),
                    }
                    self.pos += 1;
                }
                Some('"') => {
                    self.pos += 1;
                    return Ok(out);
                }
                Some(c) => {
                    out.push(c);
                    self.pos += 1;
                }
            }
        }
    }

    fn expect_close(&mut self) -> Result<()> {
        if self.peek() == Some(']') {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.err(format!("expected ']' at offset {}", self.pos)))
        }
    }

    fn bracket(&mut self) -> Result<Segment> {
        if self.peek() == Some('"') {
            self.pos += 1;
            let key = self.quoted()?;
            self.expect_close()?;
            if key.is_empty() {
                return Err(self.err("empty quoted key"));
            }
            return Ok(Segment::Key(key));
        }

        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == ']' || c == '=' {
                break;
            }
            self.pos += 1;
        }
        let head: String = self.chars[start..self.pos].iter().collect();
        let head = head.trim().to_string();

        match self.peek() {
            None => Err(self.err("unterminated '['")),
            Some(']') => {
                self.pos += 1;
                if head == "*" {
                    return Ok(Segment::All);
                }
                head.parse::<usize>().map(Segment::Index).map_err(|_| {
                    self.err(format!(
                        "'[{head}]' is not an index, a [field=value] selector or [*]"
                    ))
                })
            }
            Some(_) => {
                // '='
                self.pos += 1;
                let field: Vec<String> = head.split('.').map(|s| s.trim().to_string()).collect();
                if field.iter().any(String::is_empty) {
                    return Err(self.err(format!("selector field '{head}' is empty")));
                }
                let value = if self.peek() == Some('"') {
                    self.pos += 1;
                    Value::String(self.quoted()?)
                } else {
                    let vstart = self.pos;
                    while let Some(c) = self.peek() {
                        if c == ']' {
                            break;
                        }
                        self.pos += 1;
                    }
                    let raw: String = self.chars[vstart..self.pos].iter().collect();
                    literal(raw.trim())
                };
                self.expect_close()?;
                Ok(Segment::Select(Selector { field, value }))
            }
        }
    }
}

/// Unquoted selector values: integers, floats and booleans keep their JSON type.
fn literal(raw: &str) -> Value {
    match raw {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(n) = raw.parse::<i64>() {
        return Value::from(n);
    }
    if let Ok(f) = raw.parse::<f64>()
        && let Some(n) = serde_json::Number::from_f64(f)
    {
        return Value::Number(n);
    }
    Value::String(raw.to_string())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn p(raw: &str) -> KeyPath {
        KeyPath::parse(raw).expect("path should parse")
    }

    #[test]
    fn parses_keys_indexes_selectors_and_quotes() {
        let path = p(r#"transformations[1].options.renameByName["Value #status"]"#);
        assert_eq!(
            path.segments(),
            &[
                Segment::Key("transformations".into()),
                Segment::Index(1),
                Segment::Key("options".into()),
                Segment::Key("renameByName".into()),
                Segment::Key("Value #status".into()),
            ]
        );

        let path = p("fieldConfig.overrides[matcher.options=Status].properties[*]");
        assert_eq!(
            path.segments()[2],
            Segment::Select(Selector {
                field: vec!["matcher".into(), "options".into()],
                value: json!("Status"),
            })
        );
        assert_eq!(path.segments()[4], Segment::All);
    }

    #[test]
    fn rejects_bad_paths() {
        for raw in ["", ".a", "a.", "a..b", "a[", "a[x]", "a]b", r#"a["x"#, "a[=1]", "a[0]b"] {
            let err = KeyPath::parse(raw).unwrap_err();
            assert_eq!(err.kind(), "InvalidKeyPath", "{raw} should be rejected");
        }
    }

    #[test]
    fn unquoted_selector_values_keep_their_type() {
        let path = p("targets[refId=A]");
        let Segment::Select(sel) = &path.segments()[0] else {
            panic!("expected selector");
        };
        assert_eq!(sel.value, json!("A"));

        let path = p("panels[id=7]");
        let Segment::Select(sel) = &path.segments()[0] else {
            panic!("expected selector");
        };
        assert_eq!(sel.value, json!(7));
        assert!(sel.matches(&json!({"id": 7})));
        assert!(sel.matches(&json!({"id": "7"})));
        assert!(!sel.matches(&json!({"id": 8})));
    }

    #[test]
    fn set_creates_intermediate_containers() {
        let mut v = json!({"title": "CPU"});
        p("fieldConfig.defaults.custom.cellOptions.type")
            .set(&mut v, &json!("gauge"))
            .unwrap();
        p("targets[0].expr").set(&mut v, &json!("up")).unwrap();
        assert_eq!(
            v,
            json!({
                "title": "CPU",
                "fieldConfig": {"defaults": {"custom": {"cellOptions": {"type": "gauge"}}}},
                "targets": [{"expr": "up"}]
            })
        );
    }

    #[test]
    fn set_through_scalar_is_invalid() {
        let mut v = json!({"options": 5});
        let err = p("options.legend").set(&mut v, &json!(true)).unwrap_err();
        assert!(
            err.to_string().contains("expected an object at 'options'"),
            "unexpected err: {err}"
        );
        assert_eq!(v, json!({"options": 5}));
    }

    #[test]
    fn set_index_past_end_is_invalid() {
        let mut v = json!({"targets": []});
        let err = p("targets[1].expr").set(&mut v, &json!("x")).unwrap_err();
        assert!(err.to_string().contains("out of bounds"), "unexpected err: {err}");
    }

    #[test]
    fn selector_set_appends_once() {
        let mut v = json!({"targets": [{"refId": "A", "expr": "a"}]});
        let path = p("targets[refId=B].expr");
        path.set(&mut v, &json!("b")).unwrap();
        let once = v.clone();
        path.set(&mut v, &json!("b")).unwrap();
        assert_eq!(v, once);
        assert_eq!(
            v,
            json!({"targets": [{"refId": "A", "expr": "a"}, {"refId": "B", "expr": "b"}]})
        );
    }

    #[test]
    fn selector_set_stamps_the_selected_field() {
        let mut v = json!({"targets": []});
        p("targets[refId=A]")
            .set(&mut v, &json!({"expr": "up"}))
            .unwrap();
        assert_eq!(v, json!({"targets": [{"refId": "A", "expr": "up"}]}));

        let err = p("targets[refId=A]")
            .set(&mut v, &json!({"refId": "B"}))
            .unwrap_err();
        assert!(err.to_string().contains("no longer match"), "unexpected err: {err}");
    }

    #[test]
    fn delete_is_idempotent_and_rejects_positions() {
        let mut v = json!({
            "options": {"legend": {"calcs": ["mean"], "showLegend": true}},
            "targets": [{"refId": "A"}, {"refId": "B"}]
        });
        assert_eq!(p("options.legend.calcs").delete(&mut v).unwrap(), 1);
        assert_eq!(p("options.legend.calcs").delete(&mut v).unwrap(), 0);
        assert_eq!(p("missing.deeper").delete(&mut v).unwrap(), 0);
        assert_eq!(p("targets[refId=B]").delete(&mut v).unwrap(), 1);
        assert_eq!(
            v,
            json!({"options": {"legend": {"showLegend": true}}, "targets": [{"refId": "A"}]})
        );

        let err = p("targets[0]").delete(&mut v).unwrap_err();
        assert_eq!(err.kind(), "InvalidKeyPath");
    }

    #[test]
    fn delete_keeps_key_order() {
        let mut v = json!({"a": 1, "b": 2, "c": 3});
        p("a").delete(&mut v).unwrap();
        let keys: Vec<&String> = v.as_object().unwrap().keys().collect();
        assert_eq!(keys, ["b", "c"]);
    }

    #[test]
    fn wildcard_reaches_every_element() {
        let mut v = json!({"targets": [{"refId": "A"}, {"refId": "B"}]});
        p("targets[*].datasource.uid")
            .set(&mut v, &json!("prometheus"))
            .unwrap();
        let found = p("targets[*].datasource.uid").resolve(&v);
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|uid| *uid == &json!("prometheus")));
    }

    #[test]
    fn display_round_trips_through_parse() {
        let path = KeyPath::from_segments(vec![
            Segment::Key("renameByName".into()),
            Segment::Key("Value #status".into()),
            Segment::Select(Selector {
                field: vec!["refId".into()],
                value: json!("A"),
            }),
        ]);
        assert_eq!(path.as_str(), r#"renameByName["Value #status"][refId=A]"#);
        assert_eq!(KeyPath::parse(path.as_str()).unwrap(), path);
    }
}
