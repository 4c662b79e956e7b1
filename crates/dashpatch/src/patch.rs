//! Declarative patch documents.
//!
//! A patch names panels by id and lists the key paths to delete, set, rewrite or the field
//! overrides to upsert in each. Patches are read from JSON or TOML and validated up front so
//! that grammar mistakes fail before the dashboard is touched.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::dashboard::PanelId;
use crate::error::{Error, Result};
use crate::path::{KeyPath, Segment};

pub const STDIN_SOURCE: &str = "-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchFormat {
    Json,
    Toml,
}

impl PatchFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Some(Self::Json),
            Some("toml") => Some(Self::Toml),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OverrideProperty {
    pub id: String,
    pub value: Value,
}

/// A fieldConfig override rule, keyed by its whole `matcher`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OverrideRule {
    pub matcher: Value,
    #[serde(default)]
    pub properties: Vec<OverrideProperty>,
}

#[derive(Debug, Clone)]
pub struct Rewrite {
    pub path: KeyPath,
    pub pattern: Regex,
    pub with: String,
}

#[derive(Debug, Clone, Default)]
pub struct Ops {
    pub delete: Vec<KeyPath>,
    pub set: Vec<(KeyPath, Value)>,
    pub replace: Vec<Rewrite>,
}

impl Ops {
    pub fn is_empty(&self) -> bool {
        self.delete.is_empty() && self.set.is_empty() && self.replace.is_empty()
    }
}

/// What to do when a mutation names a panel the dashboard does not have.
#[derive(Debug, Clone, PartialEq)]
pub enum Missing {
    Fail,
    Skip,
    Create(Value),
}

#[derive(Debug, Clone)]
pub struct PanelMutation {
    pub id: PanelId,
    pub missing: Missing,
    pub ops: Ops,
    pub overrides: Vec<OverrideRule>,
}

#[derive(Debug, Clone, Default)]
pub struct Patch {
    pub name: String,
    pub description: Option<String>,
    pub remove: Vec<PanelId>,
    /// Sorted by panel id.
    pub panels: Vec<PanelMutation>,
    pub dashboard: Option<Ops>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRewrite {
    path: String,
    pattern: String,
    #[serde(default)]
    with: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawOps {
    #[serde(default)]
    set: Map<String, Value>,
    #[serde(default)]
    delete: Vec<String>,
    #[serde(default)]
    replace: Vec<RawRewrite>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPanelMutation {
    #[serde(default)]
    set: Map<String, Value>,
    #[serde(default)]
    delete: Vec<String>,
    #[serde(default)]
    replace: Vec<RawRewrite>,
    #[serde(default)]
    overrides: Vec<OverrideRule>,
    #[serde(default)]
    upsert: bool,
    #[serde(default)]
    optional: bool,
    #[serde(default)]
    template: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPatch {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    dashboard: Option<RawOps>,
    #[serde(default)]
    remove: Vec<PanelId>,
    #[serde(default)]
    panels: BTreeMap<String, RawPanelMutation>,
}

fn parse_ops(
    source: &str,
    set: Map<String, Value>,
    delete: Vec<String>,
    replace: Vec<RawRewrite>,
) -> Result<Ops> {
    let mut ops = Ops::default();
    for raw in delete {
        let path = KeyPath::parse(&raw)?;
        path.check_deletable()?;
        ops.delete.push(path);
    }
    for (raw, value) in set {
        ops.set.push((KeyPath::parse(&raw)?, value));
    }
    for r in replace {
        let path = KeyPath::parse(&r.path)?;
        let pattern = Regex::new(&r.pattern).map_err(|e| {
            Error::malformed_patch(source, format!("invalid pattern for '{}': {e}", r.path))
        })?;
        ops.replace.push(Rewrite {
            path,
            pattern,
            with: r.with,
        });
    }
    Ok(ops)
}

fn guard_first_key(ops: &Ops, forbidden: &str, reason: &str) -> Result<()> {
    let paths = ops
        .delete
        .iter()
        .chain(ops.set.iter().map(|(p, _)| p))
        .chain(ops.replace.iter().map(|r| &r.path));
    for p in paths {
        if p.first_key() == Some(forbidden) {
            return Err(Error::invalid_path(p.as_str(), reason));
        }
    }
    Ok(())
}

/// Row panels hold their children under `panels`; an `id` reached through an element of that
/// array is a child panel's id.
fn guard_child_ids(ops: &Ops) -> Result<()> {
    let paths = ops
        .delete
        .iter()
        .chain(ops.set.iter().map(|(p, _)| p))
        .chain(ops.replace.iter().map(|r| &r.path));
    for p in paths {
        let touches = p.segments().windows(3).any(|w| {
            matches!(&w[0], Segment::Key(k) if k == "panels")
                && matches!(w[1], Segment::Index(_) | Segment::Select(_) | Segment::All)
                && matches!(&w[2], Segment::Key(k) if k == "id")
        });
        if touches {
            return Err(Error::invalid_path(p.as_str(), "panel ids are immutable"));
        }
    }
    Ok(())
}

fn parse_panel_id(source: &str, raw: &str) -> Result<PanelId> {
    raw.trim().parse::<PanelId>().map_err(|_| {
        Error::malformed_patch(source, format!("panel key '{raw}' is not an integer id"))
    })
}

fn is_shorthand(value: &Value) -> bool {
    match value.as_object() {
        Some(obj) => !obj.is_empty() && obj.keys().all(|k| k.trim().parse::<PanelId>().is_ok()),
        None => false,
    }
}

impl Patch {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.remove.is_empty()
            && self.panels.is_empty()
            && self.dashboard.as_ref().is_none_or(Ops::is_empty)
    }

    /// Build a patch from an already-decoded document. `{"7": {...}}` (panel ids at the top
    /// level) is accepted as shorthand for `{"panels": {"7": {...}}}`.
    pub fn from_value(source: &str, value: Value) -> Result<Self> {
        let value = if is_shorthand(&value) {
            let mut wrapped = Map::new();
            wrapped.insert("panels".to_string(), value);
            Value::Object(wrapped)
        } else {
            value
        };
        let raw: RawPatch = serde_json::from_value(value)
            .map_err(|e| Error::malformed_patch(source, e.to_string()))?;

        let dashboard = match raw.dashboard {
            Some(d) => {
                let ops = parse_ops(source, d.set, d.delete, d.replace)?;
                guard_first_key(&ops, "panels", "dashboard-level paths cannot edit 'panels'")?;
                Some(ops)
            }
            None => None,
        };

        let removed: BTreeSet<PanelId> = raw.remove.iter().copied().collect();
        let mut panels = Vec::with_capacity(raw.panels.len());
        for (key, m) in raw.panels {
            let id = parse_panel_id(source, &key)?;
            let missing = match (m.upsert, m.optional, m.template) {
                (true, true, _) => {
                    return Err(Error::malformed_patch(
                        source,
                        format!("panel {id}: 'upsert' and 'optional' are mutually exclusive"),
                    ));
                }
                (true, false, Some(t)) if t.is_object() => Missing::Create(t),
                (true, false, Some(_)) => {
                    return Err(Error::malformed_patch(
                        source,
                        format!("panel {id}: 'template' must be an object"),
                    ));
                }
                (true, false, None) => {
                    return Err(Error::malformed_patch(
                        source,
                        format!("panel {id}: 'upsert' requires a 'template'"),
                    ));
                }
                (false, _, Some(_)) => {
                    return Err(Error::malformed_patch(
                        source,
                        format!("panel {id}: 'template' is only used with 'upsert'"),
                    ));
                }
                (false, true, None) => Missing::Skip,
                (false, false, None) => Missing::Fail,
            };
            if removed.contains(&id) && missing == Missing::Fail {
                return Err(Error::malformed_patch(
                    source,
                    format!("panel {id} is removed and then mutated without 'upsert'"),
                ));
            }

            let ops =
                parse_ops(source, m.set, m.delete, m.replace).map_err(|e| e.in_panel(id))?;
            guard_first_key(&ops, "id", "panel ids are immutable").map_err(|e| e.in_panel(id))?;
            guard_child_ids(&ops).map_err(|e| e.in_panel(id))?;
            for rule in &m.overrides {
                if !rule.matcher.is_object() {
                    return Err(Error::malformed_patch(
                        source,
                        format!("panel {id}: override matcher must be an object"),
                    ));
                }
            }
            panels.push(PanelMutation {
                id,
                missing,
                ops,
                overrides: m.overrides,
            });
        }
        // BTreeMap order is lexical ("10" < "9").
        panels.sort_by_key(|m| m.id);
        for pair in panels.windows(2) {
            if pair[0].id == pair[1].id {
                return Err(Error::malformed_patch(
                    source,
                    format!("panel {} is listed twice", pair[0].id),
                ));
            }
        }

        let mut remove = raw.remove;
        remove.sort_unstable();
        remove.dedup();

        Ok(Self {
            name: raw.name.unwrap_or_else(|| source.to_string()),
            description: raw.description,
            remove,
            panels,
            dashboard,
        })
    }

    pub fn parse(source: &str, raw: &str, format: PatchFormat) -> Result<Self> {
        let value: Value = match format {
            PatchFormat::Json => serde_json::from_str(raw)
                .map_err(|e| Error::malformed_patch(source, format!("invalid JSON: {e}")))?,
            PatchFormat::Toml => toml::from_str(raw)
                .map_err(|e| Error::malformed_patch(source, format!("invalid TOML: {e}")))?,
        };
        Self::from_value(source, value)
    }
}

fn stem_name(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("patch")
        .to_string()
}

/// Read one patch file. `-` reads JSON from stdin.
pub fn load(path: &Path) -> Result<Patch> {
    if path.as_os_str() == STDIN_SOURCE {
        let mut raw = String::new();
        std::io::stdin()
            .read_to_string(&mut raw)
            .map_err(|e| Error::Io {
                path: path.to_path_buf(),
                source: e,
            })?;
        return Patch::parse("stdin", &raw, PatchFormat::Json);
    }

    let format = PatchFormat::from_path(path).ok_or_else(|| {
        Error::malformed_patch(
            &path.display().to_string(),
            "unknown patch format (expected .json or .toml)",
        )
    })?;
    let raw = fs::read_to_string(path).map_err(|e| Error::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let mut patch = Patch::parse(&path.display().to_string(), &raw, format)?;
    if patch.name == path.display().to_string() {
        patch.name = stem_name(path);
    }
    Ok(patch)
}

/// Expand patch arguments: files as given, directories to their `*.json`/`*.toml` entries
/// sorted by file name (not recursive).
pub fn expand_sources(args: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for arg in args {
        if arg.as_os_str() != STDIN_SOURCE && arg.is_dir() {
            let mut found = Vec::new();
            for entry in walkdir::WalkDir::new(arg)
                .min_depth(1)
                .max_depth(1)
                .sort_by_file_name()
            {
                let entry = entry.map_err(|e| {
                    Error::msg(format!("failed to list patches in {}: {e}", arg.display()))
                })?;
                if entry.file_type().is_file() && PatchFormat::from_path(entry.path()).is_some()
                {
                    found.push(entry.into_path());
                }
            }
            if found.is_empty() {
                tracing::warn!(dir = %arg.display(), "patch directory contains no .json or .toml files");
            }
            out.extend(found);
        } else {
            out.push(arg.clone());
        }
    }
    Ok(out)
}

pub fn load_all(args: &[PathBuf]) -> Result<Vec<Patch>> {
    expand_sources(args)?
        .iter()
        .map(|p| load(p))
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn patch(value: Value) -> Result<Patch> {
        Patch::from_value("test", value)
    }

    #[test]
    fn shorthand_and_full_forms_agree() {
        let short = patch(json!({"7": {"set": {"type": "stat"}}})).unwrap();
        let full = patch(json!({"panels": {"7": {"set": {"type": "stat"}}}})).unwrap();
        assert_eq!(short.panels.len(), 1);
        assert_eq!(full.panels.len(), 1);
        assert_eq!(short.panels[0].id, full.panels[0].id);
        assert_eq!(short.panels[0].ops.set[0].0.as_str(), "type");
    }

    #[test]
    fn empty_object_is_an_empty_patch() {
        let p = patch(json!({})).unwrap();
        assert!(p.is_empty());
        assert_eq!(p.name, "test");
    }

    #[test]
    fn panels_are_sorted_numerically() {
        let p = patch(json!({"panels": {"10": {}, "9": {}, "100": {}}})).unwrap();
        let ids: Vec<PanelId> = p.panels.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![9, 10, 100]);
    }

    #[test]
    fn rejects_bad_mutations() {
        let cases = [
            (json!({"panels": {"x": {}}}), "MalformedPatch"),
            (json!({"panels": {"1": {"unknown": 1}}}), "MalformedPatch"),
            (json!({"panels": {"1": {"upsert": true}}}), "MalformedPatch"),
            (json!({"panels": {"1": {"upsert": true, "optional": true, "template": {}}}}), "MalformedPatch"),
            (json!({"panels": {"1": {"template": {}}}}), "MalformedPatch"),
            (json!({"panels": {"1": {"upsert": true, "template": 3}}}), "MalformedPatch"),
            (json!({"panels": {"1": {"replace": [{"path": "title", "pattern": "("}]}}}), "MalformedPatch"),
            (json!({"panels": {"1": {"overrides": [{"matcher": "byName"}]}}}), "MalformedPatch"),
            (json!({"remove": [1], "panels": {"1": {"set": {"title": "x"}}}}), "MalformedPatch"),
            (json!({"panels": {"1": {"set": {"id": 2}}}}), "InvalidKeyPath"),
            (json!({"panels": {"30": {"set": {"panels[id=19].id": 99}}}}), "InvalidKeyPath"),
            (json!({"panels": {"30": {"set": {"panels[*].id": 99}}}}), "InvalidKeyPath"),
            (json!({"panels": {"30": {"delete": ["panels[title=CPU].id"]}}}), "InvalidKeyPath"),
            (json!({"panels": {"1": {"delete": ["targets[0]"]}}}), "InvalidKeyPath"),
            (json!({"panels": {"1": {"set": {"a..b": 1}}}}), "InvalidKeyPath"),
            (json!({"dashboard": {"set": {"panels": []}}}), "InvalidKeyPath"),
            (json!({"bogus": true}), "MalformedPatch"),
        ];
        for (value, kind) in cases {
            let err = patch(value.clone()).unwrap_err();
            assert_eq!(err.kind(), kind, "{value}: {err}");
        }
    }

    #[test]
    fn row_children_can_be_edited_but_not_renumbered() {
        let p = patch(json!({"30": {"set": {"panels[id=19].title": "Guests"}}})).unwrap();
        assert_eq!(p.panels[0].ops.set.len(), 1);

        let err = patch(json!({"30": {"set": {"panels[id=19].id": 99}}})).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid key path 'panels[id=19].id' in panel 30: panel ids are immutable"
        );
    }

    #[test]
    fn path_errors_carry_the_panel_id() {
        let err = patch(json!({"panels": {"12": {"set": {"id": 2}}}})).unwrap_err();
        assert!(err.to_string().contains("in panel 12"), "unexpected err: {err}");
    }

    #[test]
    fn upsert_keeps_template() {
        let p = patch(json!({
            "panels": {"110": {"upsert": true, "template": {"type": "bargauge", "title": "CPU"}}}
        }))
        .unwrap();
        assert_eq!(
            p.panels[0].missing,
            Missing::Create(json!({"type": "bargauge", "title": "CPU"}))
        );
    }

    #[test]
    fn parses_toml_patches() {
        let raw = r#"
name = "two-column-layout"
remove = [101, 102]

[dashboard.set]
title = "Proxmox Overview"

[panels.19.set]
"gridPos" = { h = 8, w = 18, x = 0, y = 0 }
"targets[refId=A].expr" = 'sum by (id) (pve_up{instance="$instance"})'

[[panels.19.overrides]]
matcher = { id = "byName", options = "Status" }
properties = [{ id = "custom.width", value = 80 }]

[panels.9]
optional = true
delete = ["options.legend.calcs"]
"#;
        let p = Patch::parse("layout.toml", raw, PatchFormat::Toml).unwrap();
        assert_eq!(p.name, "two-column-layout");
        assert_eq!(p.remove, vec![101, 102]);
        assert_eq!(p.panels.len(), 2);
        assert_eq!(p.panels[0].id, 9);
        assert_eq!(p.panels[0].missing, Missing::Skip);
        assert_eq!(p.panels[1].ops.set.len(), 2);
        assert_eq!(p.panels[1].overrides[0].properties[0].value, json!(80));
        assert_eq!(
            p.dashboard.as_ref().map(|d| d.set.len()),
            Some(1)
        );
    }

    #[test]
    fn directories_expand_to_sorted_patch_files() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(tmp.path().join("02-second.toml"), "").unwrap();
        fs::write(tmp.path().join("01-first.json"), "{}").unwrap();
        fs::write(tmp.path().join("README.md"), "notes").unwrap();

        let files = expand_sources(&[tmp.path().to_path_buf()]).unwrap();
        let names: Vec<String> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["01-first.json", "02-second.toml"]);

        let patches = load_all(&[tmp.path().to_path_buf()]).unwrap();
        assert_eq!(patches[0].name, "01-first");
        assert_eq!(patches[1].name, "02-second");
        assert!(patches.iter().all(Patch::is_empty));
    }
}
