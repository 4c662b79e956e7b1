use serde_json::{Map, Value};

use crate::dashboard::{self, Dashboard, PanelId};
use crate::diff;
use crate::error::{Error, Result};
use crate::patch::{Missing, Ops, OverrideRule, Patch};
use crate::path::{KeyPath, Segment};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyReport {
    pub patch: String,
    pub removed: Vec<PanelId>,
    pub created: Vec<PanelId>,
    pub skipped: Vec<PanelId>,
    pub mutated: Vec<PanelId>,
    /// Whether the document differs from the input, key and element order included.
    pub changed: bool,
}

/// Apply `patch` to `doc`, returning the new document. The input is never modified.
pub fn apply(doc: &Dashboard, patch: &Patch) -> Result<Dashboard> {
    apply_with_report(doc, patch).map(|(out, _)| out)
}

/// Like [`apply`], also reporting which panels were touched. Fails with
/// `NonIdempotentPatch` if applying the patch to its own output would change it again.
pub fn apply_with_report(doc: &Dashboard, patch: &Patch) -> Result<(Dashboard, ApplyReport)> {
    let (once, report) = apply_once(doc, patch)?;
    let (twice, _) = apply_once(&once, patch)?;
    if !diff::same(&twice.value, &once.value) {
        let path = diff::diff(&once.value, &twice.value)
            .into_iter()
            .next()
            .map(|c| c.path)
            .unwrap_or_else(|| "<root>".to_string());
        return Err(Error::NonIdempotentPatch {
            patch: patch.name.clone(),
            path,
        });
    }
    Ok((once, report))
}

/// Apply several patches in order, stopping at the first failure.
pub fn apply_all(doc: &Dashboard, patches: &[Patch]) -> Result<(Dashboard, Vec<ApplyReport>)> {
    let mut cur = doc.clone();
    let mut reports = Vec::with_capacity(patches.len());
    for patch in patches {
        let (next, report) = apply_with_report(&cur, patch)?;
        tracing::info!(
            patch = %patch.name,
            changed = report.changed,
            mutated = report.mutated.len(),
            created = report.created.len(),
            removed = report.removed.len(),
            skipped = report.skipped.len(),
            "applied patch"
        );
        cur = next;
        reports.push(report);
    }
    Ok((cur, reports))
}

fn apply_once(doc: &Dashboard, patch: &Patch) -> Result<(Dashboard, ApplyReport)> {
    let mut out = doc.clone();
    let mut report = ApplyReport {
        patch: patch.name.clone(),
        ..ApplyReport::default()
    };

    for &id in &patch.remove {
        if out.remove_panel(id)? {
            tracing::debug!(panel = id, "removed panel");
            report.removed.push(id);
        }
    }

    for m in &patch.panels {
        if !out.contains(m.id) {
            match &m.missing {
                Missing::Fail => return Err(Error::PanelNotFound { id: m.id }),
                Missing::Skip => {
                    tracing::warn!(panel = m.id, patch = %patch.name, "panel not found; skipping");
                    report.skipped.push(m.id);
                    continue;
                }
                Missing::Create(template) => {
                    out.push_panel(instantiate(template, m.id))?;
                    tracing::debug!(panel = m.id, "created panel from template");
                    report.created.push(m.id);
                }
            }
        }

        let panel = out
            .panel_mut(m.id)
            .ok_or(Error::PanelNotFound { id: m.id })?;
        apply_ops(panel, &m.ops).map_err(|e| e.in_panel(m.id))?;
        upsert_overrides(panel, &m.overrides).map_err(|e| e.in_panel(m.id))?;
        report.mutated.push(m.id);
    }

    if let Some(ops) = &patch.dashboard {
        apply_ops(&mut out.value, ops)?;
    }

    // Templates and dashboard-level edits can still collide ids.
    dashboard::validate(&out.path, &out.value)?;
    report.changed = !diff::same(&out.value, &doc.value);
    Ok((out, report))
}

fn instantiate(template: &Value, id: PanelId) -> Value {
    let mut panel = template.clone();
    if let Some(obj) = panel.as_object_mut() {
        obj.insert("id".to_string(), Value::from(id));
    }
    panel
}

/// Delete, then set, then rewrite, each in declaration order.
pub fn apply_ops(root: &mut Value, ops: &Ops) -> Result<()> {
    for path in &ops.delete {
        let removed = path.delete(root)?;
        tracing::debug!(path = %path, removed, "delete");
    }
    for (path, value) in &ops.set {
        path.set(root, value)?;
        tracing::debug!(path = %path, "set");
    }
    for rw in &ops.replace {
        let targets = rw.path.resolve_mut(root)?;
        if targets.is_empty() {
            return Err(Error::invalid_path(
                rw.path.as_str(),
                "nothing to rewrite at this path",
            ));
        }
        for target in targets {
            let Some(current) = target.as_str() else {
                return Err(Error::invalid_path(
                    rw.path.as_str(),
                    format!(
                        "rewrite target is {}, expected a string",
                        crate::path::kind_name(target)
                    ),
                ));
            };
            let next = rw.pattern.replace_all(current, rw.with.as_str()).into_owned();
            let again = rw.pattern.replace_all(&next, rw.with.as_str());
            if again != next {
                return Err(Error::NonIdempotentRewrite {
                    panel: None,
                    path: rw.path.as_str().to_string(),
                    pattern: rw.pattern.as_str().to_string(),
                });
            }
            *target = Value::String(next);
        }
        tracing::debug!(path = %rw.path, pattern = %rw.pattern, "replace");
    }
    Ok(())
}

fn overrides_path() -> KeyPath {
    KeyPath::from_segments(vec![
        Segment::Key("fieldConfig".into()),
        Segment::Key("overrides".into()),
    ])
}

/// Upsert override rules by matcher; within a rule, upsert properties by `id`.
pub fn upsert_overrides(panel: &mut Value, rules: &[OverrideRule]) -> Result<()> {
    if rules.is_empty() {
        return Ok(());
    }
    let path = overrides_path();
    if matches!(path.resolve(panel).first(), None | Some(Value::Null)) {
        path.set(panel, &Value::Array(Vec::new()))?;
    }
    let mut found = path.resolve_mut(panel)?;
    let Some(list) = found.pop().and_then(Value::as_array_mut) else {
        return Err(Error::invalid_path(path.as_str(), "overrides is not an array"));
    };

    for rule in rules {
        let existing = list
            .iter_mut()
            .find(|r| r.get("matcher") == Some(&rule.matcher));
        let Some(existing) = existing else {
            let mut obj = Map::new();
            obj.insert("matcher".to_string(), rule.matcher.clone());
            let props = rule
                .properties
                .iter()
                .map(|p| property_value(&p.id, &p.value))
                .collect();
            obj.insert("properties".to_string(), Value::Array(props));
            list.push(Value::Object(obj));
            continue;
        };

        let Some(obj) = existing.as_object_mut() else {
            return Err(Error::invalid_path(path.as_str(), "override rule is not an object"));
        };
        let props = obj
            .entry("properties".to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if props.is_null() {
            *props = Value::Array(Vec::new());
        }
        let Some(props) = props.as_array_mut() else {
            return Err(Error::invalid_path(
                path.as_str(),
                "override 'properties' is not an array",
            ));
        };
        for p in &rule.properties {
            let slot = props
                .iter_mut()
                .find(|existing| existing.get("id").and_then(Value::as_str) == Some(p.id.as_str()));
            match slot {
                Some(slot) => *slot = property_value(&p.id, &p.value),
                None => props.push(property_value(&p.id, &p.value)),
            }
        }
    }
    Ok(())
}

fn property_value(id: &str, value: &Value) -> Value {
    let mut obj = Map::new();
    obj.insert("id".to_string(), Value::String(id.to_string()));
    obj.insert("value".to_string(), value.clone());
    Value::Object(obj)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use serde_json::json;

    use super::*;

    fn dash(value: Value) -> Dashboard {
        Dashboard::from_value(Path::new("<mem>"), value).expect("valid dashboard")
    }

    fn patch(value: Value) -> Patch {
        Patch::from_value("test", value).expect("valid patch")
    }

    fn sample() -> Dashboard {
        dash(json!({
            "title": "Proxmox",
            "panels": [
                {"id": 7, "type": "gauge", "title": "CPU", "targets": [{"refId": "A", "expr": "cpu"}]},
                {"id": 19, "type": "table", "title": "Guests ", "fieldConfig": {"defaults": {}, "overrides": [
                    {"matcher": {"id": "byName", "options": "Status"}, "properties": [{"id": "custom.width", "value": 60}]}
                ]}}
            ]
        }))
    }

    #[test]
    fn sets_and_deletes_within_one_panel() {
        let out = apply(
            &sample(),
            &patch(json!({"7": {
                "set": {"type": "stat", "options.graphMode": "none"},
                "delete": ["targets[refId=A]"]
            }})),
        )
        .unwrap();
        let p = out.panel(7).unwrap();
        assert_eq!(p["type"], json!("stat"));
        assert_eq!(p["options"], json!({"graphMode": "none"}));
        assert_eq!(p["targets"], json!([]));
        assert_eq!(out.panel(19), sample().panel(19));
    }

    #[test]
    fn missing_panel_fails_unless_optional_or_upsert() {
        let err = apply(&sample(), &patch(json!({"99": {"set": {"type": "stat"}}}))).unwrap_err();
        assert!(matches!(err, Error::PanelNotFound { id: 99 }));

        let (out, report) = apply_with_report(
            &sample(),
            &patch(json!({"panels": {"99": {"optional": true, "set": {"type": "stat"}}}})),
        )
        .unwrap();
        assert_eq!(out, sample());
        assert_eq!(report.skipped, vec![99]);
        assert!(!report.changed);

        let (out, report) = apply_with_report(
            &sample(),
            &patch(json!({"panels": {"99": {
                "upsert": true,
                "template": {"id": 1, "type": "bargauge", "gridPos": {"x": 18, "y": 0, "w": 6, "h": 4}},
                "set": {"title": "Storage"}
            }}})),
        )
        .unwrap();
        assert_eq!(report.created, vec![99]);
        assert_eq!(
            out.panel(99),
            Some(&json!({"id": 99, "type": "bargauge", "gridPos": {"x": 18, "y": 0, "w": 6, "h": 4}, "title": "Storage"}))
        );
    }

    #[test]
    fn remove_then_upsert_recreates_from_template() {
        let p = patch(json!({
            "remove": [7],
            "panels": {"7": {"upsert": true, "template": {"type": "stat", "title": "CPU"}}}
        }));
        let once = apply(&sample(), &p).unwrap();
        assert_eq!(once.panel(7), Some(&json!({"type": "stat", "title": "CPU", "id": 7})));
        assert_eq!(apply(&once, &p).unwrap(), once);
    }

    #[test]
    fn rewrite_applies_regex_and_rejects_growth() {
        let out = apply(
            &sample(),
            &patch(json!({"19": {"replace": [{"path": "title", "pattern": "\\s+$", "with": ""}]}})),
        )
        .unwrap();
        assert_eq!(out.panel(19).unwrap()["title"], json!("Guests"));

        let err = apply(
            &sample(),
            &patch(json!({"7": {"replace": [{"path": "targets[*].expr", "pattern": "cpu", "with": "cpu_cpu"}]}})),
        )
        .unwrap_err();
        assert!(matches!(err, Error::NonIdempotentRewrite { panel: Some(7), .. }), "{err}");

        let err = apply(
            &sample(),
            &patch(json!({"7": {"replace": [{"path": "description", "pattern": "x"}]}})),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "InvalidKeyPath");
    }

    #[test]
    fn overrides_upsert_by_matcher_and_property_id() {
        let p = patch(json!({"19": {"overrides": [
            {"matcher": {"id": "byName", "options": "Status"}, "properties": [
                {"id": "custom.width", "value": 80},
                {"id": "custom.align", "value": "center"}
            ]},
            {"matcher": {"id": "byName", "options": "Name"}, "properties": [{"id": "custom.width", "value": 200}]}
        ]}}));
        let out = apply(&sample(), &p).unwrap();
        assert_eq!(
            out.panel(19).unwrap()["fieldConfig"]["overrides"],
            json!([
                {"matcher": {"id": "byName", "options": "Status"}, "properties": [
                    {"id": "custom.width", "value": 80},
                    {"id": "custom.align", "value": "center"}
                ]},
                {"matcher": {"id": "byName", "options": "Name"}, "properties": [{"id": "custom.width", "value": 200}]}
            ])
        );
        assert_eq!(apply(&out, &p).unwrap(), out);
    }

    #[test]
    fn overrides_are_created_when_fieldconfig_is_missing() {
        let p = patch(json!({"7": {"overrides": [
            {"matcher": {"id": "byName", "options": "Value"}, "properties": [{"id": "unit", "value": "percentunit"}]}
        ]}}));
        let out = apply(&sample(), &p).unwrap();
        assert_eq!(
            out.panel(7).unwrap()["fieldConfig"],
            json!({"overrides": [
                {"matcher": {"id": "byName", "options": "Value"}, "properties": [{"id": "unit", "value": "percentunit"}]}
            ]})
        );
    }

    #[test]
    fn dashboard_level_ops_touch_only_top_level_fields() {
        let out = apply(
            &sample(),
            &patch(json!({"dashboard": {"set": {"title": "Proxmox Overview", "refresh": "30s"}}})),
        )
        .unwrap();
        assert_eq!(out.title(), Some("Proxmox Overview"));
        assert_eq!(out.value["panels"], sample().value["panels"]);
    }

    #[test]
    fn order_dependent_patches_are_rejected() {
        // The selector matches nothing once the wildcard rewrites every refId.
        let p = patch(json!({"7": {"set": {
            "targets[refId=B].expr": "mem",
            "targets[*].refId": "C"
        }}}));
        let err = apply(&sample(), &p).unwrap_err();
        assert!(matches!(err, Error::NonIdempotentPatch { .. }), "{err}");
    }

    #[test]
    fn template_with_colliding_nested_ids_is_malformed() {
        let p = patch(json!({"panels": {"50": {
            "upsert": true,
            "template": {"type": "row", "panels": [{"id": 7}]}
        }}}));
        let err = apply(&sample(), &p).unwrap_err();
        assert_eq!(err.kind(), "MalformedDocument");
    }

    #[test]
    fn apply_all_threads_documents_in_order() {
        let first = patch(json!({"7": {"set": {"type": "gauge"}}}));
        let second = patch(json!({"7": {"set": {"type": "stat"}}}));
        let (out, reports) = apply_all(&sample(), &[first, second]).unwrap();
        assert_eq!(out.panel(7).unwrap()["type"], json!("stat"));
        assert_eq!(reports.len(), 2);
        assert!(!reports[0].changed);
        assert!(reports[1].changed);
    }

    #[test]
    fn rebuilding_a_panel_moves_it_and_counts_as_a_change() {
        let p = patch(json!({
            "remove": [7],
            "panels": {"7": {"upsert": true, "template": {"type": "stat"}}}
        }));
        let before = sample();
        let (out, report) = apply_with_report(&before, &p).unwrap();
        assert!(report.changed);
        assert_eq!(out.panel_ids(), vec![19, 7]);

        let changes = diff::diff(&before.value, &out.value);
        assert_eq!(changes[0].kind, diff::ChangeKind::Reordered);
        assert_eq!(changes[0].path, "panels");

        let (_, again) = apply_with_report(&out, &p).unwrap();
        assert!(!again.changed);
    }
}
