use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config::OutputConfig;
use crate::error::{Error, Result};

pub type PanelId = i64;

#[derive(Debug, Clone, PartialEq)]
pub struct Dashboard {
    pub path: PathBuf,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridPos {
    pub x: i64,
    pub y: i64,
    pub w: i64,
    pub h: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PanelSummary {
    pub id: Option<PanelId>,
    pub kind: String,
    pub title: String,
    pub grid: Option<GridPos>,
    /// Id of the collapsed row this panel is nested in.
    pub row: Option<PanelId>,
}

fn panel_id_of(panel: &Value) -> Option<PanelId> {
    panel.get("id").and_then(Value::as_i64)
}

fn nested_panels(panel: &Value) -> Option<&Vec<Value>> {
    panel.get("panels").and_then(Value::as_array)
}

fn grid_of(panel: &Value) -> Option<GridPos> {
    let g = panel.get("gridPos")?.as_object()?;
    let get = |k: &str| g.get(k).and_then(Value::as_i64).unwrap_or(0);
    Some(GridPos {
        x: get("x"),
        y: get("y"),
        w: get("w"),
        h: get("h"),
    })
}

/// Validate the panel collection: `panels` is an array of objects, ids are integers and unique
/// across top-level panels and collapsed-row children.
pub fn validate(path: &Path, value: &Value) -> Result<()> {
    let Some(root) = value.as_object() else {
        return Err(Error::malformed_document(
            path,
            "top-level value is not an object",
        ));
    };
    let Some(panels) = root.get("panels") else {
        return Err(Error::malformed_document(path, "missing 'panels' array"));
    };
    let Some(panels) = panels.as_array() else {
        return Err(Error::malformed_document(path, "'panels' is not an array"));
    };

    let mut seen = BTreeSet::<PanelId>::new();
    let mut check = |panel: &Value, place: &str| -> Result<()> {
        let Some(obj) = panel.as_object() else {
            return Err(Error::malformed_document(
                path,
                format!("{place} contains a panel that is not an object"),
            ));
        };
        let Some(raw_id) = obj.get("id") else {
            return Ok(());
        };
        let Some(id) = raw_id.as_i64() else {
            return Err(Error::malformed_document(
                path,
                format!("{place} contains a panel with non-integer id {raw_id}"),
            ));
        };
        if !seen.insert(id) {
            return Err(Error::malformed_document(
                path,
                format!("duplicate panel id {id}"),
            ));
        }
        Ok(())
    };

    for panel in panels {
        check(panel, "'panels'")?;
        if let Some(children) = panel.get("panels") {
            let Some(children) = children.as_array() else {
                return Err(Error::malformed_document(
                    path,
                    format!(
                        "row panel {} has a 'panels' value that is not an array",
                        panel_id_of(panel).map_or_else(|| "?".to_string(), |id| id.to_string())
                    ),
                ));
            };
            for child in children {
                check(child, "a row's 'panels'")?;
            }
        }
    }
    Ok(())
}

impl Dashboard {
    pub fn from_value(path: &Path, value: Value) -> Result<Self> {
        validate(path, &value)?;
        Ok(Self {
            path: path.to_path_buf(),
            value,
        })
    }

    pub fn parse(path: &Path, raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| Error::malformed_document(path, format!("invalid JSON: {e}")))?;
        Self::from_value(path, value)
    }

    pub fn title(&self) -> Option<&str> {
        self.value.get("title").and_then(Value::as_str)
    }

    fn panels(&self) -> &[Value] {
        self.value
            .get("panels")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    fn panels_mut(&mut self) -> Result<&mut Vec<Value>> {
        let path = self.path.clone();
        self.value
            .get_mut("panels")
            .and_then(Value::as_array_mut)
            .ok_or_else(|| Error::malformed_document(&path, "'panels' is not an array"))
    }

    /// Position of a panel: top-level index, plus the child index inside a collapsed row.
    fn locate(&self, id: PanelId) -> Option<(usize, Option<usize>)> {
        for (i, panel) in self.panels().iter().enumerate() {
            if panel_id_of(panel) == Some(id) {
                return Some((i, None));
            }
            if let Some(j) =
                nested_panels(panel).and_then(|c| c.iter().position(|p| panel_id_of(p) == Some(id)))
            {
                return Some((i, Some(j)));
            }
        }
        None
    }

    pub fn panel(&self, id: PanelId) -> Option<&Value> {
        let (i, j) = self.locate(id)?;
        let top = self.panels().get(i)?;
        match j {
            None => Some(top),
            Some(j) => nested_panels(top)?.get(j),
        }
    }

    pub fn panel_mut(&mut self, id: PanelId) -> Option<&mut Value> {
        let (i, j) = self.locate(id)?;
        let top = self.value.get_mut("panels")?.as_array_mut()?.get_mut(i)?;
        match j {
            None => Some(top),
            Some(j) => top.get_mut("panels")?.as_array_mut()?.get_mut(j),
        }
    }

    pub fn contains(&self, id: PanelId) -> bool {
        self.panel(id).is_some()
    }

    pub fn panel_ids(&self) -> Vec<PanelId> {
        self.summaries().into_iter().filter_map(|s| s.id).collect()
    }

    /// Top-level panels in document order, each followed by its collapsed-row children.
    pub fn summaries(&self) -> Vec<PanelSummary> {
        let mut out = Vec::new();
        let describe = |panel: &Value, row: Option<PanelId>| PanelSummary {
            id: panel_id_of(panel),
            kind: panel
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
            title: panel
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
            grid: grid_of(panel),
            row,
        };
        for panel in self.panels() {
            out.push(describe(panel, None));
            if let Some(children) = nested_panels(panel) {
                let row = panel_id_of(panel);
                out.extend(children.iter().map(|c| describe(c, row)));
            }
        }
        out
    }

    /// Drop a panel wherever it lives. Returns whether anything was removed.
    pub fn remove_panel(&mut self, id: PanelId) -> Result<bool> {
        let panels = self.panels_mut()?;
        let before = panels.len();
        panels.retain(|p| panel_id_of(p) != Some(id));
        if panels.len() != before {
            return Ok(true);
        }
        for panel in panels.iter_mut() {
            if let Some(children) = panel.get_mut("panels").and_then(Value::as_array_mut) {
                let before = children.len();
                children.retain(|p| panel_id_of(p) != Some(id));
                if children.len() != before {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    pub fn push_panel(&mut self, panel: Value) -> Result<()> {
        self.panels_mut()?.push(panel);
        Ok(())
    }

    pub fn to_json_string(&self, out: &OutputConfig) -> Result<String> {
        let indent = " ".repeat(out.indent);
        let formatter = serde_json::ser::PrettyFormatter::with_indent(indent.as_bytes());
        let mut buf = Vec::new();
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        self.value
            .serialize(&mut ser)
            .map_err(|e| Error::msg(format!("json encode error: {e}")))?;
        if out.trailing_newline {
            buf.push(b'\n');
        }
        String::from_utf8(buf).map_err(|e| Error::msg(format!("json encode error: {e}")))
    }

    pub fn digest(&self, out: &OutputConfig) -> Result<String> {
        Ok(sha256_hex(self.to_json_string(out)?.as_bytes()))
    }

    /// Serialize and atomically replace `path`.
    pub fn save(&self, path: &Path, out: &OutputConfig) -> Result<()> {
        let body = self.to_json_string(out)?;
        atomic_write_text(path, &body)
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Read a dashboard file as text. Bytes that are not UTF-8 cannot be JSON, so they are a
/// malformed document rather than an I/O failure.
pub fn read_text(path: &Path) -> Result<String> {
    let bytes = fs::read(path).map_err(|e| Error::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    String::from_utf8(bytes).map_err(|e| {
        Error::malformed_document(
            path,
            format!("invalid UTF-8 at byte {}", e.utf8_error().valid_up_to()),
        )
    })
}

pub fn load(path: &Path) -> Result<Dashboard> {
    let raw = read_text(path)?;
    let doc = Dashboard::parse(path, &raw)?;
    tracing::debug!(
        path = %path.display(),
        panels = doc.panel_ids().len(),
        "loaded dashboard"
    );
    Ok(doc)
}

pub fn save(doc: &Dashboard, path: &Path, out: &OutputConfig) -> Result<()> {
    doc.save(path, out)
}

#[cfg(unix)]
const NEW_FILE_MODE: u32 = 0o666;

/// Write to a temp file next to `path`, then rename over it. The original is untouched until
/// the rename succeeds.
pub fn atomic_write_text(path: &Path, body: &str) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| Error::write_failure(path, "path has no file name"))?;

    let prefix = format!(".{file_name}.");
    let mut builder = tempfile::Builder::new();
    builder.prefix(&prefix).suffix(".tmp");
    // New targets get the mode a plain `fs::write` would give them (0666 under the umask)
    // instead of the temp file's private 0600.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        builder.permissions(fs::Permissions::from_mode(NEW_FILE_MODE));
    }
    let mut tmp = builder
        .tempfile_in(&parent)
        .map_err(|e| {
            Error::write_failure(
                path,
                format!("failed to create temp file in {}: {e}", parent.display()),
            )
        })?;

    tmp.write_all(body.as_bytes())
        .map_err(|e| Error::write_failure(path, format!("failed to write temp file: {e}")))?;
    if let Ok(meta) = fs::metadata(path) {
        tmp.as_file()
            .set_permissions(meta.permissions())
            .map_err(|e| Error::write_failure(path, format!("failed to copy permissions: {e}")))?;
    }
    tmp.as_file()
        .sync_all()
        .map_err(|e| Error::write_failure(path, format!("failed to sync temp file: {e}")))?;

    tmp.persist(path).map_err(|e| {
        Error::write_failure(
            path,
            format!("failed to rename {} into place: {}", e.file.path().display(), e.error),
        )
    })?;
    tracing::debug!(path = %path.display(), bytes = body.len(), "wrote dashboard");
    Ok(())
}
