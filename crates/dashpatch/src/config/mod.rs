use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use toml::Value;

use crate::error::{Error, Result};

pub const DEFAULT_CONFIG_FILE: &str = "dashpatch.toml";
pub const CONFIG_ENV: &str = "DASHPATCH_CONFIG";

fn default_indent() -> usize {
    2
}

fn default_true() -> bool {
    true
}

fn default_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutputConfig {
    #[serde(default = "default_indent")]
    pub indent: usize,
    #[serde(default = "default_true")]
    pub trailing_newline: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            indent: default_indent(),
            trailing_newline: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    #[serde(default = "default_level")]
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApplyConfig {
    /// Leave the dashboard file alone when the patched bytes equal what is on disk.
    #[serde(default = "default_true")]
    pub skip_unchanged: bool,
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            skip_unchanged: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub output: OutputConfig,
    pub log: LogConfig,
    pub apply: ApplyConfig,
}

fn merge_values(base: &mut Value, child: Value) {
    match (base, child) {
        (Value::Table(base_tbl), Value::Table(child_tbl)) => {
            for (k, v) in child_tbl {
                match base_tbl.get_mut(&k) {
                    Some(existing) => merge_values(existing, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        (base_slot, child_val) => {
            *base_slot = child_val;
        }
    }
}

fn resolve_ref_path(from_file: &Path, reference: &str) -> PathBuf {
    let p = PathBuf::from(reference);
    if p.is_absolute() {
        p
    } else {
        from_file.parent().unwrap_or_else(|| Path::new(".")).join(p)
    }
}

fn config_err(path: &Path, reason: impl Into<String>) -> Error {
    Error::Config {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

fn load_value_inner(path: &Path, stack: &mut HashSet<PathBuf>) -> Result<Value> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !stack.insert(canonical.clone()) {
        return Err(config_err(
            &canonical,
            "config extends cycle detected".to_string(),
        ));
    }

    let data = fs::read_to_string(path).map_err(|e| Error::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let mut value: Value =
        toml::from_str(&data).map_err(|e| config_err(path, format!("TOML parse error: {e}")))?;

    // Single-parent extends; the child's keys win.
    let mut out = Value::Table(Default::default());
    if let Some(ext) = value.get("extends") {
        let Some(ext) = ext.as_str() else {
            return Err(config_err(path, "'extends' must be a string"));
        };
        let base_path = resolve_ref_path(path, ext);
        out = load_value_inner(&base_path, stack)?;
    }
    if let Some(tbl) = value.as_table_mut() {
        tbl.remove("extends");
    }

    merge_values(&mut out, value);

    stack.remove(&canonical);
    Ok(out)
}

pub fn load(path: &Path) -> Result<Settings> {
    let mut stack = HashSet::<PathBuf>::new();
    let value = load_value_inner(path, &mut stack)?;
    value
        .try_into()
        .map_err(|e| config_err(path, format!("invalid settings: {e}")))
}

/// Pick the settings file: explicit flag, then `$DASHPATCH_CONFIG`, then `./dashpatch.toml`
/// if it exists. No file at all means defaults.
pub fn discover(explicit: Option<&Path>) -> Result<Settings> {
    if let Some(p) = explicit {
        return load(p);
    }
    if let Ok(p) = std::env::var(CONFIG_ENV) {
        let p = p.trim();
        if !p.is_empty() {
            return load(Path::new(p));
        }
    }
    let local = Path::new(DEFAULT_CONFIG_FILE);
    if local.is_file() {
        return load(local);
    }
    Ok(Settings::default())
}
