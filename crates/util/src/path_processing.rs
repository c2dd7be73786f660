use std::path::{Path, PathBuf};

use dirs_next::home_dir;

/// Prefix marking a value that is read from a context field at run time.
pub const FIELD_REFERENCE_PREFIX: char = '$';

/// Placeholder in child file names replaced by the parent file's stem.
pub const PARENT_PLACEHOLDER: &str = "{parent}";

pub fn expand_tilde(path: &str) -> PathBuf {
    let p = path.trim();
    if p == "~" {
        return home_dir().unwrap_or_else(|| PathBuf::from("~"));
    }
    if let Some(rest) = p.strip_prefix("~/") {
        return home_dir().unwrap_or_else(|| PathBuf::from("~")).join(rest);
    }
    PathBuf::from(p)
}

/// Name of the referenced field when `raw` has the form `$field`.
pub fn field_reference(raw: &str) -> Option<&str> {
    raw.strip_prefix(FIELD_REFERENCE_PREFIX).filter(|name| !name.is_empty())
}

/// Resolve a configured name that may be a `$field` reference.
///
/// Returns `None` when the referenced field is not set.
pub fn resolve_reference<F>(raw: &str, lookup: F) -> Option<String>
where
    F: FnOnce(&str) -> Option<String>,
{
    match field_reference(raw) {
        Some(field) => lookup(field),
        None => Some(raw.to_string()),
    }
}

/// Replace `{parent}` with the stem of the parent file name.
pub fn substitute_parent(name: &str, parent_file: Option<&Path>) -> String {
    if !name.contains(PARENT_PLACEHOLDER) {
        return name.to_string();
    }
    let stem = parent_file
        .and_then(|path| path.file_stem())
        .and_then(|stem| stem.to_str())
        .unwrap_or_default();
    name.replace(PARENT_PLACEHOLDER, stem)
}
