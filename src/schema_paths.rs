//! Purpose: Shared schema-directory and schema-name path resolution helpers.
//! Exports: `default_schema_dir` and `resolve_named_schema_path`.
//! Role: Keep CLI and registry lookup semantics aligned from one source.
//! Invariants: Default schema directory is `$TRE_SCHEMA_DIR`, else `~/.tre/schemas`.
//! Invariants: Named schema refs must not contain path separators.

use std::path::{Path, PathBuf};

pub(crate) const SCHEMA_DIR_ENV: &str = "TRE_SCHEMA_DIR";

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum SchemaNameResolveError {
    Empty,
    ContainsPathSeparator,
}

pub(crate) fn default_schema_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(SCHEMA_DIR_ENV).filter(|dir| !dir.is_empty()) {
        return PathBuf::from(dir);
    }
    let home = std::env::var_os("HOME").unwrap_or_default();
    PathBuf::from(home).join(".tre").join("schemas")
}

pub(crate) fn resolve_named_schema_path(
    name: &str,
    schema_dir: &Path,
) -> Result<PathBuf, SchemaNameResolveError> {
    if name.is_empty() {
        return Err(SchemaNameResolveError::Empty);
    }
    if name.contains('/') || name.contains('\\') {
        return Err(SchemaNameResolveError::ContainsPathSeparator);
    }
    if name.ends_with(".json") {
        return Ok(schema_dir.join(name));
    }
    Ok(schema_dir.join(format!("{name}.json")))
}

#[cfg(test)]
mod tests {
    use super::{resolve_named_schema_path, SchemaNameResolveError};
    use std::path::Path;

    #[test]
    fn names_gain_json_extension() {
        let dir = Path::new("/schemas");
        assert_eq!(
            resolve_named_schema_path("BANDSA", dir).expect("name"),
            dir.join("BANDSA.json")
        );
        assert_eq!(
            resolve_named_schema_path("BANDSA.json", dir).expect("name"),
            dir.join("BANDSA.json")
        );
    }

    #[test]
    fn separators_and_empty_names_are_rejected() {
        let dir = Path::new("/schemas");
        assert_eq!(
            resolve_named_schema_path("a/b", dir),
            Err(SchemaNameResolveError::ContainsPathSeparator)
        );
        assert_eq!(
            resolve_named_schema_path("", dir),
            Err(SchemaNameResolveError::Empty)
        );
    }
}
