//! Purpose: Resolve compiled schemas by record type tag.
//! Exports: `SchemaRegistry`, `SchemaRef`.
//! Role: The "handler for tag X" lookup used by the engine, CLI, and bindings.
//! Invariants: One schema per tag; re-registering identical content is a no-op.
//! Invariants: Schema name resolution matches the CLI (`<dir>/<name>.json`).
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use super::source::{parse_schema_json, SchemaSource};
use crate::core::error::{Error, ErrorKind};
use crate::core::schema::Schema;
use crate::schema_paths::{default_schema_dir, resolve_named_schema_path, SchemaNameResolveError};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SchemaRef {
    Name(String),
    Path(PathBuf),
}

impl SchemaRef {
    pub fn name(name: impl Into<String>) -> Self {
        Self::Name(name.into())
    }

    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self::Path(path.into())
    }

    /// Treats anything with a separator or a `.json` suffix as a path.
    pub fn parse(input: &str) -> Self {
        if input.contains('/') || input.contains('\\') || input.ends_with(".json") {
            Self::Path(PathBuf::from(input))
        } else {
            Self::Name(input.to_string())
        }
    }

    fn resolve_path(&self, schema_dir: &Path) -> Result<PathBuf, Error> {
        match self {
            SchemaRef::Path(path) => Ok(path.clone()),
            SchemaRef::Name(name) => {
                resolve_named_schema_path(name, schema_dir).map_err(|err| match err {
                    SchemaNameResolveError::Empty => {
                        Error::new(ErrorKind::Usage).with_message("schema name is empty")
                    }
                    SchemaNameResolveError::ContainsPathSeparator => Error::new(ErrorKind::Usage)
                        .with_message("schema name must not contain path separators")
                        .with_hint("pass a path ending in .json to load a file directly"),
                })
            }
        }
    }
}

#[derive(Debug)]
pub struct SchemaRegistry {
    schemas: Mutex<HashMap<String, Arc<Schema>>>,
    schema_dir: PathBuf,
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self {
            schemas: Mutex::new(HashMap::new()),
            schema_dir: default_schema_dir(),
        }
    }

    pub fn with_schema_dir(mut self, schema_dir: impl Into<PathBuf>) -> Self {
        self.schema_dir = schema_dir.into();
        self
    }

    pub fn schema_dir(&self) -> &Path {
        &self.schema_dir
    }

    pub fn register(&self, schema: Schema) -> Result<Arc<Schema>, Error> {
        let mut schemas = self.schemas.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = schemas.get(schema.tag()) {
            if existing.fingerprint() == schema.fingerprint() {
                return Ok(Arc::clone(existing));
            }
            return Err(Error::new(ErrorKind::DuplicateTag)
                .with_message("a different schema is already registered for this tag")
                .with_tag(schema.tag().to_string())
                .with_hint("unregister the old schema first"));
        }
        tracing::debug!(tre = schema.tag(), fingerprint = schema.fingerprint(), "registered schema");
        let schema = Arc::new(schema);
        schemas.insert(schema.tag().to_string(), Arc::clone(&schema));
        Ok(schema)
    }

    pub fn register_source(&self, source: &SchemaSource) -> Result<Arc<Schema>, Error> {
        self.register(source.compile()?)
    }

    pub fn register_json(&self, text: &str, default_tag: Option<&str>) -> Result<Arc<Schema>, Error> {
        self.register_source(&parse_schema_json(text, default_tag)?)
    }

    /// Reads, compiles, and registers a schema file; a bare array takes its tag from the file stem.
    pub fn load(&self, schema_ref: &SchemaRef) -> Result<Arc<Schema>, Error> {
        let path = schema_ref.resolve_path(&self.schema_dir)?;
        let text = std::fs::read_to_string(&path).map_err(|err| {
            let kind = if err.kind() == std::io::ErrorKind::NotFound {
                ErrorKind::NotFound
            } else {
                ErrorKind::Io
            };
            Error::new(kind)
                .with_message("failed to read schema")
                .with_hint(path.display().to_string())
                .with_source(err)
        })?;
        let stem = path.file_stem().and_then(|stem| stem.to_str());
        self.register_json(&text, stem)
    }

    pub fn resolve(&self, tag: &str) -> Result<Arc<Schema>, Error> {
        self.schemas
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tag)
            .cloned()
            .ok_or_else(|| {
                Error::new(ErrorKind::NotFound)
                    .with_message("no schema registered for record type")
                    .with_tag(tag.to_string())
            })
    }

    pub fn unregister(&self, tag: &str) -> Option<Arc<Schema>> {
        self.schemas
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(tag)
    }

    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self
            .schemas
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        tags.sort();
        tags
    }
}

#[cfg(test)]
mod tests {
    use super::{SchemaRef, SchemaRegistry};
    use crate::core::error::ErrorKind;
    use crate::core::schema::{compile, FieldDescriptor as F};
    use std::path::PathBuf;

    #[test]
    fn identical_registration_is_idempotent() {
        let registry = SchemaRegistry::new();
        let a = registry
            .register(compile("T", &[F::text("A", 1), F::end()]).expect("compile"))
            .expect("first");
        let b = registry
            .register(compile("T", &[F::text("A", 1), F::end()]).expect("compile"))
            .expect("second");
        assert!(std::sync::Arc::ptr_eq(&a, &b));

        let err = registry
            .register(compile("T", &[F::text("A", 2), F::end()]).expect("compile"))
            .expect_err("conflict");
        assert_eq!(err.kind(), ErrorKind::DuplicateTag);
        assert_eq!(registry.tags(), ["T"]);
    }

    #[test]
    fn resolve_unknown_is_not_found() {
        let registry = SchemaRegistry::new();
        assert_eq!(registry.resolve("NOPE").expect_err("missing").kind(), ErrorKind::NotFound);
    }

    #[test]
    fn schema_refs_parse_names_and_paths() {
        assert_eq!(SchemaRef::parse("BANDSA"), SchemaRef::name("BANDSA"));
        assert_eq!(SchemaRef::parse("./x.json"), SchemaRef::path(PathBuf::from("./x.json")));
        assert_eq!(SchemaRef::parse("x.json"), SchemaRef::path(PathBuf::from("x.json")));
    }

    #[test]
    fn load_by_name_from_schema_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("BLOB.json"),
            r#"[{"kind":"text","tag":"X","count":2},{"kind":"end"}]"#,
        )
        .expect("write");
        let registry = SchemaRegistry::new().with_schema_dir(dir.path());
        let schema = registry.load(&SchemaRef::name("BLOB")).expect("load");
        assert_eq!(schema.tag(), "BLOB");
        assert!(registry.resolve("BLOB").is_ok());

        let err = registry.load(&SchemaRef::name("MISSING")).expect_err("missing");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
